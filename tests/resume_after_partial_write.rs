//! Simulates a crash mid-sequence: one response artifact already exists
//! before the driver is invoked. Resuming must pick up from the second
//! prompt rather than regenerating the first.

use chrono::Utc;
use std::sync::Arc;
use storybench::battery::{BatteryVersion, Criterion, Prompt, Sequence, StaticContentSource};
use storybench::driver::PipelineDriver;
use storybench::generator::EchoGenerator;
use storybench::judge::JudgeModel;
use storybench::model::{ModelSpec, ModelsFile, ProviderLimits, RunSettings};
use storybench::store::{ArtifactStore, ResponseArtifact, SqliteArtifactStore, TaskKey};
use storybench::worker::tokio_util_cancel::CancellationToken;

fn battery() -> BatteryVersion {
    BatteryVersion {
        version_id: "v1".to_string(),
        sequences: vec![Sequence {
            name: "seq".to_string(),
            prompts: vec![
                Prompt {
                    name: "opening".to_string(),
                    text: "begin".to_string(),
                },
                Prompt {
                    name: "continuation".to_string(),
                    text: "continue".to_string(),
                },
            ],
        }],
        criteria: vec![Criterion {
            name: "coherence".to_string(),
            description: "d".to_string(),
            scale_min: 0.0,
            scale_max: 10.0,
        }],
    }
}

fn models_file() -> ModelsFile {
    ModelsFile {
        models: vec![ModelSpec {
            model_id: "echo-model".to_string(),
            provider_tag: "echo".to_string(),
            provider_model_name: "echo-v1".to_string(),
            context_window: 4096,
            max_output_tokens: 256,
            temperature: 1.0,
            safety_margin_tokens: 0,
        }],
        provider_limits: vec![ProviderLimits {
            provider_tag: "echo".to_string(),
            max_concurrency: 2,
            failure_threshold: 5,
            open_duration_secs: 30,
        }],
        settings: RunSettings {
            runs_per_sequence: 1,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn resume_skips_already_persisted_prompt() {
    let store = Arc::new(SqliteArtifactStore::open_in_memory().unwrap());
    store.create_run("resume-run", &battery()).await.unwrap();

    let pre_existing = ResponseArtifact {
        task_key: TaskKey {
            run_id: "resume-run".to_string(),
            model_id: "echo-model".to_string(),
            sequence_name: "seq".to_string(),
            run_index: 0,
            prompt_index: 0,
        },
        text: "a pre-crash opening line".to_string(),
        input_tokens: 4,
        output_tokens: 5,
        assembled_context_snapshot: String::new(),
        prompt_text_snapshot: "begin".to_string(),
        created_at: Utc::now(),
    };
    store.put_response(&pre_existing).await.unwrap();

    let content_source = Arc::new(StaticContentSource::new(battery()));
    let generator = Arc::new(EchoGenerator);
    let driver = PipelineDriver::new(
        content_source,
        generator,
        store.clone(),
        JudgeModel {
            provider_tag: "echo".to_string(),
            provider_model_name: "echo-v1".to_string(),
        },
    );

    let cancel = CancellationToken::new();
    let outcome = driver
        .run("resume-run", &models_file(), None, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.responses.len(), 2);
    let opening = outcome
        .responses
        .iter()
        .find(|r| r.task_key.prompt_index == 0)
        .unwrap();
    assert_eq!(opening.text, "a pre-crash opening line");
}
