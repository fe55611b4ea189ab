//! Exercises the judge's fallback parsing path end-to-end: a judge model
//! that returns a single clean line instead of JSON still yields a
//! partially-parsed, persisted verdict rather than a hard failure.

use async_trait::async_trait;
use std::sync::Arc;
use storybench::battery::{BatteryVersion, Criterion, Prompt, Sequence, StaticContentSource};
use storybench::driver::PipelineDriver;
use storybench::error::Result;
use storybench::generator::{GenerateOutput, Generator};
use storybench::judge::JudgeModel;
use storybench::model::{ModelSpec, ModelsFile, ProviderLimits, RunSettings};
use storybench::store::{ArtifactStore, SqliteArtifactStore};
use storybench::worker::tokio_util_cancel::CancellationToken;

/// Generator that answers normally for generation calls, but returns a
/// single scored line (missing the second criterion) when asked to act
/// as the judge model.
struct PartialJudgeGenerator;

#[async_trait]
impl Generator for PartialJudgeGenerator {
    async fn generate(
        &self,
        provider_model_name: &str,
        context: &str,
        max_output_tokens: u32,
        _temperature: f64,
    ) -> Result<GenerateOutput> {
        if provider_model_name == "judge-v1" {
            Ok(GenerateOutput {
                text: "coherence: 7.5\n(creativity left unscored this time)".to_string(),
                input_tokens: 10,
                output_tokens: 10,
            })
        } else {
            Ok(GenerateOutput {
                text: format!("story continuing from: {context}"),
                input_tokens: 5,
                output_tokens: 5.min(max_output_tokens),
            })
        }
    }

    fn tokenize_len(&self, _provider_model_name: &str, text: &str) -> Result<u32> {
        Ok(text.split_whitespace().count() as u32)
    }
}

fn battery_with_two_criteria() -> BatteryVersion {
    BatteryVersion {
        version_id: "v1".to_string(),
        sequences: vec![Sequence {
            name: "seq".to_string(),
            prompts: vec![Prompt {
                name: "opening".to_string(),
                text: "begin".to_string(),
            }],
        }],
        criteria: vec![
            Criterion {
                name: "coherence".to_string(),
                description: "d".to_string(),
                scale_min: 0.0,
                scale_max: 10.0,
            },
            Criterion {
                name: "creativity".to_string(),
                description: "d".to_string(),
                scale_min: 0.0,
                scale_max: 10.0,
            },
        ],
    }
}

#[tokio::test]
async fn partial_verdict_is_still_persisted_with_fully_parsed_false() {
    let content_source = Arc::new(StaticContentSource::new(battery_with_two_criteria()));
    let generator = Arc::new(PartialJudgeGenerator);
    let store = Arc::new(SqliteArtifactStore::open_in_memory().unwrap());

    let models_file = ModelsFile {
        models: vec![ModelSpec {
            model_id: "story-model".to_string(),
            provider_tag: "prov".to_string(),
            provider_model_name: "story-v1".to_string(),
            context_window: 4096,
            max_output_tokens: 256,
            temperature: 1.0,
            safety_margin_tokens: 0,
        }],
        provider_limits: vec![ProviderLimits {
            provider_tag: "prov".to_string(),
            max_concurrency: 2,
            failure_threshold: 5,
            open_duration_secs: 30,
        }],
        settings: RunSettings {
            runs_per_sequence: 1,
            ..Default::default()
        },
    };

    let driver = PipelineDriver::new(
        content_source,
        generator,
        store.clone(),
        JudgeModel {
            provider_tag: "prov".to_string(),
            provider_model_name: "judge-v1".to_string(),
        },
    );

    let cancel = CancellationToken::new();
    let outcome = driver
        .run("partial-run", &models_file, None, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.responses.len(), 1);
    let response = &outcome.responses[0];
    let verdict = store
        .get_verdict(&response.task_key, "prov:judge-v1", "v1")
        .await
        .unwrap()
        .expect("verdict should be persisted even when partially parsed");

    assert!(!verdict.fully_parsed);
    assert_eq!(verdict.parsed_scores.get("coherence"), Some(&7.5));
    assert!(!verdict.parsed_scores.contains_key("creativity"));
}
