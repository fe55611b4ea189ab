//! Pipeline Driver: top-level orchestration for one run.
//!
//! Runs through two phases per run: generate (fan workers out per model,
//! then aggregate) and score (hand completed responses to the judge
//! pass). Cross-model parallelism is bounded by
//! `RunSettings::model_concurrency` rather than left unbounded.

use crate::battery::{BatteryVersion, ContentSource};
use crate::error::Result;
use crate::generator::Generator;
use crate::governor::RateGovernor;
use crate::judge::{JudgeModel, JudgePass};
use crate::model::{ModelSpec, ModelsFile};
use crate::progress::SharedProgressMonitor;
use crate::runner::{ParallelRunner, RunnerOutcome, RunnerTask};
use crate::store::{ArtifactStore, ResponseArtifact, RunStatus};
use crate::worker::{tokio_util_cancel::CancellationToken, SequenceWorker};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::info;

/// Summary returned once a run's generation and judging phases complete.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub models_run: Vec<String>,
    pub responses: Vec<ResponseArtifact>,
    pub failures: Vec<(String, String, u32, String)>,
    pub cancelled: bool,
}

/// Drives one run end-to-end: loads the battery, fans work out across
/// models, then invokes the judge pass over every generated response.
pub struct PipelineDriver<C, G, S>
where
    C: ContentSource,
    G: Generator,
    S: ArtifactStore,
{
    content_source: Arc<C>,
    generator: Arc<G>,
    store: Arc<S>,
    judge_model: JudgeModel,
}

impl<C, G, S> PipelineDriver<C, G, S>
where
    C: ContentSource,
    G: Generator,
    S: ArtifactStore,
{
    #[must_use]
    pub fn new(content_source: Arc<C>, generator: Arc<G>, store: Arc<S>, judge_model: JudgeModel) -> Self {
        Self {
            content_source,
            generator,
            store,
            judge_model,
        }
    }

    /// Run `models_file` against the active battery under `run_id`,
    /// creating the run if it does not already exist (a missing run is a
    /// fresh start; an existing one is a resume).
    pub async fn run(
        &self,
        run_id: &str,
        models_file: &ModelsFile,
        progress: Option<SharedProgressMonitor>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let battery = self.content_source.get_active_battery().await?;

        if self.store.get_run(run_id).await?.is_none() {
            self.store.create_run(run_id, &battery).await?;
        }

        let governor = Arc::new(RateGovernor::new(&models_file.provider_limits));

        let model_concurrency = models_file.settings.model_concurrency.max(1);
        let futures_iter = models_file.models.iter().map(|model| {
            self.run_model(
                run_id,
                &battery,
                model,
                models_file,
                governor.clone(),
                progress.clone(),
                cancel,
            )
        });

        let mut model_outcomes: Vec<(String, RunnerOutcome)> = Vec::new();
        let mut stream = stream::iter(futures_iter).buffer_unordered(model_concurrency);
        while let Some(result) = stream.next().await {
            model_outcomes.push(result?);
        }

        let mut responses = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = false;
        let mut models_run = Vec::new();

        for (model_id, outcome) in model_outcomes {
            models_run.push(model_id.clone());
            responses.extend(outcome.completed);
            for (sequence_name, prompt_index, error) in outcome.failed {
                failures.push((model_id.clone(), sequence_name, prompt_index, error));
            }
            cancelled |= outcome.cancelled;
        }

        if !cancelled {
            let judge = JudgePass::new(
                self.generator.clone(),
                governor,
                self.store.clone(),
                JudgeModel {
                    provider_tag: self.judge_model.provider_tag.clone(),
                    provider_model_name: self.judge_model.provider_model_name.clone(),
                },
            );
            let judge_results = judge.score_all(&battery, &responses, 4).await;
            for result in judge_results {
                if let Err(error) = result {
                    failures.push(("judge".to_string(), "verdict".to_string(), 0, error.to_string()));
                }
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.store.set_run_status(run_id, status).await?;

        info!(run_id, ?status, responses = responses.len(), failures = failures.len(), "run finished");

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            models_run,
            responses,
            failures,
            cancelled,
        })
    }

    async fn run_model(
        &self,
        run_id: &str,
        battery: &BatteryVersion,
        model: &ModelSpec,
        models_file: &ModelsFile,
        governor: Arc<RateGovernor>,
        progress: Option<SharedProgressMonitor>,
        cancel: &CancellationToken,
    ) -> Result<(String, RunnerOutcome)> {
        let worker = Arc::new(SequenceWorker::new(
            model.clone(),
            self.generator.clone(),
            governor,
            self.store.clone(),
            models_file.settings.retry_schedule.clone(),
            models_file.settings.call_timeout(),
        ));

        let mut tasks = Vec::new();
        for sequence in &battery.sequences {
            for run_index in 0..models_file.settings.runs_per_sequence {
                tasks.push(RunnerTask { sequence, run_index });
            }
        }

        let provider_concurrency = models_file
            .provider_limits(&model.provider_tag)
            .map(|limits| limits.max_concurrency)
            .unwrap_or(1);
        let runner = ParallelRunner::new(provider_concurrency);

        if let Some(monitor) = &progress {
            for _ in &tasks {
                monitor.task_started();
            }
        }

        let outcome = runner.run(run_id, worker, tasks, cancel).await;

        if let Some(monitor) = &progress {
            for response in &outcome.completed {
                monitor.task_completed(u64::from(response.output_tokens));
            }
            for _ in &outcome.failed {
                monitor.task_failed();
            }
        }

        Ok((model.model_id.clone(), outcome))
    }
}
