//! Parallel Runner: fans sequence workers out for one model.
//!
//! Bounds concurrency with `futures::stream::{iter, buffer_unordered}`
//! rather than a separate semaphore, since the per-provider limit is
//! already enforced inside each worker by the `RateGovernor`.

use crate::battery::Sequence;
use crate::generator::Generator;
use crate::store::{ArtifactStore, ResponseArtifact};
use crate::worker::{tokio_util_cancel::CancellationToken, SequenceOutcome, SequenceWorker};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// One (sequence, run_index) unit of work for a single model.
pub struct RunnerTask<'a> {
    pub sequence: &'a Sequence,
    pub run_index: u32,
}

/// Aggregate result of running every task for one model.
#[derive(Debug, Default)]
pub struct RunnerOutcome {
    pub completed: Vec<ResponseArtifact>,
    pub failed: Vec<(String, u32, String)>,
    pub cancelled: bool,
}

/// Fans `tasks` out across a bounded pool of concurrent sequence workers.
pub struct ParallelRunner {
    max_in_flight: usize,
}

impl ParallelRunner {
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub async fn run<G: Generator, S: ArtifactStore>(
        &self,
        run_id: &str,
        worker: Arc<SequenceWorker<G, S>>,
        tasks: Vec<RunnerTask<'_>>,
        cancel: &CancellationToken,
    ) -> RunnerOutcome {
        let futures_iter = tasks.into_iter().map(|task| {
            let worker = worker.clone();
            let run_id = run_id.to_string();
            let sequence = task.sequence.clone();
            let run_index = task.run_index;
            let cancel = cancel.clone();
            async move {
                worker
                    .run_sequence(&run_id, &sequence, run_index, &cancel)
                    .await
            }
        });

        let mut outcomes = stream::iter(futures_iter).buffer_unordered(self.max_in_flight);
        let mut result = RunnerOutcome::default();

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(SequenceOutcome::Completed { responses }) => {
                    result.completed.extend(responses);
                }
                Ok(SequenceOutcome::Failed {
                    prompt_index,
                    error,
                    responses_so_far,
                }) => {
                    result.completed.extend(responses_so_far);
                    result
                        .failed
                        .push(("sequence".to_string(), prompt_index, error));
                }
                Ok(SequenceOutcome::Cancelled { responses_so_far }) => {
                    result.completed.extend(responses_so_far);
                    result.cancelled = true;
                }
                Err(error) => {
                    result.failed.push(("runner".to_string(), 0, error.to_string()));
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::Prompt;
    use crate::generator::EchoGenerator;
    use crate::governor::RateGovernor;
    use crate::model::{ModelSpec, ProviderLimits, RetrySchedule};
    use crate::store::SqliteArtifactStore;

    fn sample_sequence(name: &str) -> Sequence {
        Sequence {
            name: name.to_string(),
            prompts: vec![Prompt {
                name: "p0".to_string(),
                text: "go".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn runs_multiple_sequences_concurrently_and_aggregates() {
        let store = Arc::new(SqliteArtifactStore::open_in_memory().unwrap());
        let battery = crate::battery::BatteryVersion {
            version_id: "v1".to_string(),
            sequences: vec![sample_sequence("a"), sample_sequence("b")],
            criteria: vec![],
        };
        store.create_run("run-1", &battery).await.unwrap();

        let governor = Arc::new(RateGovernor::new(&[ProviderLimits {
            provider_tag: "echo".to_string(),
            max_concurrency: 2,
            failure_threshold: 5,
            open_duration_secs: 30,
        }]));
        let worker = Arc::new(SequenceWorker::new(
            ModelSpec {
                model_id: "echo-model".to_string(),
                provider_tag: "echo".to_string(),
                provider_model_name: "echo-v1".to_string(),
                context_window: 1000,
                max_output_tokens: 100,
                temperature: 1.0,
                safety_margin_tokens: 0,
            },
            Arc::new(EchoGenerator),
            governor,
            store.clone(),
            RetrySchedule::default(),
            std::time::Duration::from_secs(5),
        ));

        let seq_a = sample_sequence("a");
        let seq_b = sample_sequence("b");
        let tasks = vec![
            RunnerTask {
                sequence: &seq_a,
                run_index: 0,
            },
            RunnerTask {
                sequence: &seq_b,
                run_index: 0,
            },
        ];

        let cancel = CancellationToken::new();
        let runner = ParallelRunner::new(2);
        let outcome = runner.run("run-1", worker, tasks, &cancel).await;

        assert_eq!(outcome.completed.len(), 2);
        assert!(outcome.failed.is_empty());
        assert!(!outcome.cancelled);
    }
}
