//! Sequence Worker: drives one (model, sequence, run_index) through its
//! prompts.
//!
//! Wraps each call in `tokio::time::timeout`, retries transient failures
//! with exponential backoff (`2u64.pow(attempt)`), and returns a
//! structured outcome rather than a bare `Result` bubbling past the
//! worker. Context is assembled turn by turn and checked against the
//! model's context window before each call.

use crate::battery::Sequence;
use crate::error::{Result, StoryBenchError};
use crate::generator::Generator;
use crate::governor::RateGovernor;
use crate::model::{ModelSpec, RetrySchedule};
use crate::store::{ArtifactStore, ResponseArtifact, TaskKey};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of driving one sequence to completion or failure.
#[derive(Debug)]
pub enum SequenceOutcome {
    /// Every prompt in the sequence produced or already had a response.
    Completed { responses: Vec<ResponseArtifact> },
    /// A prompt failed terminally (non-retryable, or retries exhausted).
    Failed {
        prompt_index: u32,
        error: String,
        responses_so_far: Vec<ResponseArtifact>,
    },
    /// Cooperative cancellation was observed between prompts.
    Cancelled { responses_so_far: Vec<ResponseArtifact> },
}

/// Drives one sequence's prompts for one model and run_index, assembling
/// context, enforcing the context-window invariant, retrying transient
/// failures, and persisting each response before moving to the next
/// prompt.
pub struct SequenceWorker<G: Generator, S: ArtifactStore> {
    model: ModelSpec,
    generator: Arc<G>,
    governor: Arc<RateGovernor>,
    store: Arc<S>,
    retry_schedule: RetrySchedule,
    call_timeout: std::time::Duration,
}

impl<G: Generator, S: ArtifactStore> SequenceWorker<G, S> {
    pub fn new(
        model: ModelSpec,
        generator: Arc<G>,
        governor: Arc<RateGovernor>,
        store: Arc<S>,
        retry_schedule: RetrySchedule,
        call_timeout: std::time::Duration,
    ) -> Self {
        Self {
            model,
            generator,
            governor,
            store,
            retry_schedule,
            call_timeout,
        }
    }

    /// Run every prompt in `sequence` for `run_index`, resuming from any
    /// response artifacts already persisted for this task key family.
    pub async fn run_sequence(
        &self,
        run_id: &str,
        sequence: &Sequence,
        run_index: u32,
        cancel: &tokio_util_cancel::CancellationToken,
    ) -> Result<SequenceOutcome> {
        let mut responses = Vec::with_capacity(sequence.prompts.len());
        let mut context = String::new();

        for (prompt_index, prompt) in sequence.prompts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(SequenceOutcome::Cancelled {
                    responses_so_far: responses,
                });
            }

            let prompt_index = prompt_index as u32;
            let task_key = TaskKey {
                run_id: run_id.to_string(),
                model_id: self.model.model_id.clone(),
                sequence_name: sequence.name.clone(),
                run_index,
                prompt_index,
            };

            if let Some(existing) = self.store.get_response(&task_key).await? {
                if !context.is_empty() {
                    context.push_str("\n\n");
                }
                context.push_str(&existing.text);
                responses.push(existing);
                continue;
            }

            match self.run_one_prompt(&task_key, &context, &prompt.text).await {
                Ok(artifact) => {
                    if !context.is_empty() {
                        context.push_str("\n\n");
                    }
                    context.push_str(&artifact.text);
                    responses.push(artifact);
                }
                Err(error) => {
                    return Ok(SequenceOutcome::Failed {
                        prompt_index,
                        error: error.to_string(),
                        responses_so_far: responses,
                    });
                }
            }
        }

        Ok(SequenceOutcome::Completed { responses })
    }

    async fn run_one_prompt(
        &self,
        task_key: &TaskKey,
        context: &str,
        prompt_text: &str,
    ) -> Result<ResponseArtifact> {
        let mut input = context.to_string();
        if !input.is_empty() {
            input.push_str("\n\n");
        }
        input.push_str(prompt_text);

        let tokens = self
            .generator
            .tokenize_len(&self.model.provider_model_name, &input)?;
        if tokens + self.model.max_output_tokens + self.model.safety_margin_tokens
            > self.model.context_window
        {
            return Err(StoryBenchError::ContextOverflow {
                task: task_key.canonical(),
                tokens,
                max_output_tokens: self.model.max_output_tokens,
                safety_margin: self.model.safety_margin_tokens,
                context_window: self.model.context_window,
            });
        }

        let mut attempt = 0u32;
        loop {
            match self.call_once(&input).await {
                Ok(output) => {
                    let artifact = ResponseArtifact {
                        task_key: task_key.clone(),
                        text: output.0,
                        input_tokens: output.1,
                        output_tokens: output.2,
                        assembled_context_snapshot: context.to_string(),
                        prompt_text_snapshot: prompt_text.to_string(),
                        created_at: Utc::now(),
                    };
                    self.store.put_response(&artifact).await?;
                    info!(task_key = %task_key.canonical(), attempt, "prompt completed");
                    return Ok(artifact);
                }
                Err(error) if error.is_retryable() && attempt < self.retry_schedule.max_retries => {
                    warn!(
                        task_key = %task_key.canonical(),
                        attempt,
                        error = %error,
                        "retryable error, backing off"
                    );
                    tokio::time::sleep(self.retry_schedule.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn call_once(&self, context: &str) -> Result<(String, u32, u32)> {
        let permit = self.governor.acquire(&self.model.provider_tag).await?;
        let call = self.generator.generate(
            &self.model.provider_model_name,
            context,
            self.model.max_output_tokens,
            self.model.temperature,
        );
        let result = tokio::time::timeout(self.call_timeout, call).await;

        match result {
            Ok(Ok(output)) => {
                self.governor.record_outcome(permit, true);
                Ok((output.text, output.input_tokens, output.output_tokens))
            }
            Ok(Err(error)) => {
                self.governor.record_outcome(permit, false);
                Err(error)
            }
            Err(_elapsed) => {
                self.governor.record_outcome(permit, false);
                Err(StoryBenchError::Timeout(self.call_timeout))
            }
        }
    }
}

/// Minimal cooperative cancellation token: an `Arc<AtomicBool>`-backed
/// flag checked between prompts, named to read like the `tokio_util`
/// crate it stands in for without adding that dependency for a single
/// flag.
pub mod tokio_util_cancel {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct CancellationToken {
        flag: Arc<AtomicBool>,
    }

    impl CancellationToken {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.flag.store(true, Ordering::SeqCst);
        }

        #[must_use]
        pub fn is_cancelled(&self) -> bool {
            self.flag.load(Ordering::SeqCst)
        }
    }
}
