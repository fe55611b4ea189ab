//! Model Spec and Run Settings, loaded once from a TOML manifest at run
//! start: which models to evaluate, their context windows and provider
//! tags, per-provider rate limits, and the retry schedule applied to
//! transient failures.

use crate::error::{Result, StoryBenchError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A single model under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    /// Stable identifier used in task keys and artifact storage.
    pub model_id: String,
    /// Which `Generator` implementation/provider handles this model.
    pub provider_tag: String,
    /// Provider-specific model name passed to the generator.
    pub provider_model_name: String,
    /// Maximum input+output tokens the model can hold in context.
    pub context_window: u32,
    /// Requested max output tokens per call.
    pub max_output_tokens: u32,
    /// Sampling temperature passed to the generator.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Tokens of headroom reserved below `context_window`, on top of
    /// `max_output_tokens`, before a call is rejected as overflow.
    #[serde(default)]
    pub safety_margin_tokens: u32,
}

fn default_temperature() -> f64 {
    1.0
}

/// Per-provider rate governance parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderLimits {
    /// Provider tag these limits apply to; must match a `ModelSpec::provider_tag`.
    pub provider_tag: String,
    /// Max concurrent in-flight calls to this provider.
    pub max_concurrency: usize,
    /// Consecutive retryable failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe is admitted.
    #[serde(default = "default_open_duration_secs", rename = "open_duration_secs")]
    pub open_duration_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_secs() -> u64 {
    30
}

impl ProviderLimits {
    /// Convenience accessor for the open-circuit cooldown as a `Duration`.
    #[must_use]
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }
}

/// Retry policy applied by a `SequenceWorker` to retryable errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySchedule {
    /// Maximum retry attempts after the initial call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base for exponential backoff: `base_secs * 2^attempt`.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_secs() -> u64 {
    1
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

impl RetrySchedule {
    /// Backoff delay before retry attempt `attempt` (0-indexed).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_base_secs.saturating_mul(2u64.saturating_pow(attempt)))
    }
}

/// Run-level settings read alongside the model manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    /// How many generations to run per (model, sequence) pair.
    #[serde(default = "default_runs_per_sequence")]
    pub runs_per_sequence: u32,
    /// Bound on concurrent models processed by the `PipelineDriver`.
    /// Default `1` (sequential); the Governor remains the sole enforced
    /// per-provider limit regardless of this setting.
    #[serde(default = "default_model_concurrency")]
    pub model_concurrency: usize,
    /// Retry policy shared by all models unless overridden.
    #[serde(default)]
    pub retry_schedule: RetrySchedule,
    /// Per-call generator timeout.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_runs_per_sequence() -> u32 {
    1
}

fn default_model_concurrency() -> usize {
    1
}

fn default_call_timeout_secs() -> u64 {
    60
}

impl RunSettings {
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// The full TOML manifest: models, provider limits, and run settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsFile {
    /// Models to evaluate in this run.
    pub models: Vec<ModelSpec>,
    /// Per-provider rate/circuit limits.
    #[serde(default)]
    pub provider_limits: Vec<ProviderLimits>,
    /// Run-level settings.
    #[serde(default)]
    pub settings: RunSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            runs_per_sequence: default_runs_per_sequence(),
            model_concurrency: default_model_concurrency(),
            retry_schedule: RetrySchedule::default(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl ModelsFile {
    /// Parse a models manifest from a TOML string. Unknown fields are an
    /// error; config loading here is strict rather than permissive.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: Self = toml::from_str(raw)
            .map_err(|e| StoryBenchError::Configuration(format!("invalid models file: {e}")))?;
        file.validate()?;
        Ok(file)
    }

    /// Load and parse a models manifest from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StoryBenchError::Configuration(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(StoryBenchError::Configuration(
                "models file declares zero models".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.model_id.as_str()) {
                return Err(StoryBenchError::Configuration(format!(
                    "duplicate model_id '{}'",
                    model.model_id
                )));
            }
            if model.max_output_tokens >= model.context_window {
                return Err(StoryBenchError::Configuration(format!(
                    "model '{}' has max_output_tokens >= context_window",
                    model.model_id
                )));
            }
            if model.max_output_tokens + model.safety_margin_tokens >= model.context_window {
                return Err(StoryBenchError::Configuration(format!(
                    "model '{}' has max_output_tokens + safety_margin_tokens >= context_window",
                    model.model_id
                )));
            }
        }
        Ok(())
    }

    /// Provider limits for the given tag, if declared.
    #[must_use]
    pub fn provider_limits(&self, provider_tag: &str) -> Option<&ProviderLimits> {
        self.provider_limits
            .iter()
            .find(|p| p.provider_tag == provider_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[models]]
        model_id = "gpt-story"
        provider_tag = "openai"
        provider_model_name = "gpt-4o"
        context_window = 128000
        max_output_tokens = 4096

        [[provider_limits]]
        provider_tag = "openai"
        max_concurrency = 4

        [settings]
        runs_per_sequence = 2
    "#;

    #[test]
    fn parses_sample_manifest_with_defaults() {
        let file = ModelsFile::from_toml_str(SAMPLE).unwrap();
        assert_eq!(file.models.len(), 1);
        assert_eq!(file.models[0].temperature, 1.0);
        assert_eq!(file.models[0].safety_margin_tokens, 0);
        assert_eq!(file.settings.runs_per_sequence, 2);
        assert_eq!(file.settings.model_concurrency, 1);
        let limits = file.provider_limits("openai").unwrap();
        assert_eq!(limits.failure_threshold, 5);
        assert_eq!(limits.open_duration(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_empty_models() {
        let result = ModelsFile::from_toml_str("models = []\n[settings]\n");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_duplicate_model_ids() {
        let raw = format!("{SAMPLE}\n[[models]]\nmodel_id = \"gpt-story\"\nprovider_tag = \"openai\"\nprovider_model_name = \"gpt-4o\"\ncontext_window = 128000\nmax_output_tokens = 4096\n");
        let result = ModelsFile::from_toml_str(&raw);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_output_tokens_exceeding_context_window() {
        let raw = r#"
            [[models]]
            model_id = "broken"
            provider_tag = "openai"
            provider_model_name = "gpt-4o"
            context_window = 1000
            max_output_tokens = 2000
        "#;
        let result = ModelsFile::from_toml_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn retry_schedule_backoff_grows_exponentially() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.backoff_for(0), Duration::from_secs(1));
        assert_eq!(schedule.backoff_for(2), Duration::from_secs(4));
    }

    proptest::proptest! {
        #[test]
        fn backoff_is_monotonically_nondecreasing(base in 1u64..10, attempt in 0u32..20) {
            let schedule = RetrySchedule {
                max_retries: 5,
                backoff_base_secs: base,
            };
            let this = schedule.backoff_for(attempt);
            let next = schedule.backoff_for(attempt + 1);
            proptest::prop_assert!(next >= this);
        }
    }
}
