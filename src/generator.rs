//! Generator Capability: the provider-facing boundary a `SequenceWorker`
//! calls through. A thin async trait the orchestrator calls against,
//! with concrete providers wired in at the edges rather than known to
//! the core pipeline.

use crate::error::Result;
use async_trait::async_trait;

/// One model turn's output.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    /// The generated text.
    pub text: String,
    /// Tokens consumed by the input side of this call, as reported (or
    /// estimated) by the provider.
    pub input_tokens: u32,
    /// Tokens consumed by the output side of this call.
    pub output_tokens: u32,
}

/// Capability a `SequenceWorker` calls to produce one turn of output.
/// Tokenization is entirely the generator's responsibility — the
/// orchestrator never estimates token counts itself.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a continuation given the accumulated context so far.
    /// `context` is the full conversation built by the worker: prior
    /// prompts and responses in the sequence, followed by the next
    /// prompt.
    async fn generate(
        &self,
        provider_model_name: &str,
        context: &str,
        max_output_tokens: u32,
        temperature: f64,
    ) -> Result<GenerateOutput>;

    /// Token length of `text` under this provider's tokenizer. Used by
    /// the worker to enforce the context-window limit before issuing a
    /// call.
    fn tokenize_len(&self, provider_model_name: &str, text: &str) -> Result<u32>;
}

/// Reference generator for tests and dry runs: echoes the prompt back
/// and estimates tokens via whitespace-splitting, so no network or
/// provider credentials are required to exercise the pipeline.
pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        _provider_model_name: &str,
        context: &str,
        max_output_tokens: u32,
        _temperature: f64,
    ) -> Result<GenerateOutput> {
        let reply = format!("echo: {context}");
        let output_tokens = self
            .tokenize_len("echo", &reply)?
            .min(max_output_tokens);
        Ok(GenerateOutput {
            text: reply,
            input_tokens: self.tokenize_len("echo", context)?,
            output_tokens,
        })
    }

    fn tokenize_len(&self, _provider_model_name: &str, text: &str) -> Result<u32> {
        Ok(text.split_whitespace().count() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_generator_round_trips_and_counts_tokens() {
        let generator = EchoGenerator;
        let output = generator
            .generate("any-model", "hello world", 100, 1.0)
            .await
            .unwrap();
        assert_eq!(output.text, "echo: hello world");
        assert_eq!(output.input_tokens, 2);
    }

    #[test]
    fn tokenize_len_counts_whitespace_separated_words() {
        let generator = EchoGenerator;
        assert_eq!(generator.tokenize_len("any-model", "a b  c").unwrap(), 3);
    }
}
