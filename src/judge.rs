//! Judge Pass: LLM-as-judge scoring of response artifacts against the
//! battery's criteria. Builds a rubric prompt listing every criterion,
//! strips markdown fences before attempting a strict JSON parse of the
//! judge's reply, and falls back to a tolerant line-based scan for
//! verdicts that don't come back as clean JSON.

use crate::battery::{BatteryVersion, Criterion};
use crate::error::Result;
use crate::generator::Generator;
use crate::governor::RateGovernor;
use crate::store::{ArtifactStore, ResponseArtifact, TaskKey, VerdictArtifact};
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Grammar version for the fallback line-based parser. Bumped whenever
/// the fallback's matching rules change, so stored verdicts can be
/// audited against the rules that produced them.
pub const PARSE_GRAMMAR_VERSION: u32 = 1;

/// Model-facing capability for scoring: distinct from [`Generator`]
/// because a deployment may point the judge at a different model/provider
/// than the ones under evaluation.
pub struct JudgeModel {
    pub provider_tag: String,
    pub provider_model_name: String,
}

/// Drives the scoring of response artifacts against a battery's criteria.
pub struct JudgePass<G: Generator, S: ArtifactStore> {
    generator: Arc<G>,
    governor: Arc<RateGovernor>,
    store: Arc<S>,
    judge_model: JudgeModel,
}

impl<G: Generator, S: ArtifactStore> JudgePass<G, S> {
    #[must_use]
    pub fn new(
        generator: Arc<G>,
        governor: Arc<RateGovernor>,
        store: Arc<S>,
        judge_model: JudgeModel,
    ) -> Self {
        Self {
            generator,
            governor,
            store,
            judge_model,
        }
    }

    /// Stable identifier for this judge model, used to key verdicts
    /// alongside the response task and the criteria version so the same
    /// response can be judged again under a different judge or battery
    /// revision without colliding.
    fn judge_model_id(&self) -> String {
        format!(
            "{}:{}",
            self.judge_model.provider_tag, self.judge_model.provider_model_name
        )
    }

    /// Score one response artifact, skipping the call entirely if a
    /// verdict already exists for its task key (idempotent resume, same
    /// as `SequenceWorker::run_sequence`).
    pub async fn score_response(
        &self,
        battery: &BatteryVersion,
        response: &ResponseArtifact,
    ) -> Result<VerdictArtifact> {
        let judge_model_id = self.judge_model_id();
        let criteria_version_id = battery.version_id.clone();

        if let Some(existing) = self
            .store
            .get_verdict(&response.task_key, &judge_model_id, &criteria_version_id)
            .await?
        {
            return Ok(existing);
        }

        let prompt = build_scoring_prompt(&battery.criteria, &response.text);
        let permit = self.governor.acquire(&self.judge_model.provider_tag).await?;
        let call = self.generator.generate(
            &self.judge_model.provider_model_name,
            &prompt,
            1024,
            0.0,
        );
        let outcome = call.await;
        self.governor.record_outcome(permit, outcome.is_ok());
        let raw_text = outcome?.text;

        let verdict = parse_verdict(
            &response.task_key,
            &judge_model_id,
            &criteria_version_id,
            &battery.criteria,
            &raw_text,
        );
        self.store.put_verdict(&verdict).await?;
        Ok(verdict)
    }

    /// Score every response for a run, bounded by `max_concurrency`
    /// in-flight judge calls (`score_batch_with_concurrency`'s shape).
    pub async fn score_all(
        &self,
        battery: &BatteryVersion,
        responses: &[ResponseArtifact],
        max_concurrency: usize,
    ) -> Vec<Result<VerdictArtifact>> {
        use futures::stream::{self, StreamExt};

        let futures_iter = responses
            .iter()
            .map(|response| self.score_response(battery, response));

        stream::iter(futures_iter)
            .buffer_unordered(max_concurrency.max(1))
            .collect()
            .await
    }
}

/// Build the judge prompt for the given criteria and candidate text.
/// Mirrors `build_scoring_prompt`'s rubric-listing style, generalized
/// from six hardcoded dimensions to an arbitrary criteria slice.
fn build_scoring_prompt(criteria: &[Criterion], candidate_text: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are evaluating a piece of creative writing. Score it on each of the \
         following criteria and respond with a single JSON object mapping each \
         criterion name to a numeric score. Respond with JSON only, no prose.\n\n",
    );
    for criterion in criteria {
        prompt.push_str(&format!(
            "- {} (scale {} to {}): {}\n",
            criterion.name, criterion.scale_min, criterion.scale_max, criterion.description
        ));
    }
    prompt.push_str("\nText to score:\n");
    prompt.push_str(candidate_text);
    prompt
}

/// Strip markdown code fences the way `parse_llm_response` does, then
/// attempt strict JSON parsing; fall back to a line-based scan for any
/// criterion the JSON pass didn't yield a score for.
fn parse_verdict(
    task_key: &TaskKey,
    judge_model_id: &str,
    criteria_version_id: &str,
    criteria: &[Criterion],
    raw_text: &str,
) -> VerdictArtifact {
    let mut scores = BTreeMap::new();

    if let Some(json_scores) = try_parse_json(raw_text) {
        scores.extend(json_scores);
    }

    let missing: Vec<&Criterion> = criteria
        .iter()
        .filter(|c| !scores.contains_key(&c.name))
        .collect();

    if !missing.is_empty() {
        for criterion in missing {
            if let Some(value) = fallback_scan_for_criterion(raw_text, &criterion.name) {
                scores.insert(criterion.name.clone(), value);
            }
        }
    }

    let fully_parsed = criteria.iter().all(|c| scores.contains_key(&c.name));
    if !fully_parsed {
        warn!(
            task_key = %task_key.canonical(),
            "verdict only partially parsed, missing criteria remain unset"
        );
    }

    VerdictArtifact {
        task_key: task_key.clone(),
        judge_model_id: judge_model_id.to_string(),
        criteria_version_id: criteria_version_id.to_string(),
        raw_judge_text: raw_text.to_string(),
        parsed_scores: scores,
        fully_parsed,
        parse_grammar_version: PARSE_GRAMMAR_VERSION,
        created_at: Utc::now(),
    }
}

fn try_parse_json(raw_text: &str) -> Option<BTreeMap<String, f64>> {
    let cleaned = raw_text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str::<BTreeMap<String, f64>>(cleaned).ok()
}

/// Line-based fallback: scans for `criterion_name` followed by `:` or `=`
/// and a number, case-insensitively. This is the versioned grammar
/// `PARSE_GRAMMAR_VERSION` tracks.
fn fallback_scan_for_criterion(raw_text: &str, criterion_name: &str) -> Option<f64> {
    let pattern = format!(
        r"(?i)^\s*{}\s*[:=]\s*(-?[0-9]+(?:\.[0-9]+)?)",
        regex::escape(criterion_name)
    );
    let regex = Regex::new(&pattern).ok()?;
    raw_text.lines().find_map(|line| {
        regex
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_criteria() -> Vec<Criterion> {
        vec![
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
        ]
    }

    fn sample_task_key() -> TaskKey {
        TaskKey {
            run_id: "run-1".to_string(),
            model_id: "model-1".to_string(),
            sequence_name: "seq".to_string(),
            run_index: 0,
            prompt_index: 0,
        }
    }

    #[test]
    fn parses_clean_json_verdict() {
        let raw = "```json\n{\"coherence\": 8.5, \"creativity\": 7}\n```";
        let verdict = parse_verdict(&sample_task_key(), "echo:judge-v1", "v1", &sample_criteria(), raw);
        assert!(verdict.fully_parsed);
        assert_eq!(verdict.parsed_scores.get("coherence"), Some(&8.5));
        assert_eq!(verdict.parsed_scores.get("creativity"), Some(&7.0));
    }

    #[test]
    fn falls_back_to_line_scan_for_malformed_json() {
        let raw = "coherence: 9\ncreativity = 6.5\n(not valid json at all)";
        let verdict = parse_verdict(&sample_task_key(), "echo:judge-v1", "v1", &sample_criteria(), raw);
        assert!(verdict.fully_parsed);
        assert_eq!(verdict.parsed_scores.get("coherence"), Some(&9.0));
        assert_eq!(verdict.parsed_scores.get("creativity"), Some(&6.5));
    }

    #[test]
    fn marks_partial_when_a_criterion_never_resolves() {
        let raw = "coherence: 9\nno mention of the other dimension";
        let verdict = parse_verdict(&sample_task_key(), "echo:judge-v1", "v1", &sample_criteria(), raw);
        assert!(!verdict.fully_parsed);
        assert_eq!(verdict.parsed_scores.len(), 1);
    }

    #[test]
    fn scoring_prompt_lists_every_criterion() {
        let prompt = build_scoring_prompt(&sample_criteria(), "once upon a time");
        assert!(prompt.contains("coherence"));
        assert!(prompt.contains("creativity"));
        assert!(prompt.contains("once upon a time"));
    }
}
