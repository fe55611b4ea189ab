//! Durable Artifact Store, backed by `rusqlite`.
//!
//! Writes keyed by a unique `task_key` are "already done," not errors,
//! on conflict — this is how a run resumes after a crash or a
//! deliberate `resume` invocation.

use crate::battery::BatteryVersion;
use crate::error::{Result, StoryBenchError, StoreBackendError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Identifies one generation task uniquely within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub run_id: String,
    pub model_id: String,
    pub sequence_name: String,
    pub run_index: u32,
    pub prompt_index: u32,
}

impl TaskKey {
    /// Canonical string form, used as the SQLite unique-index column and
    /// in log lines / error messages.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.run_id, self.model_id, self.sequence_name, self.run_index, self.prompt_index
        )
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StoryBenchError::Store(StoreBackendError(format!(
                "unrecognized run status '{other}'"
            )))),
        }
    }
}

/// A single evaluation run: one battery snapshot against one models
/// manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub battery_version_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

/// One model turn's persisted output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseArtifact {
    pub task_key: TaskKey,
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// The context handed to the generator for this turn: the
    /// concatenation of prior output texts in the sequence, excluding
    /// this turn's own prompt. Empty for the first prompt.
    pub assembled_context_snapshot: String,
    /// The prompt text appended after `assembled_context_snapshot` to
    /// form the generator's input, captured exactly as issued.
    pub prompt_text_snapshot: String,
    pub created_at: DateTime<Utc>,
}

/// A judge's scored verdict for one response, unique per
/// `(task_key, judge_model_id, criteria_version_id)` — a response can be
/// scored by more than one judge model or against more than one criteria
/// version without the verdicts colliding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictArtifact {
    pub task_key: TaskKey,
    /// Identifies the judge model that produced this verdict.
    pub judge_model_id: String,
    /// Identifies the criteria set the judge scored against (the battery
    /// version id, since criteria are snapshotted as part of it).
    pub criteria_version_id: String,
    /// Raw judge model output, kept for audit even when parsing was partial.
    pub raw_judge_text: String,
    /// Criterion name -> score, only entries that parsed successfully.
    pub parsed_scores: std::collections::BTreeMap<String, f64>,
    /// Whether every declared criterion parsed; `false` flags a partial verdict.
    pub fully_parsed: bool,
    /// Version of the parsing grammar used, for forward compatibility.
    pub parse_grammar_version: u32,
    pub created_at: DateTime<Utc>,
}

impl VerdictArtifact {
    /// Unique key across `(task_key, judge_model_id, criteria_version_id)`,
    /// used as the verdicts table's primary key.
    #[must_use]
    pub fn verdict_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.task_key.canonical(),
            self.judge_model_id,
            self.criteria_version_id
        )
    }
}

/// Durable storage for runs, response artifacts, and verdict artifacts.
/// Writes are keyed by unique identifiers so retried or resumed writes
/// are idempotent rather than erroring.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create a new run row. Errors if `run_id` already exists.
    async fn create_run(&self, run_id: &str, battery: &BatteryVersion) -> Result<Run>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Update a run's status.
    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Persist a response artifact. Returns `Ok(false)` without writing
    /// when a response for this `task_key` already exists (idempotent
    /// resume), `Ok(true)` when this call performed the write.
    async fn put_response(&self, artifact: &ResponseArtifact) -> Result<bool>;

    /// Fetch a previously stored response artifact, if any.
    async fn get_response(&self, task_key: &TaskKey) -> Result<Option<ResponseArtifact>>;

    /// All response artifacts for a run, in no particular order — callers
    /// needing order should sort by `task_key`.
    async fn list_responses(&self, run_id: &str) -> Result<Vec<ResponseArtifact>>;

    /// Persist a verdict artifact, with the same idempotent semantics as
    /// [`ArtifactStore::put_response`]. Uniqueness is on
    /// `(task_key, judge_model_id, criteria_version_id)`, not `task_key`
    /// alone.
    async fn put_verdict(&self, artifact: &VerdictArtifact) -> Result<bool>;

    /// Fetch a previously stored verdict artifact for the given response,
    /// judge model, and criteria version, if any.
    async fn get_verdict(
        &self,
        task_key: &TaskKey,
        judge_model_id: &str,
        criteria_version_id: &str,
    ) -> Result<Option<VerdictArtifact>>;
}

/// SQLite-backed `ArtifactStore`.
///
/// `rusqlite::Connection` is `!Sync`, so access is serialized behind a
/// `std::sync::Mutex`; this is a single-writer store, not a pooled one.
pub struct SqliteArtifactStore {
    conn: Mutex<Connection>,
}

impl SqliteArtifactStore {
    /// Open (creating if absent) a SQLite database at `path` and ensure
    /// the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                battery_version_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS responses (
                task_key TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                sequence_name TEXT NOT NULL,
                run_index INTEGER NOT NULL,
                prompt_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                assembled_context_snapshot TEXT NOT NULL,
                prompt_text_snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS verdicts (
                verdict_key TEXT PRIMARY KEY,
                task_key TEXT NOT NULL,
                run_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                sequence_name TEXT NOT NULL,
                run_index INTEGER NOT NULL,
                prompt_index INTEGER NOT NULL,
                judge_model_id TEXT NOT NULL,
                criteria_version_id TEXT NOT NULL,
                raw_judge_text TEXT NOT NULL,
                parsed_scores TEXT NOT NULL,
                fully_parsed INTEGER NOT NULL,
                parse_grammar_version INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;
        Ok(())
    }
}

fn task_key_from_row(
    run_id: String,
    model_id: String,
    sequence_name: String,
    run_index: u32,
    prompt_index: u32,
) -> TaskKey {
    TaskKey {
        run_id,
        model_id,
        sequence_name,
        run_index,
        prompt_index,
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn create_run(&self, run_id: &str, battery: &BatteryVersion) -> Result<Run> {
        let run = Run {
            run_id: run_id.to_string(),
            battery_version_id: battery.version_id.clone(),
            status: RunStatus::InProgress,
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        conn.execute(
            "INSERT INTO runs (run_id, battery_version_id, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                run.run_id,
                run.battery_version_id,
                run.status.as_str(),
                run.created_at.to_rfc3339()
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoryBenchError::StoreConflict(run_id.to_string())
            }
            other => StoryBenchError::Store(StoreBackendError(other.to_string())),
        })?;
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        let result = conn
            .query_row(
                "SELECT battery_version_id, status, created_at FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    let battery_version_id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    Ok((battery_version_id, status, created_at))
                },
            )
            .optional()
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;

        match result {
            None => Ok(None),
            Some((battery_version_id, status, created_at)) => Ok(Some(Run {
                run_id: run_id.to_string(),
                battery_version_id,
                status: RunStatus::from_str(&status)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?
                    .with_timezone(&Utc),
            })),
        }
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        let updated = conn
            .execute(
                "UPDATE runs SET status = ?1 WHERE run_id = ?2",
                params![status.as_str(), run_id],
            )
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;
        if updated == 0 {
            return Err(StoryBenchError::Configuration(format!(
                "no such run '{run_id}'"
            )));
        }
        Ok(())
    }

    async fn put_response(&self, artifact: &ResponseArtifact) -> Result<bool> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        let canonical = artifact.task_key.canonical();
        let result = conn.execute(
            "INSERT INTO responses
                (task_key, run_id, model_id, sequence_name, run_index, prompt_index,
                 text, input_tokens, output_tokens, assembled_context_snapshot,
                 prompt_text_snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                canonical,
                artifact.task_key.run_id,
                artifact.task_key.model_id,
                artifact.task_key.sequence_name,
                artifact.task_key.run_index,
                artifact.task_key.prompt_index,
                artifact.text,
                artifact.input_tokens,
                artifact.output_tokens,
                artifact.assembled_context_snapshot,
                artifact.prompt_text_snapshot,
                artifact.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(other) => Err(StoryBenchError::Store(StoreBackendError(other.to_string()))),
        }
    }

    async fn get_response(&self, task_key: &TaskKey) -> Result<Option<ResponseArtifact>> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        conn.query_row(
            "SELECT run_id, model_id, sequence_name, run_index, prompt_index,
                    text, input_tokens, output_tokens, assembled_context_snapshot,
                    prompt_text_snapshot, created_at
             FROM responses WHERE task_key = ?1",
            params![task_key.canonical()],
            |row| {
                Ok(ResponseArtifact {
                    task_key: task_key_from_row(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ),
                    text: row.get(5)?,
                    input_tokens: row.get(6)?,
                    output_tokens: row.get(7)?,
                    assembled_context_snapshot: row.get(8)?,
                    prompt_text_snapshot: row.get(9)?,
                    created_at: {
                        let raw: String = row.get(10)?;
                        DateTime::parse_from_rfc3339(&raw)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now())
                    },
                })
            },
        )
        .optional()
        .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))
    }

    async fn list_responses(&self, run_id: &str) -> Result<Vec<ResponseArtifact>> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT run_id, model_id, sequence_name, run_index, prompt_index,
                        text, input_tokens, output_tokens, assembled_context_snapshot,
                        prompt_text_snapshot, created_at
                 FROM responses WHERE run_id = ?1",
            )
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(ResponseArtifact {
                    task_key: task_key_from_row(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ),
                    text: row.get(5)?,
                    input_tokens: row.get(6)?,
                    output_tokens: row.get(7)?,
                    assembled_context_snapshot: row.get(8)?,
                    prompt_text_snapshot: row.get(9)?,
                    created_at: {
                        let raw: String = row.get(10)?;
                        DateTime::parse_from_rfc3339(&raw)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now())
                    },
                })
            })
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))
    }

    async fn put_verdict(&self, artifact: &VerdictArtifact) -> Result<bool> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        let verdict_key = artifact.verdict_key();
        let canonical = artifact.task_key.canonical();
        let parsed_scores_json = serde_json::to_string(&artifact.parsed_scores)
            .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))?;
        let result = conn.execute(
            "INSERT INTO verdicts
                (verdict_key, task_key, run_id, model_id, sequence_name, run_index,
                 prompt_index, judge_model_id, criteria_version_id, raw_judge_text,
                 parsed_scores, fully_parsed, parse_grammar_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                verdict_key,
                canonical,
                artifact.task_key.run_id,
                artifact.task_key.model_id,
                artifact.task_key.sequence_name,
                artifact.task_key.run_index,
                artifact.task_key.prompt_index,
                artifact.judge_model_id,
                artifact.criteria_version_id,
                artifact.raw_judge_text,
                parsed_scores_json,
                artifact.fully_parsed as i64,
                artifact.parse_grammar_version,
                artifact.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(other) => Err(StoryBenchError::Store(StoreBackendError(other.to_string()))),
        }
    }

    async fn get_verdict(
        &self,
        task_key: &TaskKey,
        judge_model_id: &str,
        criteria_version_id: &str,
    ) -> Result<Option<VerdictArtifact>> {
        let conn = self.conn.lock().expect("artifact store mutex poisoned");
        let verdict_key = format!(
            "{}/{}/{}",
            task_key.canonical(),
            judge_model_id,
            criteria_version_id
        );
        conn.query_row(
            "SELECT run_id, model_id, sequence_name, run_index, prompt_index,
                    judge_model_id, criteria_version_id, raw_judge_text, parsed_scores,
                    fully_parsed, parse_grammar_version, created_at
             FROM verdicts WHERE verdict_key = ?1",
            params![verdict_key],
            |row| {
                let parsed_scores_json: String = row.get(8)?;
                let fully_parsed: i64 = row.get(9)?;
                Ok(VerdictArtifact {
                    task_key: task_key_from_row(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ),
                    judge_model_id: row.get(5)?,
                    criteria_version_id: row.get(6)?,
                    raw_judge_text: row.get(7)?,
                    parsed_scores: serde_json::from_str(&parsed_scores_json)
                        .unwrap_or_default(),
                    fully_parsed: fully_parsed != 0,
                    parse_grammar_version: row.get(10)?,
                    created_at: {
                        let raw: String = row.get(11)?;
                        DateTime::parse_from_rfc3339(&raw)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now())
                    },
                })
            },
        )
        .optional()
        .map_err(|e| StoryBenchError::Store(StoreBackendError(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::{BatteryVersion, Criterion, Prompt, Sequence};

    fn sample_battery() -> BatteryVersion {
        BatteryVersion {
            version_id: "v1".to_string(),
            sequences: vec![Sequence {
                name: "seq".to_string(),
                prompts: vec![Prompt {
                    name: "p0".to_string(),
                    text: "hi".to_string(),
                }],
            }],
            criteria: vec![Criterion {
                name: "coherence".to_string(),
                description: "d".to_string(),
                scale_min: 0.0,
                scale_max: 10.0,
            }],
        }
    }

    fn sample_task_key(run_id: &str) -> TaskKey {
        TaskKey {
            run_id: run_id.to_string(),
            model_id: "gpt-story".to_string(),
            sequence_name: "seq".to_string(),
            run_index: 0,
            prompt_index: 0,
        }
    }

    #[tokio::test]
    async fn create_run_then_duplicate_is_conflict() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store.create_run("run-1", &sample_battery()).await.unwrap();
        let result = store.create_run("run-1", &sample_battery()).await;
        assert!(matches!(result, Err(StoryBenchError::StoreConflict(_))));
    }

    #[tokio::test]
    async fn put_response_is_idempotent_on_duplicate_task_key() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store.create_run("run-1", &sample_battery()).await.unwrap();
        let artifact = ResponseArtifact {
            task_key: sample_task_key("run-1"),
            text: "once upon a time".to_string(),
            input_tokens: 3,
            output_tokens: 4,
            assembled_context_snapshot: String::new(),
            prompt_text_snapshot: "begin the story".to_string(),
            created_at: Utc::now(),
        };
        assert!(store.put_response(&artifact).await.unwrap());
        assert!(!store.put_response(&artifact).await.unwrap());

        let fetched = store.get_response(&sample_task_key("run-1")).await.unwrap();
        assert_eq!(fetched.unwrap().text, "once upon a time");
    }

    #[tokio::test]
    async fn verdict_round_trips_parsed_scores() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store.create_run("run-1", &sample_battery()).await.unwrap();
        let mut scores = std::collections::BTreeMap::new();
        scores.insert("coherence".to_string(), 8.5);
        let artifact = VerdictArtifact {
            task_key: sample_task_key("run-1"),
            judge_model_id: "echo:echo-v1".to_string(),
            criteria_version_id: "v1".to_string(),
            raw_judge_text: "{\"coherence\": 8.5}".to_string(),
            parsed_scores: scores,
            fully_parsed: true,
            parse_grammar_version: 1,
            created_at: Utc::now(),
        };
        store.put_verdict(&artifact).await.unwrap();
        let fetched = store
            .get_verdict(&sample_task_key("run-1"), "echo:echo-v1", "v1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.parsed_scores.get("coherence"), Some(&8.5));
        assert!(fetched.fully_parsed);
    }

    #[tokio::test]
    async fn verdicts_from_different_judges_or_criteria_versions_coexist() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store.create_run("run-1", &sample_battery()).await.unwrap();

        let first = VerdictArtifact {
            task_key: sample_task_key("run-1"),
            judge_model_id: "echo:echo-v1".to_string(),
            criteria_version_id: "v1".to_string(),
            raw_judge_text: "{\"coherence\": 8.5}".to_string(),
            parsed_scores: std::collections::BTreeMap::new(),
            fully_parsed: true,
            parse_grammar_version: 1,
            created_at: Utc::now(),
        };
        let second = VerdictArtifact {
            judge_model_id: "other:judge-v2".to_string(),
            ..first.clone()
        };

        assert!(store.put_verdict(&first).await.unwrap());
        assert!(store.put_verdict(&second).await.unwrap());
        assert!(store
            .get_verdict(&sample_task_key("run-1"), "echo:echo-v1", "v1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_verdict(&sample_task_key("run-1"), "other:judge-v2", "v1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn set_run_status_updates_and_rejects_unknown_run() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store.create_run("run-1", &sample_battery()).await.unwrap();
        store
            .set_run_status("run-1", RunStatus::Completed)
            .await
            .unwrap();
        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let result = store.set_run_status("missing", RunStatus::Completed).await;
        assert!(result.is_err());
    }
}
