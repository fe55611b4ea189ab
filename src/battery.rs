//! Battery Version, Criteria, and the Content Source Adapter.
//!
//! A battery is fetched once at run creation and snapshotted; the
//! orchestrator never re-reads it mid-run. Directory-based loading walks
//! the tree recursively and sorts criteria by name for deterministic
//! output.

use crate::error::{Result, StoryBenchError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A single prompt within a [`Sequence`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prompt {
    /// Name of this prompt within its sequence (e.g. `"opening"`).
    pub name: String,
    /// The literal prompt text sent to the model.
    pub text: String,
}

/// An ordered list of prompts sharing accumulated context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sequence {
    /// Sequence name, unique within a battery version.
    pub name: String,
    /// Prompts in execution order.
    pub prompts: Vec<Prompt>,
}

/// A single scored dimension (e.g. coherence) with a numeric scale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Criterion {
    /// Criterion name, used as the key in a Verdict's `parsed_scores`.
    pub name: String,
    /// Human-readable description shown to the judge model.
    pub description: String,
    /// Minimum value on the scoring scale (inclusive).
    pub scale_min: f64,
    /// Maximum value on the scoring scale (inclusive).
    pub scale_max: f64,
}

/// The set of sequences and criteria snapshotted at run start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatteryVersion {
    /// Opaque version identifier, immutable once used by a run.
    pub version_id: String,
    /// Sequences in this battery, in declaration order.
    pub sequences: Vec<Sequence>,
    /// Criteria evaluated by the Judge Pass.
    pub criteria: Vec<Criterion>,
}

impl BatteryVersion {
    /// Total number of prompts across all sequences.
    #[must_use]
    pub fn total_prompts(&self) -> usize {
        self.sequences.iter().map(|s| s.prompts.len()).sum()
    }

    /// Look up a sequence by name.
    #[must_use]
    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.name == name)
    }
}

/// Read-only capability that returns the active prompt battery and
/// criteria at the start of a run. Content is fetched once and
/// snapshotted; implementations are never consulted mid-run.
#[async_trait::async_trait]
pub trait ContentSource: Send + Sync {
    /// Returns the currently active battery version, including its
    /// criteria snapshot.
    async fn get_active_battery(&self) -> Result<BatteryVersion>;
}

/// On-disk JSON layout for a `ContentSource`: one `battery.json` file
/// (an array of [`Sequence`]) and one `criteria.json` file (an array of
/// [`Criterion`]), found anywhere under the given directory. Both files
/// are read together so a battery's sequences load as a single
/// immutable snapshot rather than being merged file-by-file.
pub struct JsonDirectoryContentSource {
    root: PathBuf,
}

impl JsonDirectoryContentSource {
    /// Create a content source rooted at `root`. Does not touch the
    /// filesystem until [`ContentSource::get_active_battery`] is called.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn find_named(&self, file_name: &str) -> Result<PathBuf> {
        WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .find(|entry| entry.file_name() == file_name)
            .map(|entry| entry.path().to_path_buf())
            .ok_or_else(|| {
                StoryBenchError::Configuration(format!(
                    "{file_name} not found under {}",
                    self.root.display()
                ))
            })
    }
}

#[async_trait::async_trait]
impl ContentSource for JsonDirectoryContentSource {
    async fn get_active_battery(&self) -> Result<BatteryVersion> {
        let battery_path = self.find_named("battery.json")?;
        let criteria_path = self.find_named("criteria.json")?;

        let battery_raw = std::fs::read_to_string(&battery_path).map_err(|e| {
            StoryBenchError::Configuration(format!(
                "failed to read {}: {e}",
                battery_path.display()
            ))
        })?;
        let criteria_raw = std::fs::read_to_string(&criteria_path).map_err(|e| {
            StoryBenchError::Configuration(format!(
                "failed to read {}: {e}",
                criteria_path.display()
            ))
        })?;

        #[derive(Deserialize)]
        struct BatteryFile {
            version_id: String,
            sequences: Vec<Sequence>,
        }

        let battery_file: BatteryFile = serde_json::from_str(&battery_raw).map_err(|e| {
            StoryBenchError::Configuration(format!("malformed battery.json: {e}"))
        })?;
        let mut criteria: Vec<Criterion> = serde_json::from_str(&criteria_raw).map_err(|e| {
            StoryBenchError::Configuration(format!("malformed criteria.json: {e}"))
        })?;
        criteria.sort_by(|a, b| a.name.cmp(&b.name));

        if battery_file.sequences.is_empty() {
            return Err(StoryBenchError::Configuration(
                "battery.json declares zero sequences".to_string(),
            ));
        }

        Ok(BatteryVersion {
            version_id: battery_file.version_id,
            sequences: battery_file.sequences,
            criteria,
        })
    }
}

/// In-memory content source for tests and for callers that already hold
/// a battery snapshot, e.g. fetched from an external content system.
pub struct StaticContentSource {
    battery: BatteryVersion,
}

impl StaticContentSource {
    /// Wrap an already-constructed battery snapshot.
    #[must_use]
    pub fn new(battery: BatteryVersion) -> Self {
        Self { battery }
    }
}

#[async_trait::async_trait]
impl ContentSource for StaticContentSource {
    async fn get_active_battery(&self) -> Result<BatteryVersion> {
        Ok(self.battery.clone())
    }
}
