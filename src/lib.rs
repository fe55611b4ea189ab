#![allow(clippy::needless_pass_by_value)]

//! # StoryBench
//!
//! A parallel evaluation orchestrator for creative-writing LLM
//! benchmarks: concurrent multi-turn generation scheduling across
//! providers, per-provider rate governance with circuit breaking,
//! durable artifact storage with resumability, and an LLM-as-judge
//! scoring pipeline.
//!
//! ## Pipeline shape
//!
//! A [`driver::PipelineDriver`] loads a [`battery::BatteryVersion`] from a
//! [`battery::ContentSource`], then for each [`model::ModelSpec`] in a
//! [`model::ModelsFile`] fans [`worker::SequenceWorker`]s out through a
//! [`runner::ParallelRunner`], gated by a per-provider
//! [`governor::RateGovernor`]. Every response is persisted through an
//! [`store::ArtifactStore`] before the worker moves to the next prompt,
//! which is what makes a crashed or interrupted run resumable. Once
//! generation finishes, a [`judge::JudgePass`] scores each response
//! against the battery's criteria.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storybench::battery::{ContentSource, JsonDirectoryContentSource};
//! use storybench::driver::PipelineDriver;
//! use storybench::generator::EchoGenerator;
//! use storybench::judge::JudgeModel;
//! use storybench::model::ModelsFile;
//! use storybench::store::SqliteArtifactStore;
//! use storybench::worker::tokio_util_cancel::CancellationToken;
//!
//! # async fn run() -> storybench::error::Result<()> {
//! let content_source = Arc::new(JsonDirectoryContentSource::new("./battery"));
//! let generator = Arc::new(EchoGenerator);
//! let store = Arc::new(SqliteArtifactStore::open("./storybench.sqlite3")?);
//! let models_file = ModelsFile::load("./models.toml")?;
//!
//! let driver = PipelineDriver::new(
//!     content_source,
//!     generator,
//!     store,
//!     JudgeModel {
//!         provider_tag: "echo".to_string(),
//!         provider_model_name: "echo-v1".to_string(),
//!     },
//! );
//!
//! let cancel = CancellationToken::new();
//! let outcome = driver.run("run-1", &models_file, None, &cancel).await?;
//! println!("completed {} responses", outcome.responses.len());
//! # Ok(())
//! # }
//! ```

pub mod battery;
pub mod driver;
pub mod env;
pub mod error;
pub mod generator;
pub mod governor;
pub mod judge;
pub mod model;
pub mod progress;
pub mod runner;
pub mod store;
pub mod worker;

pub use error::{Result, StoryBenchError};
