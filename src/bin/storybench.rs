//! Command-line entry point for StoryBench.
//!
//! Exposes `run`/`resume`/`status` subcommands, mapping pipeline
//! outcomes to process exit codes.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use storybench::battery::JsonDirectoryContentSource;
use storybench::driver::PipelineDriver;
use storybench::generator::EchoGenerator;
use storybench::judge::JudgeModel;
use storybench::model::ModelsFile;
use storybench::store::{ArtifactStore, SqliteArtifactStore};
use storybench::worker::tokio_util_cancel::CancellationToken;

#[derive(Parser)]
#[command(name = "storybench", version, about = "Creative-writing LLM benchmark orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run (or continue one with the same run-id).
    Run {
        /// Defaults to a freshly generated UUID when omitted.
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        battery_dir: String,
        #[arg(long)]
        models_file: String,
        #[arg(long, default_value = "storybench.sqlite3")]
        store_path: String,
        #[arg(long, default_value = "echo")]
        judge_provider_tag: String,
        #[arg(long, default_value = "echo-v1")]
        judge_model_name: String,
    },
    /// Resume a previously started run by its run-id (identical to `run`;
    /// resumability is inherent to the artifact store's idempotent writes).
    Resume {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        battery_dir: String,
        #[arg(long)]
        models_file: String,
        #[arg(long, default_value = "storybench.sqlite3")]
        store_path: String,
        #[arg(long, default_value = "echo")]
        judge_provider_tag: String,
        #[arg(long, default_value = "echo-v1")]
        judge_model_name: String,
    },
    /// Print the stored status of a run.
    Status {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "storybench.sqlite3")]
        store_path: String,
    },
}

/// Exit codes: `0` success, `1` run failure, `2` configuration error,
/// `130` cancelled (128 + SIGINT, the POSIX convention for interrupted
/// processes).
const EXIT_SUCCESS: u8 = 0;
const EXIT_RUN_FAILED: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run {
            run_id,
            battery_dir,
            models_file,
            store_path,
            judge_provider_tag,
            judge_model_name,
        } => {
            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_pipeline(
                &run_id,
                &battery_dir,
                &models_file,
                &store_path,
                &judge_provider_tag,
                &judge_model_name,
            )
            .await
        }
        Command::Resume {
            run_id,
            battery_dir,
            models_file,
            store_path,
            judge_provider_tag,
            judge_model_name,
        } => {
            run_pipeline(
                &run_id,
                &battery_dir,
                &models_file,
                &store_path,
                &judge_provider_tag,
                &judge_model_name,
            )
            .await
        }
        Command::Status { run_id, store_path } => status(&run_id, &store_path).await,
    };

    ExitCode::from(code)
}

async fn run_pipeline(
    run_id: &str,
    battery_dir: &str,
    models_file_path: &str,
    store_path: &str,
    judge_provider_tag: &str,
    judge_model_name: &str,
) -> u8 {
    let models_file = match ModelsFile::load(models_file_path) {
        Ok(file) => file,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let store = match SqliteArtifactStore::open(store_path) {
        Ok(store) => Arc::new(store),
        Err(error) => {
            eprintln!("failed to open artifact store: {error}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let content_source = Arc::new(JsonDirectoryContentSource::new(battery_dir));
    let generator = Arc::new(EchoGenerator);
    let driver = PipelineDriver::new(
        content_source,
        generator,
        store,
        JudgeModel {
            provider_tag: judge_provider_tag.to_string(),
            provider_model_name: judge_model_name.to_string(),
        },
    );

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    match driver.run(run_id, &models_file, None, &cancel).await {
        Ok(outcome) if outcome.cancelled => {
            eprintln!("run '{run_id}' cancelled");
            EXIT_CANCELLED
        }
        Ok(outcome) if outcome.failures.is_empty() => {
            println!(
                "run '{run_id}' completed: {} responses",
                outcome.responses.len()
            );
            EXIT_SUCCESS
        }
        Ok(outcome) => {
            eprintln!(
                "run '{run_id}' finished with {} failures out of {} responses",
                outcome.failures.len(),
                outcome.responses.len()
            );
            for (model_id, sequence_name, prompt_index, error) in &outcome.failures {
                eprintln!("  {model_id}/{sequence_name}[{prompt_index}]: {error}");
            }
            EXIT_RUN_FAILED
        }
        Err(error) => {
            eprintln!("run '{run_id}' failed to start: {error}");
            EXIT_CONFIG_ERROR
        }
    }
}

async fn status(run_id: &str, store_path: &str) -> u8 {
    let store = match SqliteArtifactStore::open(store_path) {
        Ok(store) => store,
        Err(error) => {
            eprintln!("failed to open artifact store: {error}");
            return EXIT_CONFIG_ERROR;
        }
    };

    match store.get_run(run_id).await {
        Ok(Some(run)) => {
            println!("run_id: {}", run.run_id);
            println!("battery_version_id: {}", run.battery_version_id);
            println!("status: {:?}", run.status);
            println!("created_at: {}", run.created_at);
            EXIT_SUCCESS
        }
        Ok(None) => {
            eprintln!("no such run '{run_id}'");
            EXIT_CONFIG_ERROR
        }
        Err(error) => {
            eprintln!("failed to read run status: {error}");
            EXIT_CONFIG_ERROR
        }
    }
}
