mod cli;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use meshq_core::config::QueueConfig;
use meshq_core::engine::{BuildEngine, HttpBuildEngine};
use meshq_core::ingest::{IngestContext, normalize_submission};
use meshq_core::models::{CoreError, ProjectId, TaskId};
use meshq_core::notify::{NotificationSink, TracingNotifier};
use meshq_core::orchestration::QueueRunner;
use meshq_core::persistence::StoreGateway;
use meshq_core::registry::WorkerRegistry;
use meshq_core::sqlite::SqliteStore;
use serde::Serialize;

use crate::cli::{CliArgs, Command};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = cli::parse();
    logging::init_logging(args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(kind = ?error.kind, message = %error.message, "meshq failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<(), CoreError> {
    let mut config = QueueConfig::from_env()?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let store = Arc::new(SqliteStore::new(config.database_path.clone()));
    {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.migrate_to_latest())
            .await
            .map_err(|error| CoreError::internal(format!("migration task failed: {error}")))??;
    }
    let gateway = StoreGateway::new(store).with_policy(config.retry);

    match args.command {
        Command::Run => run_queue(config, gateway).await,
        Command::Enqueue { file } => {
            let raw = std::fs::read_to_string(&file).map_err(|error| {
                CoreError::not_found(format!("cannot read {}: {error}", file.display()))
            })?;
            let submission: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|error| CoreError::invalid_input(format!("invalid JSON: {error}")))?;

            let engine = HttpBuildEngine::new(config.engine.clone());
            let version = engine.health().await.version.unwrap_or_default();
            let projects = normalize_submission(&submission, &IngestContext::detect(version))?;
            let ids = gateway.insert_projects(projects).await?;
            print_json(&ids)
        }
        Command::List => print_json(&gateway.list_projects().await?),
        Command::Rerun { project, task } => {
            gateway
                .rerun_from_task(ProjectId(project), task.map(TaskId))
                .await
        }
        Command::Switch { first, second } => {
            gateway
                .switch_projects(ProjectId(first), ProjectId(second))
                .await
        }
        Command::Reason { task } => {
            match gateway.latest_task_log(TaskId(task)).await? {
                Some(log) => println!("{}", log.message),
                None => println!("no log entries for task {task}"),
            }
            Ok(())
        }
        Command::Logs { task } => print_json(&gateway.list_task_logs(TaskId(task)).await?),
        Command::Remove { project } => gateway.remove_project(ProjectId(project)).await,
    }
}

async fn run_queue(config: QueueConfig, gateway: StoreGateway) -> Result<(), CoreError> {
    let engine: Arc<dyn BuildEngine> = Arc::new(HttpBuildEngine::connect(config.engine.clone())?);
    let notifier: Arc<dyn NotificationSink> = Arc::new(TracingNotifier);
    let registry = Arc::new(WorkerRegistry::standard(
        engine.clone(),
        gateway.clone(),
        notifier.clone(),
        &config,
    ));

    let runner = QueueRunner::new(gateway, registry, engine, notifier, config.runner.clone());
    runner.start().await?;
    tracing::info!(
        database = %config.database_path.display(),
        engine = %config.engine.base_url,
        "queue runner started"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| CoreError::internal(format!("cannot listen for Ctrl-C: {error}")))?;
    tracing::info!("shutting down queue runner");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, runner.stop()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "queue runner did not stop in time"
            );
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoreError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|error| CoreError::internal(format!("cannot render output: {error}")))?;
    println!("{text}");
    Ok(())
}
