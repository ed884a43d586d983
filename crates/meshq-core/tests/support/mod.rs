#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use meshq_core::engine::{
    BuildEngine, BuildOutcome, BuildParams, BuildVersion, EngineHealth, EngineResult,
    EngineStatus, PhotoFolder,
};
use meshq_core::models::{CoreError, CoreErrorKind, TaskRecord};
use meshq_core::notify::{NotificationSink, QueueEvent};
use meshq_core::orchestration::{EnvelopeConfig, RunnerConfig};
use meshq_core::persistence::{RetryPolicy, StoreGateway};
use meshq_core::sqlite::SqliteStore;
use meshq_core::workers::{TaskWorker, WorkerContext, WorkerResult};

pub const FAKE_TASK_TYPE: &str = "Fake";

/// `action` codes understood by [`FakeWorker`].
pub const SUCCEED: i64 = 0;
pub const RETURN_FALSE: i64 = 1;
pub const FAIL: i64 = 2;
pub const BLOCK_UNTIL_ABORT: i64 = 3;
pub const CANCELLED: i64 = 4;
/// Rewrites the task's own successor to the `next` param (null clears it), then succeeds.
pub const REDIRECT: i64 = 5;

pub fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("meshq-{test_name}-{nanos}.sqlite3"))
}

pub fn migrated_store(test_name: &str) -> Arc<SqliteStore> {
    let store = SqliteStore::new(test_db_path(test_name));
    store.migrate_to_latest().expect("migrations should apply");
    Arc::new(store)
}

pub fn gateway(test_name: &str) -> StoreGateway {
    StoreGateway::new(migrated_store(test_name))
        .with_policy(RetryPolicy::new(3, Duration::from_millis(1)))
}

pub fn fast_envelope_config() -> EnvelopeConfig {
    EnvelopeConfig {
        health_probe_interval: Duration::from_millis(20),
        health_timeout: Duration::from_millis(100),
        completion_delay: Duration::from_millis(1),
        abort_timeout: Duration::from_millis(500),
    }
}

pub fn fast_runner_config() -> RunnerConfig {
    RunnerConfig {
        poll_interval: Duration::from_millis(20),
        pause_poll_interval: Duration::from_millis(10),
        post_task_delay: Duration::from_millis(1),
        recovery_flag_timeout: Duration::from_millis(200),
        recovery_override: None,
    }
}

/// Keeps every broadcast event for later inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<QueueEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().expect("notifier lock").clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().iter().map(QueueEvent::name).collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn broadcast(&self, event: QueueEvent) {
        self.events.lock().expect("notifier lock").push(event);
    }
}

/// In-memory build engine that records every call.
pub struct FakeEngine {
    alive: AtomicBool,
    recovery_enabled: AtomicBool,
    hold_builds: AtomicBool,
    calls: Mutex<Vec<String>>,
    loaded_project: Mutex<Option<String>>,
    build_outcome: Mutex<BuildOutcome>,
    versions: Mutex<Vec<BuildVersion>>,
    build_cancelled: Notify,
    health_probes: AtomicUsize,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
            recovery_enabled: AtomicBool::new(false),
            hold_builds: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            loaded_project: Mutex::new(None),
            build_outcome: Mutex::new(BuildOutcome::Success),
            versions: Mutex::new(Vec::new()),
            build_cancelled: Notify::new(),
            health_probes: AtomicUsize::new(0),
        }
    }
}

impl FakeEngine {
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_recovery_enabled(&self, enabled: bool) {
        self.recovery_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Builds run until `cancel_build` is called.
    pub fn hold_builds(&self) {
        self.hold_builds.store(true, Ordering::SeqCst);
    }

    pub fn set_build_outcome(&self, outcome: BuildOutcome) {
        *self.build_outcome.lock().expect("engine lock") = outcome;
    }

    pub fn set_versions(&self, names: &[&str]) {
        *self.versions.lock().expect("engine lock") = names
            .iter()
            .map(|name| BuildVersion {
                name: name.to_string(),
            })
            .collect();
    }

    pub fn set_loaded_project(&self, path: Option<&str>) {
        *self.loaded_project.lock().expect("engine lock") = path.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("engine lock").clone()
    }

    pub fn health_probes(&self) -> usize {
        self.health_probes.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("engine lock").push(call.into());
    }
}

#[async_trait]
impl BuildEngine for FakeEngine {
    async fn health(&self) -> EngineHealth {
        self.health_probes.fetch_add(1, Ordering::SeqCst);
        if self.alive.load(Ordering::SeqCst) {
            EngineHealth::alive("8.0.4.1234")
        } else {
            EngineHealth::unreachable()
        }
    }

    async fn queue_recovery_enabled(&self) -> EngineResult<bool> {
        Ok(self.recovery_enabled.load(Ordering::SeqCst))
    }

    async fn status(&self) -> EngineResult<EngineStatus> {
        Ok(EngineStatus {
            project_path: self.loaded_project.lock().expect("engine lock").clone(),
            ..EngineStatus::default()
        })
    }

    async fn save_project(&self) -> EngineResult<()> {
        self.record("save_project");
        Ok(())
    }

    async fn close_project(&self) -> EngineResult<()> {
        self.record("close_project");
        self.set_loaded_project(None);
        Ok(())
    }

    async fn open_project(&self, path: &str) -> EngineResult<()> {
        self.record(format!("open_project {path}"));
        self.set_loaded_project(Some(path));
        Ok(())
    }

    async fn new_project(&self, path: &str) -> EngineResult<()> {
        self.record(format!("new_project {path}"));
        self.set_loaded_project(Some(path));
        Ok(())
    }

    async fn build_versions(&self) -> EngineResult<Vec<BuildVersion>> {
        Ok(self.versions.lock().expect("engine lock").clone())
    }

    async fn load_build_version(&self, name: &str) -> EngineResult<()> {
        self.record(format!("load_build_version {name}"));
        Ok(())
    }

    async fn exit_review_mode(&self) -> EngineResult<()> {
        self.record("exit_review_mode");
        Ok(())
    }

    async fn create_build_version(&self, copy_at: bool) -> EngineResult<()> {
        self.record(format!("create_build_version copy_at={copy_at}"));
        Ok(())
    }

    async fn set_max_pool_fusers(&self, count: u32) -> EngineResult<()> {
        self.record(format!("set_max_pool_fusers {count}"));
        Ok(())
    }

    async fn set_max_aws_fusers(&self, count: u32) -> EngineResult<()> {
        self.record(format!("set_max_aws_fusers {count}"));
        Ok(())
    }

    async fn set_aws_build_configuration_name(&self, name: &str) -> EngineResult<()> {
        self.record(format!("set_aws_build_configuration_name {name}"));
        Ok(())
    }

    async fn set_aws_build_configuration_json_path(&self, path: &str) -> EngineResult<()> {
        self.record(format!("set_aws_build_configuration_json_path {path}"));
        Ok(())
    }

    async fn set_aws_fuser_startup_script(&self, script: &str) -> EngineResult<()> {
        self.record(format!("set_aws_fuser_startup_script {script}"));
        Ok(())
    }

    async fn start_build(&self, params: &BuildParams) -> EngineResult<BuildOutcome> {
        let cancelled = self.build_cancelled.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        self.record(format!(
            "start_build {} {}..{}",
            params.preset,
            params.build_from.as_str(),
            params.build_until.as_str()
        ));
        if self.hold_builds.load(Ordering::SeqCst) {
            cancelled.await;
            return Ok(BuildOutcome::Cancelled);
        }
        Ok(self.build_outcome.lock().expect("engine lock").clone())
    }

    async fn cancel_build(&self) -> EngineResult<()> {
        self.record("cancel_build");
        self.build_cancelled.notify_waiters();
        Ok(())
    }

    async fn set_at_area(&self, wkt: &str) -> EngineResult<()> {
        self.record(format!("set_at_area {wkt}"));
        Ok(())
    }

    async fn set_reconstruction_area(&self, wkt: &str) -> EngineResult<()> {
        self.record(format!("set_reconstruction_area {wkt}"));
        Ok(())
    }

    async fn set_reference_project(&self, path: &str) -> EngineResult<()> {
        self.record(format!("set_reference_project {path}"));
        Ok(())
    }

    async fn import_gcp(&self, gcp_file_list: &str) -> EngineResult<()> {
        self.record(format!("import_gcp {gcp_file_list}"));
        Ok(())
    }

    async fn load_gcp_list(&self, path: &str, json_api: &str) -> EngineResult<()> {
        self.record(format!("load_gcp_list {path} {json_api}"));
        Ok(())
    }

    async fn load_photo_folders(&self, folders: &[PhotoFolder]) -> EngineResult<()> {
        let names = folders
            .iter()
            .map(|folder| folder.folder.as_str())
            .collect::<Vec<_>>();
        self.record(format!("load_photo_folders {}", names.join(";")));
        Ok(())
    }

    async fn import_photos_from_video(
        &self,
        video_path: &str,
        properties: &str,
        focal_length_35: f64,
    ) -> EngineResult<()> {
        self.record(format!(
            "import_photos_from_video {video_path} {properties} {focal_length_35}"
        ));
        Ok(())
    }

    async fn load_photos_list(&self, path: &str) -> EngineResult<()> {
        self.record(format!("load_photos_list {path}"));
        Ok(())
    }

    async fn load_photos_list_csv(&self, path: &str, json_api: &str) -> EngineResult<()> {
        self.record(format!("load_photos_list_csv {path} {json_api}"));
        Ok(())
    }
}

/// Worker whose outcome is chosen by the task's `action` code.
#[derive(Default)]
pub struct FakeWorker {
    seen_params: Mutex<Vec<Value>>,
    aborted: Notify,
    abort_calls: AtomicUsize,
    resets: AtomicUsize,
    started: Notify,
}

impl FakeWorker {
    pub fn seen_params(&self) -> Vec<Value> {
        self.seen_params.lock().expect("worker lock").clone()
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Resolves once a blocking task has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl TaskWorker for FakeWorker {
    fn task_type(&self) -> &str {
        FAKE_TASK_TYPE
    }

    async fn start(&self, ctx: &WorkerContext, task: &TaskRecord) -> WorkerResult<bool> {
        self.seen_params
            .lock()
            .expect("worker lock")
            .push(task.task_params.clone());

        match task.action {
            SUCCEED => Ok(true),
            RETURN_FALSE => Ok(false),
            FAIL => Err(CoreError::new(CoreErrorKind::ProcessFailure, "boom")),
            CANCELLED => Err(CoreError::cancelled("Task was aborted")),
            REDIRECT => {
                let next = task.task_params["next"].as_str().map(str::to_string);
                ctx.gateway.update_task_next_guid(task.id, next).await?;
                Ok(true)
            }
            BLOCK_UNTIL_ABORT => {
                let aborted = self.aborted.notified();
                tokio::pin!(aborted);
                aborted.as_mut().enable();
                self.started.notify_one();
                aborted.await;
                // finishing "successfully" after the abort must still count as aborted
                Ok(true)
            }
            other => Err(CoreError::new(
                CoreErrorKind::UnsupportedAction,
                format!("Unsupported Fake action: {other}"),
            )),
        }
    }

    async fn abort(&self) -> WorkerResult<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.aborted.notify_waiters();
        Ok(())
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
