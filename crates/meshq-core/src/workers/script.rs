use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessHandle, ProcessOutput,
    ProcessSpawnRequest, ProcessTerminationMode, spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind, TaskRecord};
use crate::workers::params::{self, ScriptParams};
use crate::workers::{TaskWorker, WorkerContext, WorkerResult, unsupported_action};

pub const QUEUE_TASK_TYPE: &str = "Queue";

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum QueueAction {
    Script,
    Pause,
}

impl QueueAction {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(QueueAction::Script),
            4 => Some(QueueAction::Pause),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            QueueAction::Script => 0,
            QueueAction::Pause => 4,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptWorkerConfig {
    pub python: PathBuf,
    pub node: PathBuf,
    /// Queue service port handed to every script as `--port=`.
    pub queue_port: Option<u16>,
    /// Pause after a clean exit before the task counts as completed.
    pub success_delay: Duration,
    /// How long `abort` waits after SIGTERM before treating the script as gone.
    pub abort_grace: Duration,
}

impl Default for ScriptWorkerConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python"),
            node: PathBuf::from("node"),
            queue_port: None,
            success_delay: Duration::from_secs(2),
            abort_grace: Duration::from_secs(1),
        }
    }
}

/// Runs external scripts for `Queue` tasks.
pub struct ScriptWorker {
    executor: Arc<dyn ProcessExecutor>,
    config: ScriptWorkerConfig,
    current: Mutex<Option<ProcessHandle>>,
}

impl ScriptWorker {
    pub fn new(executor: Arc<dyn ProcessExecutor>, config: ScriptWorkerConfig) -> Self {
        Self {
            executor,
            config,
            current: Mutex::new(None),
        }
    }

    fn take_current(&self) -> Option<ProcessHandle> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn set_current(&self, handle: Option<ProcessHandle>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
    }

    /// Builds the interpreter invocation for a comma-separated `path` parameter.
    pub fn command_for(&self, raw_path: &str) -> WorkerResult<CommandSpec> {
        let mut parts = raw_path
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty());
        let script = parts
            .next()
            .ok_or_else(|| CoreError::invalid_input("task_params.path is required"))?;

        if !Path::new(script).exists() {
            return Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!("Script file not found: {script}"),
            ));
        }

        let interpreter = if script.ends_with(".py") || script.contains(".py ") {
            &self.config.python
        } else {
            &self.config.node
        };

        let mut command = CommandSpec::new(interpreter).arg(script).args(parts);
        if let Some(port) = self.config.queue_port {
            command = command.arg(format!("--port={port}"));
        }
        Ok(command)
    }

    async fn run_script(&self, ctx: &WorkerContext, task: &TaskRecord) -> WorkerResult<()> {
        let params: ScriptParams = params::decode(task)?;
        let raw_path = params
            .path
            .ok_or_else(|| CoreError::invalid_input("task_params.path is required"))?;
        let command = self.command_for(&raw_path)?;

        tracing::info!(
            project_id = ctx.project.id.0,
            task_id = task.id.0,
            command = %command.display(),
            "starting script"
        );

        let request = ProcessSpawnRequest::new(command).task_id(task.id);
        let process = spawn_validated(self.executor.as_ref(), request)?;
        self.set_current(Some(process.handle()));

        let output = process.wait().await;
        self.set_current(None);
        let output = output?;
        log_output(task, &output);

        match output.status {
            ProcessExitStatus::ExitCode(0) => {
                tokio::time::sleep(self.config.success_delay).await;
                Ok(())
            }
            ProcessExitStatus::Signaled(signal) if signal == SIGTERM => {
                Err(CoreError::cancelled("Task was aborted").for_task(task.id))
            }
            ProcessExitStatus::Signaled(signal) => Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("Script terminated by signal {signal}"),
            )
            .for_task(task.id)),
            ProcessExitStatus::ExitCode(code) => Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("Script exited with code {code}"),
            )
            .for_task(task.id)),
        }
    }
}

#[async_trait]
impl TaskWorker for ScriptWorker {
    fn task_type(&self) -> &str {
        QUEUE_TASK_TYPE
    }

    async fn start(&self, ctx: &WorkerContext, task: &TaskRecord) -> WorkerResult<bool> {
        match QueueAction::from_code(task.action) {
            Some(QueueAction::Script) => self.run_script(ctx, task).await.map(|()| true),
            Some(QueueAction::Pause) => {
                ctx.control.pause();
                Ok(true)
            }
            None => Err(unsupported_action(QUEUE_TASK_TYPE, task.action)),
        }
    }

    async fn stop(&self) -> WorkerResult<()> {
        match self.take_current() {
            Some(handle) => handle.terminate(ProcessTerminationMode::Graceful),
            None => Ok(()),
        }
    }

    async fn abort(&self) -> WorkerResult<()> {
        if let Some(handle) = self.take_current() {
            handle.terminate(ProcessTerminationMode::Graceful)?;
            tokio::time::sleep(self.config.abort_grace).await;
        }
        Ok(())
    }

    fn reset(&self) {
        self.set_current(None);
    }
}

fn log_output(task: &TaskRecord, output: &ProcessOutput) {
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        tracing::info!(task_id = task.id.0, "stdout: {line}");
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::warn!(task_id = task.id.0, "stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TokioProcessExecutor;

    fn worker(config: ScriptWorkerConfig) -> ScriptWorker {
        ScriptWorker::new(Arc::new(TokioProcessExecutor), config)
    }

    #[test]
    fn missing_script_is_reported_with_its_path() {
        let error = worker(ScriptWorkerConfig::default())
            .command_for("/definitely/not/here.py,--fast")
            .unwrap_err();
        assert_eq!(error.message, "Script file not found: /definitely/not/here.py");
    }

    #[test]
    fn python_scripts_use_python_interpreter_and_get_port() {
        let dir = std::env::temp_dir();
        let script = dir.join(format!(
            "meshq-script-{}.py",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&script, "print('ok')\n").unwrap();

        let config = ScriptWorkerConfig {
            python: PathBuf::from("/usr/bin/python3"),
            queue_port: Some(8088),
            ..ScriptWorkerConfig::default()
        };
        let raw = format!("{}, --tiles=4", script.display());
        let command = worker(config).command_for(&raw).unwrap();

        assert_eq!(command.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(
            command.args,
            vec![
                script.display().to_string(),
                "--tiles=4".to_string(),
                "--port=8088".to_string()
            ]
        );
        let _ = std::fs::remove_file(script);
    }

    #[test]
    fn queue_opcodes() {
        assert_eq!(QueueAction::from_code(0), Some(QueueAction::Script));
        assert_eq!(QueueAction::from_code(4), Some(QueueAction::Pause));
        assert_eq!(QueueAction::from_code(5), None);
    }
}
