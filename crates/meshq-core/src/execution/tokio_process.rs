use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessTerminationMode, ProcessWaitFuture, RunningProcess, process_failure,
};
use crate::models::{CoreError, CoreErrorKind, TaskId};

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|error| {
            process_failure(
                request.task_id,
                format!(
                    "failed to spawn '{}': {error}",
                    request.command.program.display()
                ),
            )
        })?;

        let pid = child.id();
        let started_at = SystemTime::now();

        tracing::debug!(
            task_id = ?request.task_id,
            pid = ?pid,
            command = %request.command.display(),
            "spawned process"
        );

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at,
            timeout: request.timeout,
            task_id: request.task_id,
        }))
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    task_id: Option<TaskId>,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let child = self.child.into_inner().ok().flatten();
        let timeout = self.timeout;
        let started_at = self.started_at;
        let task_id = self.task_id;
        let pid = self.pid;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                process_failure(task_id, "child process already consumed".to_string())
            })?;

            let stdout_reader = {
                let mut stdout = child.stdout.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stdout.take() {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };
            let stderr_reader = {
                let mut stderr = child.stderr.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stderr.take() {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };

            let wait_err = |error: std::io::Error| {
                process_failure(task_id, format!("failed to wait for process: {error}"))
            };

            // Descendants may inherit stdout/stderr, so output is collected after exit
            // with a bounded read window.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        if let Some(pid) = pid {
                            let _ = signal_process_group(pid, ProcessTerminationMode::Immediate);
                        }
                        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        let error = CoreError::new(
                            CoreErrorKind::Timeout,
                            format!("process timed out after {}ms", timeout_duration.as_millis()),
                        );
                        return Err(match task_id {
                            Some(task_id) => error.for_task(task_id),
                            None => error,
                        });
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let read_deadline = Duration::from_millis(250);
            let stdout = match tokio::time::timeout(read_deadline, stdout_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(read_deadline, stderr_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };

            Ok(ProcessOutput {
                status: exit_status(status),
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

#[cfg(unix)]
fn exit_status(status: std::process::ExitStatus) -> ProcessExitStatus {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExitStatus::ExitCode(code),
        (None, Some(signal)) => ProcessExitStatus::Signaled(signal),
        (None, None) => ProcessExitStatus::ExitCode(-1),
    }
}

#[cfg(not(unix))]
fn exit_status(status: std::process::ExitStatus) -> ProcessExitStatus {
    ProcessExitStatus::ExitCode(status.code().unwrap_or(-1))
}

/// Sends the termination signal to the whole process group led by `pid`.
#[cfg(unix)]
pub(crate) fn signal_process_group(pid: u32, mode: ProcessTerminationMode) -> ExecutionResult<()> {
    let signal = match mode {
        ProcessTerminationMode::Immediate => libc::SIGKILL,
        ProcessTerminationMode::Graceful => libc::SIGTERM,
    };

    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        // already gone
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(process_failure(
                None,
                format!("failed to send signal {signal} to process group {pid}: {os_error}"),
            ));
        }
    }

    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn signal_process_group(pid: u32, _mode: ProcessTerminationMode) -> ExecutionResult<()> {
    Err(CoreError::new(
        CoreErrorKind::UnsupportedAction,
        format!("process group signalling is unavailable on this platform (pid {pid})"),
    ))
}
