use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{ProjectId, QueueState, QueueStatus, TaskId};

#[derive(Debug, Default)]
struct ControlState {
    status: QueueStatus,
    /// State restored by `unpause`.
    previous: Option<QueueState>,
}

/// Shared, volatile queue status owned by one runner.
#[derive(Clone, Debug, Default)]
pub struct QueueControl {
    inner: Arc<Mutex<ControlState>>,
}

impl QueueControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        // plain data, a poisoned lock is still usable
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> QueueStatus {
        self.lock().status.clone()
    }

    pub fn state(&self) -> QueueState {
        self.lock().status.state
    }

    /// Sets the queue state. Without `force`, a `Pending` request while paused only
    /// changes what a later `unpause` restores.
    pub fn set_state(&self, state: QueueState, force: bool) {
        let mut guard = self.lock();
        if !force && state == QueueState::Pending && guard.status.state == QueueState::Paused {
            guard.previous = Some(QueueState::Pending);
            return;
        }
        guard.status.state = state;
    }

    pub fn pause(&self) {
        let mut guard = self.lock();
        if guard.status.state != QueueState::Paused {
            guard.previous = Some(guard.status.state);
        }
        guard.status.state = QueueState::Paused;
    }

    pub fn unpause(&self) {
        let mut guard = self.lock();
        if guard.status.state != QueueState::Paused {
            return;
        }
        guard.status.state = guard.previous.take().unwrap_or(QueueState::Pending);
    }

    pub fn set_current_project(&self, project: ProjectId, project_key: &str) {
        let mut guard = self.lock();
        guard.status.current_project_id = Some(project);
        guard.status.project_key = Some(project_key.to_string());
        guard.status.progress = 0;
    }

    pub fn set_current_task(&self, task: Option<TaskId>) {
        self.lock().status.current_task_id = task;
    }

    pub fn set_progress(&self, progress: u8) {
        self.lock().status.progress = progress.min(100);
    }

    pub fn current_project(&self) -> Option<ProjectId> {
        self.lock().status.current_project_id
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.lock().status.current_task_id
    }

    /// Drops the project and task pointers and the progress counter.
    pub fn clear_current(&self) {
        let mut guard = self.lock();
        guard.status.current_project_id = None;
        guard.status.current_task_id = None;
        guard.status.project_key = None;
        guard.status.progress = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpause_restores_remembered_state() {
        let control = QueueControl::new();
        control.set_state(QueueState::Running, true);
        control.pause();
        assert_eq!(control.state(), QueueState::Paused);

        control.unpause();
        assert_eq!(control.state(), QueueState::Running);
    }

    #[test]
    fn pending_request_while_paused_only_changes_restore_target() {
        let control = QueueControl::new();
        control.set_state(QueueState::Running, true);
        control.pause();

        control.set_state(QueueState::Pending, false);
        assert_eq!(control.state(), QueueState::Paused);

        control.unpause();
        assert_eq!(control.state(), QueueState::Pending);
    }

    #[test]
    fn forced_pending_overrides_pause() {
        let control = QueueControl::new();
        control.pause();
        control.set_state(QueueState::Pending, true);
        assert_eq!(control.state(), QueueState::Pending);
    }

    #[test]
    fn repeated_pause_keeps_first_remembered_state() {
        let control = QueueControl::new();
        control.set_state(QueueState::Running, true);
        control.pause();
        control.pause();
        control.unpause();
        assert_eq!(control.state(), QueueState::Running);
    }

    #[test]
    fn unpause_without_memory_defaults_to_pending() {
        let control = QueueControl::new();
        control.pause();
        control.unpause();
        assert_eq!(control.state(), QueueState::Pending);
    }

    #[test]
    fn clear_current_resets_pointers() {
        let control = QueueControl::new();
        control.set_current_project(ProjectId(3), "job-3");
        control.set_current_task(Some(TaskId(9)));
        control.set_progress(140);
        assert_eq!(control.snapshot().progress, 100);

        control.clear_current();
        let status = control.snapshot();
        assert_eq!(status.current_project_id, None);
        assert_eq!(status.current_task_id, None);
        assert_eq!(status.project_key, None);
    }
}
