pub mod gateway;
pub mod retry;

pub use gateway::StoreGateway;
pub use retry::{RetryPolicy, with_retry};

use std::time::SystemTime;

use crate::models::{
    CoreError, GlobalVars, NewProject, NewTask, NewTaskLogRecord, Project, ProjectId,
    ProjectSelector, ProjectStatus, TaskId, TaskLogRecord, TaskRecord, TaskStatus,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait ProjectStore: Send + Sync {
    /// Inserts projects with their tasks; order indexes continue after the current maximum.
    fn insert_projects(&self, projects: &[NewProject]) -> PersistenceResult<Vec<ProjectId>>;

    fn list_projects(&self) -> PersistenceResult<Vec<Project>>;

    fn project(&self, id: ProjectId) -> PersistenceResult<Option<Project>>;

    fn resolve_project(&self, selector: &ProjectSelector) -> PersistenceResult<Option<Project>>;

    /// Lowest `order_index` pending project, ties broken by creation time, with its tasks.
    fn next_pending_project(&self) -> PersistenceResult<Option<Project>>;

    fn update_project_status(&self, id: ProjectId, status: ProjectStatus)
    -> PersistenceResult<()>;

    fn count_pending_projects(&self) -> PersistenceResult<usize>;

    fn global_vars(&self, id: ProjectId) -> PersistenceResult<GlobalVars>;

    fn set_global_vars(&self, id: ProjectId, vars: &GlobalVars) -> PersistenceResult<()>;

    /// Read-modify-write of the project globals inside one transaction.
    fn merge_global_vars(&self, id: ProjectId, patch: &GlobalVars)
    -> PersistenceResult<GlobalVars>;

    /// Rolls the single running project and its running tasks back to pending.
    fn recover_interrupted_project(&self) -> PersistenceResult<Option<ProjectId>>;

    /// Marks every running or pending project and task as aborted.
    fn abort_all_projects(&self) -> PersistenceResult<usize>;

    fn switch_projects(&self, first: ProjectId, second: ProjectId) -> PersistenceResult<()>;

    /// Resets `from` (or the first task) and every later task to pending and requeues the
    /// project behind the running one, or ahead of all pending ones when nothing runs.
    fn rerun_from_task(&self, project: ProjectId, from: Option<TaskId>) -> PersistenceResult<()>;

    fn remove_project(&self, id: ProjectId) -> PersistenceResult<()>;

    fn remove_pending_projects(&self) -> PersistenceResult<usize>;
}

pub trait TaskStore: Send + Sync {
    fn task(&self, id: TaskId) -> PersistenceResult<Option<TaskRecord>>;

    fn task_by_guid(&self, project: ProjectId, guid: &str)
    -> PersistenceResult<Option<TaskRecord>>;

    fn task_by_name(&self, project: ProjectId, name: &str)
    -> PersistenceResult<Option<TaskRecord>>;

    fn tasks_for_project(&self, project: ProjectId) -> PersistenceResult<Vec<TaskRecord>>;

    fn update_task_status(&self, id: TaskId, status: TaskStatus) -> PersistenceResult<()>;

    fn update_task_times(
        &self,
        id: TaskId,
        started_at: SystemTime,
        completed_at: Option<SystemTime>,
    ) -> PersistenceResult<()>;

    fn update_task_next_guid(&self, id: TaskId, next: Option<&str>) -> PersistenceResult<()>;

    fn append_tasks(
        &self,
        project: &ProjectSelector,
        tasks: &[NewTask],
    ) -> PersistenceResult<Vec<TaskRecord>>;
}

pub trait TaskLogStore: Send + Sync {
    fn insert_task_log(&self, log: &NewTaskLogRecord) -> PersistenceResult<u64>;

    fn latest_task_log(&self, task: TaskId) -> PersistenceResult<Option<TaskLogRecord>>;

    fn list_task_logs(&self, task: TaskId) -> PersistenceResult<Vec<TaskLogRecord>>;
}

/// Everything the queue needs from a backing store.
pub trait QueueStore: MigrationStore + ProjectStore + TaskStore + TaskLogStore {}

impl<T> QueueStore for T where T: MigrationStore + ProjectStore + TaskStore + TaskLogStore {}
