use std::sync::Arc;
use std::time::SystemTime;

use crate::models::{
    CoreError, GlobalVars, NewProject, NewTask, NewTaskLogRecord, Project, ProjectId,
    ProjectSelector, ProjectStatus, TaskId, TaskLogLevel, TaskLogRecord, TaskRecord, TaskStatus,
};
use crate::persistence::{PersistenceResult, QueueStore, RetryPolicy, with_retry};

/// Async face of a [`QueueStore`]: every call runs on the blocking pool under the retry
/// policy.
#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn call<T, F>(&self, operation_name: &'static str, operation: F) -> PersistenceResult<T>
    where
        T: Send + 'static,
        F: Fn(&dyn QueueStore) -> PersistenceResult<T> + Send + Sync + 'static,
    {
        let operation = Arc::new(operation);
        with_retry(self.policy, operation_name, || {
            let store = self.store.clone();
            let operation = operation.clone();
            async move {
                tokio::task::spawn_blocking(move || operation(store.as_ref()))
                    .await
                    .map_err(|error| {
                        CoreError::internal(format!(
                            "persistence worker for '{operation_name}' did not complete: {error}"
                        ))
                    })?
            }
        })
        .await
    }

    pub async fn insert_projects(
        &self,
        projects: Vec<NewProject>,
    ) -> PersistenceResult<Vec<ProjectId>> {
        self.call("insert_projects", move |store| {
            store.insert_projects(&projects)
        })
        .await
    }

    pub async fn list_projects(&self) -> PersistenceResult<Vec<Project>> {
        self.call("list_projects", |store| store.list_projects())
            .await
    }

    pub async fn project(&self, id: ProjectId) -> PersistenceResult<Option<Project>> {
        self.call("project", move |store| store.project(id)).await
    }

    pub async fn resolve_project(
        &self,
        selector: ProjectSelector,
    ) -> PersistenceResult<Option<Project>> {
        self.call("resolve_project", move |store| {
            store.resolve_project(&selector)
        })
        .await
    }

    pub async fn next_pending_project(&self) -> PersistenceResult<Option<Project>> {
        self.call("next_pending_project", |store| store.next_pending_project())
            .await
    }

    pub async fn update_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> PersistenceResult<()> {
        self.call("update_project_status", move |store| {
            store.update_project_status(id, status)
        })
        .await
    }

    pub async fn count_pending_projects(&self) -> PersistenceResult<usize> {
        self.call("count_pending_projects", |store| {
            store.count_pending_projects()
        })
        .await
    }

    pub async fn global_vars(&self, id: ProjectId) -> PersistenceResult<GlobalVars> {
        self.call("global_vars", move |store| store.global_vars(id))
            .await
    }

    pub async fn set_global_vars(&self, id: ProjectId, vars: GlobalVars) -> PersistenceResult<()> {
        self.call("set_global_vars", move |store| {
            store.set_global_vars(id, &vars)
        })
        .await
    }

    pub async fn merge_global_vars(
        &self,
        id: ProjectId,
        patch: GlobalVars,
    ) -> PersistenceResult<GlobalVars> {
        self.call("merge_global_vars", move |store| {
            store.merge_global_vars(id, &patch)
        })
        .await
    }

    /// Sets a single global, keeping the rest of the map.
    pub async fn set_global_var(
        &self,
        id: ProjectId,
        key: &str,
        value: serde_json::Value,
    ) -> PersistenceResult<GlobalVars> {
        let mut patch = GlobalVars::new();
        patch.insert(key.to_string(), value);
        self.merge_global_vars(id, patch).await
    }

    pub async fn recover_interrupted_project(&self) -> PersistenceResult<Option<ProjectId>> {
        self.call("recover_interrupted_project", |store| {
            store.recover_interrupted_project()
        })
        .await
    }

    pub async fn abort_all_projects(&self) -> PersistenceResult<usize> {
        self.call("abort_all_projects", |store| store.abort_all_projects())
            .await
    }

    pub async fn switch_projects(
        &self,
        first: ProjectId,
        second: ProjectId,
    ) -> PersistenceResult<()> {
        self.call("switch_projects", move |store| {
            store.switch_projects(first, second)
        })
        .await
    }

    pub async fn rerun_from_task(
        &self,
        project: ProjectId,
        from: Option<TaskId>,
    ) -> PersistenceResult<()> {
        self.call("rerun_from_task", move |store| {
            store.rerun_from_task(project, from)
        })
        .await
    }

    pub async fn remove_project(&self, id: ProjectId) -> PersistenceResult<()> {
        self.call("remove_project", move |store| store.remove_project(id))
            .await
    }

    pub async fn remove_pending_projects(&self) -> PersistenceResult<usize> {
        self.call("remove_pending_projects", |store| {
            store.remove_pending_projects()
        })
        .await
    }

    pub async fn task(&self, id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.call("task", move |store| store.task(id)).await
    }

    pub async fn task_by_guid(
        &self,
        project: ProjectId,
        guid: &str,
    ) -> PersistenceResult<Option<TaskRecord>> {
        let guid = guid.to_string();
        self.call("task_by_guid", move |store| {
            store.task_by_guid(project, &guid)
        })
        .await
    }

    pub async fn task_by_name(
        &self,
        project: ProjectId,
        name: &str,
    ) -> PersistenceResult<Option<TaskRecord>> {
        let name = name.to_string();
        self.call("task_by_name", move |store| {
            store.task_by_name(project, &name)
        })
        .await
    }

    pub async fn tasks_for_project(&self, project: ProjectId) -> PersistenceResult<Vec<TaskRecord>> {
        self.call("tasks_for_project", move |store| {
            store.tasks_for_project(project)
        })
        .await
    }

    pub async fn update_task_status(&self, id: TaskId, status: TaskStatus) -> PersistenceResult<()> {
        self.call("update_task_status", move |store| {
            store.update_task_status(id, status)
        })
        .await
    }

    pub async fn update_task_times(
        &self,
        id: TaskId,
        started_at: SystemTime,
        completed_at: Option<SystemTime>,
    ) -> PersistenceResult<()> {
        self.call("update_task_times", move |store| {
            store.update_task_times(id, started_at, completed_at)
        })
        .await
    }

    pub async fn update_task_next_guid(
        &self,
        id: TaskId,
        next: Option<String>,
    ) -> PersistenceResult<()> {
        self.call("update_task_next_guid", move |store| {
            store.update_task_next_guid(id, next.as_deref())
        })
        .await
    }

    pub async fn append_tasks(
        &self,
        project: ProjectSelector,
        tasks: Vec<NewTask>,
    ) -> PersistenceResult<Vec<TaskRecord>> {
        self.call("append_tasks", move |store| {
            store.append_tasks(&project, &tasks)
        })
        .await
    }

    pub async fn insert_task_log(&self, log: NewTaskLogRecord) -> PersistenceResult<u64> {
        self.call("insert_task_log", move |store| store.insert_task_log(&log))
            .await
    }

    pub async fn append_log(
        &self,
        task: TaskId,
        status: Option<TaskStatus>,
        level: TaskLogLevel,
        message: impl Into<String>,
    ) -> PersistenceResult<u64> {
        self.insert_task_log(NewTaskLogRecord::new(task, status, level, message))
            .await
    }

    pub async fn latest_task_log(&self, task: TaskId) -> PersistenceResult<Option<TaskLogRecord>> {
        self.call("latest_task_log", move |store| store.latest_task_log(task))
            .await
    }

    pub async fn list_task_logs(&self, task: TaskId) -> PersistenceResult<Vec<TaskLogRecord>> {
        self.call("list_task_logs", move |store| store.list_task_logs(task))
            .await
    }
}
