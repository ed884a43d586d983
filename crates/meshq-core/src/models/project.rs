use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::SystemTime;

use crate::models::{CoreError, NewTask, TaskRecord, TaskStatus};

/// Globals key holding the id of the task currently being executed.
pub const CURRENT_TASK_ID_VAR: &str = "$$current_task_id";
/// Globals key holding the task id -> guid index of the whole project.
pub const PROJECT_TASKS_VAR: &str = "$$project_tasks_dict";
/// Globals key holding the engine project path opened or created by a task.
pub const PROJECT_PATH_VAR: &str = "$$project_path";

pub type GlobalVars = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Running => "running",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Aborted => "aborted",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(ProjectStatus::Pending),
            "running" => Ok(ProjectStatus::Running),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            "aborted" => Ok(ProjectStatus::Aborted),
            _ => Err(CoreError::invalid_input(format!(
                "unknown project status '{raw}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub project_key: String,
    pub manager: Option<String>,
    pub global_vars: GlobalVars,
    pub tasks: Vec<TaskRecord>,
    pub order_index: i64,
    pub status: ProjectStatus,
    pub created_at: SystemTime,
}

impl Project {
    /// First task that has not run yet, in persisted insertion order.
    pub fn first_pending_task(&self) -> Option<&TaskRecord> {
        self.tasks
            .iter()
            .find(|task| task.status == TaskStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub project_key: String,
    pub manager: Option<String>,
    pub global_vars: GlobalVars,
    pub tasks: Vec<NewTask>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectSelector {
    Id(ProjectId),
    Key(String),
}

impl From<ProjectId> for ProjectSelector {
    fn from(value: ProjectId) -> Self {
        ProjectSelector::Id(value)
    }
}
