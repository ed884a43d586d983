pub mod error;
pub mod project;
pub mod queue;
pub mod task;
pub mod task_log;

pub use error::{CoreError, CoreErrorKind};
pub use project::{
    CURRENT_TASK_ID_VAR, GlobalVars, NewProject, PROJECT_PATH_VAR, PROJECT_TASKS_VAR, Project,
    ProjectId, ProjectSelector, ProjectStatus,
};
pub use queue::{QueueState, QueueStatus};
pub use task::{NewTask, TaskId, TaskRecord, TaskStatus};
pub use task_log::{NewTaskLogRecord, TaskLogLevel, TaskLogRecord};
