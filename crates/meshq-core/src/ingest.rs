//! Turns a queue submission document into insertable projects.
//!
//! Two shapes are accepted. Versioned submissions carry `version` and a list of projects
//! with their tasks. Unversioned (legacy) submissions are a flat list of build steps under
//! `projects` and become a single project.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{CoreError, CoreErrorKind, GlobalVars, NewProject, NewTask};
use crate::workers::params::lenient_i64;
use crate::workers::photomesh::PHOTOMESH_TASK_TYPE;
use crate::workers::script::{QUEUE_TASK_TYPE, QueueAction};

const LEGACY_PROJECT_KEY: &str = "proj0";
const LEGACY_SCRIPT_ACTION: i64 = 5;

/// Values substituted for the `$Date`, `$Hostname` and `$Version` keywords.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngestContext {
    pub hostname: String,
    /// Default manager for projects that do not name one.
    pub manager: String,
    pub engine_version: String,
    /// `YYYYMMDD`, UTC.
    pub date: String,
}

impl IngestContext {
    /// Context for the local machine and today's date.
    pub fn detect(engine_version: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        let today = time::OffsetDateTime::now_utc().date();
        let date = format!(
            "{:04}{:02}{:02}",
            today.year(),
            u8::from(today.month()),
            today.day()
        );

        Self {
            manager: hostname.clone(),
            hostname,
            engine_version: engine_version.into(),
            date,
        }
    }

    pub fn replace_keywords(&self, text: &str) -> String {
        text.replace("$Date", &self.date)
            .replace("$Hostname", &self.hostname)
            .replace("$Version", &self.engine_version)
    }
}

#[derive(Deserialize)]
struct Submission {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    projects: Vec<Value>,
}

#[derive(Deserialize)]
struct SubmittedProject {
    project_key: String,
    #[serde(default)]
    manager: Option<String>,
    #[serde(default)]
    global_vars: GlobalVars,
    #[serde(default)]
    tasks: Vec<SubmittedTask>,
}

#[derive(Deserialize)]
struct SubmittedTask {
    #[serde(default)]
    guid: Option<String>,
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    action: Option<i64>,
    #[serde(default)]
    task_params: Option<Value>,
    /// Outer `None`: key absent. `Some(None)`: explicit null.
    #[serde(default, deserialize_with = "present_or_null")]
    next_task_guid: Option<Option<String>>,
    #[serde(default)]
    is_active: Option<bool>,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Parses and normalizes a submission into projects ready for insertion.
pub fn normalize_submission(
    raw: &Value,
    ctx: &IngestContext,
) -> Result<Vec<NewProject>, CoreError> {
    let submission: Submission = serde_json::from_value(raw.clone())
        .map_err(|error| parse_error(format!("invalid queue submission: {error}")))?;

    let is_versioned = submission
        .version
        .as_deref()
        .is_some_and(|version| !version.trim().is_empty());

    let projects = if is_versioned {
        submission
            .projects
            .into_iter()
            .enumerate()
            .map(|(index, project)| versioned_project(index, project, ctx))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        vec![legacy_project(submission.projects, ctx)?]
    };

    Ok(projects)
}

fn parse_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::ParseFailure, message)
}

fn versioned_project(
    index: usize,
    raw: Value,
    ctx: &IngestContext,
) -> Result<NewProject, CoreError> {
    let project: SubmittedProject = serde_json::from_value(raw)
        .map_err(|error| parse_error(format!("invalid project at index {index}: {error}")))?;

    let mut tasks = Vec::with_capacity(project.tasks.len());
    let mut explicit_next = Vec::with_capacity(project.tasks.len());
    for (position, task) in project.tasks.into_iter().enumerate() {
        let action = task.action.ok_or_else(|| {
            CoreError::invalid_input(format!(
                "task {position} of project '{}' has no action",
                project.project_key
            ))
        })?;
        explicit_next.push(task.next_task_guid.clone());
        tasks.push(NewTask {
            guid: task.guid,
            task_type: task.task_type,
            name: task.name,
            comment: task.comment,
            action,
            task_params: task.task_params.unwrap_or_else(empty_params),
            next_task_guid: None,
            is_active: task.is_active.unwrap_or(true),
        });
    }

    let manager = project
        .manager
        .filter(|manager| !manager.trim().is_empty())
        .unwrap_or_else(|| ctx.manager.clone());

    Ok(finish_project(
        project.project_key,
        manager,
        project.global_vars,
        tasks,
        explicit_next,
        ctx,
    ))
}

fn legacy_project(steps: Vec<Value>, ctx: &IngestContext) -> Result<NewProject, CoreError> {
    let mut tasks = Vec::with_capacity(steps.len());
    for (position, step) in steps.into_iter().enumerate() {
        let Value::Object(mut fields) = step else {
            return Err(parse_error(format!(
                "legacy step {position} is not an object"
            )));
        };

        let action = match fields.remove("action") {
            Some(Value::Number(number)) => number.as_i64(),
            Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            CoreError::invalid_input(format!("legacy step {position} has no numeric action"))
        })?;
        let comment = match fields.remove("comment") {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };

        let (task_type, action) = if action == LEGACY_SCRIPT_ACTION {
            (QUEUE_TASK_TYPE, QueueAction::Script.code())
        } else {
            (PHOTOMESH_TASK_TYPE, action)
        };

        let mut task = NewTask::new(task_type, action).params(Value::Object(fields));
        task.comment = Some(comment);
        tasks.push(task);
    }

    let explicit_next = vec![None; tasks.len()];
    Ok(finish_project(
        LEGACY_PROJECT_KEY.to_string(),
        ctx.manager.clone(),
        GlobalVars::new(),
        tasks,
        explicit_next,
        ctx,
    ))
}

fn finish_project(
    project_key: String,
    manager: String,
    global_vars: GlobalVars,
    mut tasks: Vec<NewTask>,
    explicit_next: Vec<Option<Option<String>>>,
    ctx: &IngestContext,
) -> NewProject {
    for task in &mut tasks {
        if task.guid.as_deref().is_none_or(|guid| guid.trim().is_empty()) {
            task.guid = Some(Uuid::new_v4().to_string());
        }
        if let Some(comment) = task.comment.as_mut() {
            *comment = ctx.replace_keywords(comment);
        }
        if let Value::Object(params) = &mut task.task_params {
            for value in params.values_mut() {
                if let Value::String(text) = value {
                    *text = ctx.replace_keywords(text);
                }
            }
        }
    }

    let guids = tasks
        .iter()
        .map(|task| task.guid.clone())
        .collect::<Vec<_>>();
    for (position, (task, explicit)) in tasks.iter_mut().zip(explicit_next).enumerate() {
        task.next_task_guid = match explicit {
            Some(next) => next,
            None => guids.get(position + 1).cloned().flatten(),
        };
    }

    NewProject {
        project_key,
        manager: Some(manager),
        global_vars,
        tasks,
    }
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context() -> IngestContext {
        IngestContext {
            hostname: "render-01".to_string(),
            manager: "render-01".to_string(),
            engine_version: "8.0.4.1234".to_string(),
            date: "20260315".to_string(),
        }
    }

    #[test]
    fn legacy_submission_becomes_single_linked_project() {
        let raw = json!({
            "projects": [
                { "comment": "Create $Date", "action": 0, "projectPath": "D:/out/$Hostname.PhotoMeshXML" },
                { "comment": "Post process", "action": 5, "path": "C:/scripts/post.py" },
                { "action": 3, "buildFrom": 0, "buildUntil": 6 }
            ]
        });

        let projects = normalize_submission(&raw, &context()).unwrap();
        assert_eq!(projects.len(), 1);
        let project = &projects[0];
        assert_eq!(project.project_key, "proj0");
        assert_eq!(project.manager.as_deref(), Some("render-01"));

        let tasks = &project.tasks;
        assert_eq!(tasks[0].task_type, "PhotoMesh");
        assert_eq!(tasks[0].comment.as_deref(), Some("Create 20260315"));
        assert_eq!(
            tasks[0].task_params["projectPath"],
            json!("D:/out/render-01.PhotoMeshXML")
        );
        assert!(tasks[0].task_params.get("action").is_none());

        assert_eq!(tasks[1].task_type, "Queue");
        assert_eq!(tasks[1].action, 0);

        assert_eq!(tasks[0].next_task_guid, tasks[1].guid);
        assert_eq!(tasks[1].next_task_guid, tasks[2].guid);
        assert_eq!(tasks[2].next_task_guid, None);
    }

    #[test]
    fn explicit_null_successor_is_kept() {
        let raw = json!({
            "version": "1.0",
            "projects": [{
                "project_key": "site-a",
                "tasks": [
                    { "guid": "a", "type": "PhotoMesh", "action": 12, "next_task_guid": null },
                    { "guid": "b", "type": "PhotoMesh", "action": 3 },
                    { "type": "Queue", "action": "0" }
                ]
            }]
        });

        let projects = normalize_submission(&raw, &context()).unwrap();
        let tasks = &projects[0].tasks;
        assert_eq!(tasks[0].next_task_guid, None);
        let generated = tasks[2].guid.clone().unwrap();
        assert_eq!(generated.len(), 36);
        assert_eq!(tasks[1].next_task_guid.as_deref(), Some(generated.as_str()));
        assert_eq!(tasks[2].action, 0);
    }

    #[test]
    fn version_keyword_and_manager_default() {
        let raw = json!({
            "version": "1.0",
            "projects": [
                { "project_key": "a", "tasks": [
                    { "type": "PhotoMesh", "action": 3, "comment": "v$Version",
                      "task_params": { "workingFolder": "out_$Version", "buildFrom": 2 } }
                ]},
                { "project_key": "b", "manager": "10.0.0.9", "tasks": [] }
            ]
        });

        let projects = normalize_submission(&raw, &context()).unwrap();
        let task = &projects[0].tasks[0];
        assert_eq!(task.comment.as_deref(), Some("v8.0.4.1234"));
        assert_eq!(task.task_params["workingFolder"], json!("out_8.0.4.1234"));
        assert_eq!(task.task_params["buildFrom"], json!(2));
        assert_eq!(projects[1].manager.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn malformed_project_is_a_parse_failure() {
        let raw = json!({ "version": "1.0", "projects": [{ "tasks": [] }] });
        let error = normalize_submission(&raw, &context()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ParseFailure);
        assert!(error.message.contains("index 0"));
    }

    #[test]
    fn detected_date_is_eight_digits() {
        let ctx = IngestContext::detect("1.0");
        assert_eq!(ctx.date.len(), 8);
        assert!(ctx.date.chars().all(|c| c.is_ascii_digit()));
    }
}
