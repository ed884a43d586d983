use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::models::{
    CoreError, CoreErrorKind, GlobalVars, NewProject, NewTask, NewTaskLogRecord, Project,
    ProjectId, ProjectSelector, ProjectStatus, TaskId, TaskLogLevel, TaskLogRecord, TaskRecord,
    TaskStatus,
};
use crate::persistence::{
    MigrationStore, PersistenceResult, ProjectStore, TaskLogStore, TaskStore,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "meshq_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PROJECT_COLUMNS: &str =
    "id, project_key, manager, global_vars, order_index, status, created_at_unix_ms";
const TASK_COLUMNS: &str = "id, project_id, guid, task_type, name, comment, action, task_params, \
     next_task_guid, is_active, status, created_at_unix_ms, started_at_unix_ms, completed_at_unix_ms";
const LOG_COLUMNS: &str = "id, task_id, status, log_level, log_message, created_at_unix_ms";

pub struct SqliteStore {
    database_path: PathBuf,
}

/// Failure inside a store operation: either sqlite itself or a rejected request.
enum StoreFailure {
    Sqlite(rusqlite::Error),
    Rejected(CoreError),
}

impl From<rusqlite::Error> for StoreFailure {
    fn from(error: rusqlite::Error) -> Self {
        StoreFailure::Sqlite(error)
    }
}

type StoreOutcome<T> = Result<T, StoreFailure>;

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> StoreOutcome<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|failure| match failure {
            StoreFailure::Sqlite(error) => storage_error(operation_name, error),
            StoreFailure::Rejected(error) => error,
        })
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            Ok(read_current_version(connection)?)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version >= current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl ProjectStore for SqliteStore {
    fn insert_projects(&self, projects: &[NewProject]) -> PersistenceResult<Vec<ProjectId>> {
        self.with_connection("insert_projects", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let mut next_order: i64 = transaction.query_row(
                "SELECT COALESCE(MAX(order_index), -1) + 1 FROM projects",
                [],
                |row| row.get(0),
            )?;
            let created_at = to_unix_millis(SystemTime::now())?;
            let mut ids = Vec::with_capacity(projects.len());

            for project in projects {
                if project.project_key.trim().is_empty() {
                    return Err(rejected(CoreError::invalid_input(
                        "project_key must not be empty",
                    )));
                }

                transaction.execute(
                    "
INSERT INTO projects (project_key, manager, global_vars, order_index, status, created_at_unix_ms)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
",
                    params![
                        project.project_key,
                        project.manager,
                        encode_json(&project.global_vars)?,
                        next_order,
                        ProjectStatus::Pending.as_str(),
                        created_at,
                    ],
                )?;
                let project_id = ProjectId(i64_to_u64(transaction.last_insert_rowid())?);
                for task in &project.tasks {
                    insert_task(&transaction, project_id, task)?;
                }

                ids.push(project_id);
                next_order += 1;
            }

            transaction.commit()?;
            Ok(ids)
        })
    }

    fn list_projects(&self) -> PersistenceResult<Vec<Project>> {
        self.with_connection("list_projects", |connection| {
            ensure_schema_ready(connection)?;
            let mut projects = {
                let mut statement = connection.prepare(&format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects
                     ORDER BY order_index ASC, created_at_unix_ms ASC, id ASC"
                ))?;
                let rows = statement.query_map([], project_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            for project in &mut projects {
                project.tasks = load_tasks(connection, project.id)?;
            }
            Ok(projects)
        })
    }

    fn project(&self, id: ProjectId) -> PersistenceResult<Option<Project>> {
        self.with_connection("project", |connection| {
            ensure_schema_ready(connection)?;
            Ok(load_project(connection, id)?)
        })
    }

    fn resolve_project(&self, selector: &ProjectSelector) -> PersistenceResult<Option<Project>> {
        self.with_connection("resolve_project", |connection| {
            ensure_schema_ready(connection)?;
            Ok(resolve_selector(connection, selector)?)
        })
    }

    fn next_pending_project(&self) -> PersistenceResult<Option<Project>> {
        self.with_connection("next_pending_project", |connection| {
            ensure_schema_ready(connection)?;
            let project = connection
                .query_row(
                    &format!(
                        "SELECT {PROJECT_COLUMNS} FROM projects
                         WHERE status = ?1
                         ORDER BY order_index ASC, created_at_unix_ms ASC, id ASC
                         LIMIT 1"
                    ),
                    params![ProjectStatus::Pending.as_str()],
                    project_from_row,
                )
                .optional()?;
            Ok(attach_tasks(connection, project)?)
        })
    }

    fn update_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> PersistenceResult<()> {
        self.with_connection("update_project_status", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "UPDATE projects SET status = ?2 WHERE id = ?1",
                params![project_id_to_i64(id)?, status.as_str()],
            )?;
            if updated == 0 {
                return Err(rejected(project_not_found(id)));
            }
            Ok(())
        })
    }

    fn count_pending_projects(&self) -> PersistenceResult<usize> {
        self.with_connection("count_pending_projects", |connection| {
            ensure_schema_ready(connection)?;
            let count: i64 = connection.query_row(
                "SELECT COUNT(*) FROM projects WHERE status = ?1",
                params![ProjectStatus::Pending.as_str()],
                |row| row.get(0),
            )?;
            Ok(i64_to_usize(count)?)
        })
    }

    fn global_vars(&self, id: ProjectId) -> PersistenceResult<GlobalVars> {
        self.with_connection("global_vars", |connection| {
            ensure_schema_ready(connection)?;
            read_global_vars(connection, id)
        })
    }

    fn set_global_vars(&self, id: ProjectId, vars: &GlobalVars) -> PersistenceResult<()> {
        self.with_connection("set_global_vars", |connection| {
            ensure_schema_ready(connection)?;
            write_global_vars(connection, id, vars)
        })
    }

    fn merge_global_vars(
        &self,
        id: ProjectId,
        patch: &GlobalVars,
    ) -> PersistenceResult<GlobalVars> {
        self.with_connection("merge_global_vars", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let mut vars = read_global_vars(&transaction, id)?;
            for (key, value) in patch {
                vars.insert(key.clone(), value.clone());
            }
            write_global_vars(&transaction, id, &vars)?;
            transaction.commit()?;
            Ok(vars)
        })
    }

    fn recover_interrupted_project(&self) -> PersistenceResult<Option<ProjectId>> {
        self.with_connection("recover_interrupted_project", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let running: Option<i64> = transaction
                .query_row(
                    "SELECT id FROM projects WHERE status = ?1 ORDER BY id ASC LIMIT 1",
                    params![ProjectStatus::Running.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(project_raw) = running else {
                return Ok(None);
            };

            transaction.execute(
                "UPDATE tasks SET status = ?2 WHERE project_id = ?1 AND status = ?3",
                params![
                    project_raw,
                    TaskStatus::Pending.as_str(),
                    TaskStatus::Running.as_str()
                ],
            )?;
            transaction.execute(
                "UPDATE projects SET status = ?2 WHERE id = ?1",
                params![project_raw, ProjectStatus::Pending.as_str()],
            )?;
            transaction.commit()?;
            Ok(Some(ProjectId(i64_to_u64(project_raw)?)))
        })
    }

    fn abort_all_projects(&self) -> PersistenceResult<usize> {
        self.with_connection("abort_all_projects", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let projects = transaction.execute(
                "UPDATE projects SET status = ?1 WHERE status IN (?2, ?3)",
                params![
                    ProjectStatus::Aborted.as_str(),
                    ProjectStatus::Running.as_str(),
                    ProjectStatus::Pending.as_str()
                ],
            )?;
            transaction.execute(
                "UPDATE tasks SET status = ?1 WHERE status IN (?2, ?3)",
                params![
                    TaskStatus::Aborted.as_str(),
                    TaskStatus::Running.as_str(),
                    TaskStatus::Pending.as_str()
                ],
            )?;
            transaction.commit()?;
            Ok(projects)
        })
    }

    fn switch_projects(&self, first: ProjectId, second: ProjectId) -> PersistenceResult<()> {
        self.with_connection("switch_projects", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let first_order = read_order_index(&transaction, first)?
                .ok_or_else(|| rejected(project_not_found(first)))?;
            let second_order = read_order_index(&transaction, second)?
                .ok_or_else(|| rejected(project_not_found(second)))?;

            transaction.execute(
                "UPDATE projects SET order_index = ?2 WHERE id = ?1",
                params![project_id_to_i64(first)?, second_order],
            )?;
            transaction.execute(
                "UPDATE projects SET order_index = ?2 WHERE id = ?1",
                params![project_id_to_i64(second)?, first_order],
            )?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn rerun_from_task(&self, project: ProjectId, from: Option<TaskId>) -> PersistenceResult<()> {
        self.with_connection("rerun_from_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let project_raw = project_id_to_i64(project)?;

            let status_raw: Option<String> = transaction
                .query_row(
                    "SELECT status FROM projects WHERE id = ?1",
                    params![project_raw],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(status_raw) = status_raw else {
                return Err(rejected(project_not_found(project)));
            };
            if parse_project_status(&status_raw)? == ProjectStatus::Running {
                return Err(rejected(
                    CoreError::invalid_input("project is currently running").for_project(project),
                ));
            }

            let from_raw: Option<i64> = match from {
                Some(task) => {
                    let owner: Option<i64> = transaction
                        .query_row(
                            "SELECT project_id FROM tasks WHERE id = ?1",
                            params![task_id_to_i64(task)?],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if owner != Some(project_raw) {
                        return Err(rejected(
                            CoreError::not_found(format!(
                                "task {} does not belong to project {}",
                                task.0, project.0
                            ))
                            .for_project(project)
                            .for_task(task),
                        ));
                    }
                    Some(task_id_to_i64(task)?)
                }
                None => transaction.query_row(
                    "SELECT MIN(id) FROM tasks WHERE project_id = ?1",
                    params![project_raw],
                    |row| row.get(0),
                )?,
            };

            let running_order: Option<i64> = transaction
                .query_row(
                    "SELECT order_index FROM projects
                     WHERE status = ?1 AND id != ?2
                     ORDER BY order_index ASC LIMIT 1",
                    params![ProjectStatus::Running.as_str(), project_raw],
                    |row| row.get(0),
                )
                .optional()?;

            let new_order = match running_order {
                Some(running_order) => {
                    transaction.execute(
                        "UPDATE projects SET order_index = order_index + 1
                         WHERE order_index > ?1 AND id != ?2",
                        params![running_order, project_raw],
                    )?;
                    Some(running_order + 1)
                }
                None => {
                    let lowest_pending: Option<i64> = transaction.query_row(
                        "SELECT MIN(order_index) FROM projects WHERE status = ?1 AND id != ?2",
                        params![ProjectStatus::Pending.as_str(), project_raw],
                        |row| row.get(0),
                    )?;
                    lowest_pending.map(|lowest| lowest - 1)
                }
            };

            if let Some(new_order) = new_order {
                transaction.execute(
                    "UPDATE projects SET order_index = ?2 WHERE id = ?1",
                    params![project_raw, new_order],
                )?;
            }
            transaction.execute(
                "UPDATE projects SET status = ?2 WHERE id = ?1",
                params![project_raw, ProjectStatus::Pending.as_str()],
            )?;

            if let Some(from_raw) = from_raw {
                transaction.execute(
                    "UPDATE tasks
                     SET status = ?3, started_at_unix_ms = NULL, completed_at_unix_ms = NULL
                     WHERE project_id = ?1 AND id >= ?2",
                    params![project_raw, from_raw, TaskStatus::Pending.as_str()],
                )?;
            }

            transaction.commit()?;
            Ok(())
        })
    }

    fn remove_project(&self, id: ProjectId) -> PersistenceResult<()> {
        self.with_connection("remove_project", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let status_raw: Option<String> = transaction
                .query_row(
                    "SELECT status FROM projects WHERE id = ?1",
                    params![project_id_to_i64(id)?],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(status_raw) = status_raw else {
                return Err(rejected(project_not_found(id)));
            };
            if parse_project_status(&status_raw)? == ProjectStatus::Running {
                return Err(rejected(
                    CoreError::invalid_input("a running project cannot be removed")
                        .for_project(id),
                ));
            }

            transaction.execute(
                "DELETE FROM projects WHERE id = ?1",
                params![project_id_to_i64(id)?],
            )?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn remove_pending_projects(&self) -> PersistenceResult<usize> {
        self.with_connection("remove_pending_projects", |connection| {
            ensure_schema_ready(connection)?;
            let removed = connection.execute(
                "DELETE FROM projects WHERE status = ?1",
                params![ProjectStatus::Pending.as_str()],
            )?;
            Ok(removed)
        })
    }
}

impl TaskStore for SqliteStore {
    fn task(&self, id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("task", |connection| {
            ensure_schema_ready(connection)?;
            Ok(load_task(connection, id)?)
        })
    }

    fn task_by_guid(&self, project: ProjectId, guid: &str) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("task_by_guid", |connection| {
            ensure_schema_ready(connection)?;
            let task = connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 AND guid = ?2"),
                    params![project_id_to_i64(project)?, guid],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    fn task_by_name(&self, project: ProjectId, name: &str) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("task_by_name", |connection| {
            ensure_schema_ready(connection)?;
            let task = connection
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks
                         WHERE project_id = ?1 AND name = ?2
                         ORDER BY id ASC LIMIT 1"
                    ),
                    params![project_id_to_i64(project)?, name],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    fn tasks_for_project(&self, project: ProjectId) -> PersistenceResult<Vec<TaskRecord>> {
        self.with_connection("tasks_for_project", |connection| {
            ensure_schema_ready(connection)?;
            Ok(load_tasks(connection, project)?)
        })
    }

    fn update_task_status(&self, id: TaskId, status: TaskStatus) -> PersistenceResult<()> {
        self.with_connection("update_task_status", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "UPDATE tasks SET status = ?2 WHERE id = ?1",
                params![task_id_to_i64(id)?, status.as_str()],
            )?;
            if updated == 0 {
                return Err(rejected(task_not_found(id)));
            }
            Ok(())
        })
    }

    fn update_task_times(
        &self,
        id: TaskId,
        started_at: SystemTime,
        completed_at: Option<SystemTime>,
    ) -> PersistenceResult<()> {
        self.with_connection("update_task_times", |connection| {
            ensure_schema_ready(connection)?;
            let completed_raw = completed_at.map(to_unix_millis).transpose()?;
            let updated = connection.execute(
                "UPDATE tasks SET started_at_unix_ms = ?2, completed_at_unix_ms = ?3 WHERE id = ?1",
                params![task_id_to_i64(id)?, to_unix_millis(started_at)?, completed_raw],
            )?;
            if updated == 0 {
                return Err(rejected(task_not_found(id)));
            }
            Ok(())
        })
    }

    fn update_task_next_guid(&self, id: TaskId, next: Option<&str>) -> PersistenceResult<()> {
        self.with_connection("update_task_next_guid", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "UPDATE tasks SET next_task_guid = ?2 WHERE id = ?1",
                params![task_id_to_i64(id)?, next],
            )?;
            if updated == 0 {
                return Err(rejected(task_not_found(id)));
            }
            Ok(())
        })
    }

    fn append_tasks(
        &self,
        project: &ProjectSelector,
        tasks: &[NewTask],
    ) -> PersistenceResult<Vec<TaskRecord>> {
        self.with_connection("append_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let target = resolve_selector(&transaction, project)?.ok_or_else(|| {
                rejected(CoreError::not_found(format!(
                    "project {project:?} was not found"
                )))
            })?;
            if target.status == ProjectStatus::Completed {
                return Err(rejected(
                    CoreError::invalid_input("cannot append tasks to a completed project")
                        .for_project(target.id),
                ));
            }

            let mut inserted = Vec::with_capacity(tasks.len());
            for task in tasks {
                let task_id = insert_task(&transaction, target.id, task)?;
                let record = load_task(&transaction, task_id)?
                    .ok_or_else(|| rejected(task_not_found(task_id)))?;
                inserted.push(record);
            }

            transaction.commit()?;
            Ok(inserted)
        })
    }
}

impl TaskLogStore for SqliteStore {
    fn insert_task_log(&self, log: &NewTaskLogRecord) -> PersistenceResult<u64> {
        self.with_connection("insert_task_log", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO task_logs (task_id, status, log_level, log_message, created_at_unix_ms)
VALUES (?1, ?2, ?3, ?4, ?5)
",
                params![
                    task_id_to_i64(log.task_id)?,
                    log.status.map(TaskStatus::as_str),
                    log.level.as_str(),
                    log.message,
                    to_unix_millis(log.created_at)?,
                ],
            )?;
            Ok(i64_to_u64(connection.last_insert_rowid())?)
        })
    }

    fn latest_task_log(&self, task: TaskId) -> PersistenceResult<Option<TaskLogRecord>> {
        self.with_connection("latest_task_log", |connection| {
            ensure_schema_ready(connection)?;
            let log = connection
                .query_row(
                    &format!(
                        "SELECT {LOG_COLUMNS} FROM task_logs
                         WHERE task_id = ?1
                         ORDER BY created_at_unix_ms DESC, id DESC
                         LIMIT 1"
                    ),
                    params![task_id_to_i64(task)?],
                    log_from_row,
                )
                .optional()?;
            Ok(log)
        })
    }

    fn list_task_logs(&self, task: TaskId) -> PersistenceResult<Vec<TaskLogRecord>> {
        self.with_connection("list_task_logs", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = statement.query_map(params![task_id_to_i64(task)?], log_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before queue operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn load_project(connection: &Connection, id: ProjectId) -> rusqlite::Result<Option<Project>> {
    let project = connection
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![project_id_to_i64(id)?],
            project_from_row,
        )
        .optional()?;
    attach_tasks(connection, project)
}

fn resolve_selector(
    connection: &Connection,
    selector: &ProjectSelector,
) -> rusqlite::Result<Option<Project>> {
    match selector {
        ProjectSelector::Id(id) => load_project(connection, *id),
        ProjectSelector::Key(key) => {
            let project = connection
                .query_row(
                    &format!(
                        "SELECT {PROJECT_COLUMNS} FROM projects
                         WHERE project_key = ?1
                         ORDER BY id DESC LIMIT 1"
                    ),
                    params![key],
                    project_from_row,
                )
                .optional()?;
            attach_tasks(connection, project)
        }
    }
}

fn attach_tasks(
    connection: &Connection,
    project: Option<Project>,
) -> rusqlite::Result<Option<Project>> {
    match project {
        Some(mut project) => {
            project.tasks = load_tasks(connection, project.id)?;
            Ok(Some(project))
        }
        None => Ok(None),
    }
}

fn load_tasks(connection: &Connection, project: ProjectId) -> rusqlite::Result<Vec<TaskRecord>> {
    let mut statement = connection.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = statement.query_map(params![project_id_to_i64(project)?], task_from_row)?;
    rows.collect()
}

fn load_task(connection: &Connection, id: TaskId) -> rusqlite::Result<Option<TaskRecord>> {
    connection
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id_to_i64(id)?],
            task_from_row,
        )
        .optional()
}

fn insert_task(
    connection: &Connection,
    project: ProjectId,
    task: &NewTask,
) -> rusqlite::Result<TaskId> {
    let guid = task
        .guid
        .clone()
        .filter(|guid| !guid.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    connection.execute(
        "
INSERT INTO tasks (
    project_id, guid, task_type, name, comment, action, task_params,
    next_task_guid, is_active, status, created_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
",
        params![
            project_id_to_i64(project)?,
            guid,
            task.task_type,
            task.name,
            task.comment,
            task.action,
            encode_json(&task.task_params)?,
            task.next_task_guid,
            bool_to_sqlite(task.is_active),
            TaskStatus::Pending.as_str(),
            to_unix_millis(SystemTime::now())?,
        ],
    )?;
    Ok(TaskId(i64_to_u64(connection.last_insert_rowid())?))
}

fn read_global_vars(connection: &Connection, id: ProjectId) -> StoreOutcome<GlobalVars> {
    let raw: Option<String> = connection
        .query_row(
            "SELECT global_vars FROM projects WHERE id = ?1",
            params![project_id_to_i64(id)?],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(parse_global_vars(&raw)?),
        None => Err(rejected(project_not_found(id))),
    }
}

fn write_global_vars(connection: &Connection, id: ProjectId, vars: &GlobalVars) -> StoreOutcome<()> {
    let updated = connection.execute(
        "UPDATE projects SET global_vars = ?2 WHERE id = ?1",
        params![project_id_to_i64(id)?, encode_json(vars)?],
    )?;
    if updated == 0 {
        return Err(rejected(project_not_found(id)));
    }
    Ok(())
}

fn read_order_index(connection: &Connection, id: ProjectId) -> rusqlite::Result<Option<i64>> {
    connection
        .query_row(
            "SELECT order_index FROM projects WHERE id = ?1",
            params![project_id_to_i64(id)?],
            |row| row.get(0),
        )
        .optional()
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let id_raw: i64 = row.get(0)?;
    let global_vars_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;
    let created_at_raw: i64 = row.get(6)?;

    Ok(Project {
        id: ProjectId(i64_to_u64(id_raw)?),
        project_key: row.get(1)?,
        manager: row.get(2)?,
        global_vars: parse_global_vars(&global_vars_raw)?,
        tasks: Vec::new(),
        order_index: row.get(4)?,
        status: parse_project_status(&status_raw)?,
        created_at: from_unix_millis(created_at_raw)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let id_raw: i64 = row.get(0)?;
    let project_raw: i64 = row.get(1)?;
    let params_raw: String = row.get(7)?;
    let is_active_raw: i64 = row.get(9)?;
    let status_raw: String = row.get(10)?;
    let created_at_raw: i64 = row.get(11)?;
    let started_at_raw: Option<i64> = row.get(12)?;
    let completed_at_raw: Option<i64> = row.get(13)?;

    Ok(TaskRecord {
        id: TaskId(i64_to_u64(id_raw)?),
        project_id: ProjectId(i64_to_u64(project_raw)?),
        guid: row.get(2)?,
        task_type: row.get(3)?,
        name: row.get(4)?,
        comment: row.get(5)?,
        action: row.get(6)?,
        task_params: serde_json::from_str(&params_raw).map_err(|error| {
            storage_error_sqlite(&format!("task_params is not valid JSON: {error}"))
        })?,
        next_task_guid: row.get(8)?,
        is_active: sqlite_to_bool(is_active_raw),
        status: parse_task_status(&status_raw)?,
        created_at: from_unix_millis(created_at_raw)?,
        started_at: started_at_raw.map(from_unix_millis).transpose()?,
        completed_at: completed_at_raw.map(from_unix_millis).transpose()?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<TaskLogRecord> {
    let id_raw: i64 = row.get(0)?;
    let task_raw: i64 = row.get(1)?;
    let status_raw: Option<String> = row.get(2)?;
    let level_raw: String = row.get(3)?;
    let created_at_raw: i64 = row.get(5)?;

    Ok(TaskLogRecord {
        id: i64_to_u64(id_raw)?,
        task_id: TaskId(i64_to_u64(task_raw)?),
        status: status_raw.as_deref().map(parse_task_status).transpose()?,
        level: parse_log_level(&level_raw)?,
        message: row.get(4)?,
        created_at: from_unix_millis(created_at_raw)?,
    })
}

fn parse_global_vars(raw: &str) -> rusqlite::Result<GlobalVars> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("global_vars is not a JSON object: {error}"))
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| storage_error_sqlite(&format!("failed to encode JSON column: {error}")))
}

fn parse_project_status(raw: &str) -> rusqlite::Result<ProjectStatus> {
    raw.parse()
        .map_err(|error: CoreError| storage_error_sqlite(&error.message))
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse()
        .map_err(|error: CoreError| storage_error_sqlite(&error.message))
}

fn parse_log_level(raw: &str) -> rusqlite::Result<TaskLogLevel> {
    raw.parse()
        .map_err(|error: CoreError| storage_error_sqlite(&error.message))
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp milliseconds exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn project_id_to_i64(value: ProjectId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("project id exceeds i64 range"))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative id in sqlite record"))
}

fn i64_to_usize(value: i64) -> rusqlite::Result<usize> {
    usize::try_from(value).map_err(|_| storage_error_sqlite("negative count in sqlite result"))
}

fn rejected(error: CoreError) -> StoreFailure {
    StoreFailure::Rejected(error)
}

fn project_not_found(id: ProjectId) -> CoreError {
    CoreError::not_found(format!("project {} was not found", id.0)).for_project(id)
}

fn task_not_found(id: TaskId) -> CoreError {
    CoreError::not_found(format!("task {} was not found", id.0)).for_task(id)
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
