#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_queue_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_key TEXT NOT NULL,
    manager TEXT,
    global_vars TEXT NOT NULL DEFAULT '{}',
    order_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_dispatch
    ON projects (status, order_index, created_at_unix_ms);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
    guid TEXT NOT NULL,
    task_type TEXT NOT NULL,
    name TEXT,
    comment TEXT,
    action INTEGER NOT NULL,
    task_params TEXT NOT NULL DEFAULT '{}',
    next_task_guid TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    started_at_unix_ms INTEGER,
    completed_at_unix_ms INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_project_guid
    ON tasks (project_id, guid);

CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    status TEXT,
    log_level TEXT NOT NULL,
    log_message TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task_time
    ON task_logs (task_id, created_at_unix_ms DESC, id DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_logs_task_time;
DROP TABLE IF EXISTS task_logs;
DROP INDEX IF EXISTS idx_tasks_project_guid;
DROP TABLE IF EXISTS tasks;
DROP INDEX IF EXISTS idx_projects_dispatch;
DROP TABLE IF EXISTS projects;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_task_name_and_project_key_lookups",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_tasks_project_name
    ON tasks (project_id, name);

CREATE INDEX IF NOT EXISTS idx_projects_key
    ON projects (project_key, id DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_projects_key;
DROP INDEX IF EXISTS idx_tasks_project_name;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
