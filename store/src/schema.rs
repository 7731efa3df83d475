//! Schema definition and additive migration.
//!
//! Migration strategy: each table is defined once as a list of
//! `(column, sql_type_and_default)` pairs. On open, every table is created if
//! absent; for tables that already exist, `PRAGMA table_info` is consulted
//! and any column present in the definition but absent from the live schema
//! is added via `ALTER TABLE ... ADD COLUMN`. Nothing is ever dropped, so an
//! old database opened against a newer column list converges to the same
//! shape a fresh database would have gotten, without losing a row.

use rusqlite::Connection;

use crate::error::StoreResult;

struct TableDef {
    name: &'static str,
    create_sql: &'static str,
    /// Columns beyond what `create_sql` establishes, for additive migration.
    /// `create_sql` already contains the full "current" column set; this list
    /// exists so future column additions only need an entry here, not a
    /// rewritten CREATE TABLE.
    columns: &'static [(&'static str, &'static str)],
}

const TABLES: &[TableDef] = &[
    TableDef {
        name: "tasks",
        create_sql: "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_path TEXT NOT NULL,
            workflow TEXT NOT NULL,
            parent_id TEXT,
            subtask_ids TEXT NOT NULL DEFAULT '[]',
            subtask_strategy TEXT NOT NULL DEFAULT 'sequential',
            description TEXT NOT NULL,
            acceptance_criteria TEXT,
            autonomy TEXT NOT NULL DEFAULT 'supervised',
            priority TEXT NOT NULL DEFAULT 'normal',
            effort TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            stage TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            resume_attempts INTEGER NOT NULL DEFAULT 0,
            branch TEXT,
            pr_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            trashed_at TEXT,
            paused_at TEXT,
            resume_after TEXT,
            pause_reason TEXT,
            usage_input_tokens INTEGER NOT NULL DEFAULT 0,
            usage_output_tokens INTEGER NOT NULL DEFAULT 0,
            usage_estimated_cost REAL NOT NULL DEFAULT 0.0,
            workspace_config TEXT NOT NULL DEFAULT 'null',
            session_data TEXT NOT NULL DEFAULT '{}',
            error TEXT
        )",
        columns: &[],
    },
    TableDef {
        name: "task_dependencies",
        create_sql: "CREATE TABLE IF NOT EXISTS task_dependencies (
            task_id TEXT NOT NULL,
            depends_on_id TEXT NOT NULL,
            PRIMARY KEY (task_id, depends_on_id)
        )",
        columns: &[],
    },
    TableDef {
        name: "task_logs",
        create_sql: "CREATE TABLE IF NOT EXISTS task_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            level TEXT NOT NULL,
            stage TEXT,
            agent TEXT,
            message TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT 'null'
        )",
        columns: &[],
    },
    TableDef {
        name: "task_artifacts",
        create_sql: "CREATE TABLE IF NOT EXISTS task_artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            name TEXT NOT NULL,
            artifact_type TEXT NOT NULL,
            path TEXT,
            content TEXT,
            created_at TEXT NOT NULL
        )",
        columns: &[],
    },
    TableDef {
        name: "gates",
        create_sql: "CREATE TABLE IF NOT EXISTS gates (
            task_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            required_at TEXT NOT NULL,
            responded_at TEXT,
            approver TEXT,
            comment TEXT,
            PRIMARY KEY (task_id, name)
        )",
        columns: &[],
    },
    TableDef {
        name: "task_checkpoints",
        create_sql: "CREATE TABLE IF NOT EXISTS task_checkpoints (
            task_id TEXT NOT NULL,
            checkpoint_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            stage_index INTEGER NOT NULL,
            conversation_state TEXT NOT NULL DEFAULT 'null',
            metadata TEXT NOT NULL DEFAULT 'null',
            created_at TEXT NOT NULL,
            PRIMARY KEY (task_id, checkpoint_id)
        )",
        columns: &[],
    },
    TableDef {
        name: "iteration_entries",
        // No foreign key on task_id: entries against a nonexistent task id
        // are allowed without error (see DESIGN.md open question).
        create_sql: "CREATE TABLE IF NOT EXISTS iteration_entries (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            feedback TEXT NOT NULL,
            stage TEXT,
            before_state TEXT NOT NULL DEFAULT 'null',
            after_state TEXT,
            modified_files TEXT NOT NULL DEFAULT '[]',
            diff_summary TEXT,
            created_at TEXT NOT NULL
        )",
        columns: &[],
    },
    TableDef {
        name: "task_interactions",
        create_sql: "CREATE TABLE IF NOT EXISTS task_interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            command TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT 'null',
            requested_by TEXT,
            result TEXT,
            error TEXT,
            created_at TEXT NOT NULL
        )",
        columns: &[],
    },
    TableDef {
        name: "workspace_info",
        create_sql: "CREATE TABLE IF NOT EXISTS workspace_info (
            task_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            branch TEXT,
            created_at TEXT NOT NULL,
            last_used_at TEXT NOT NULL
        )",
        columns: &[],
    },
    // The remaining three tables back idle-task/thought-capture analyzers
    // and the generic command log, which are named in the external-interface
    // table list but whose producing features are explicitly out of scope.
    // They exist so an exported database matches the documented schema; no
    // code in this crate writes to them yet.
    TableDef {
        name: "commands",
        create_sql: "CREATE TABLE IF NOT EXISTS commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT 'null',
            created_at TEXT NOT NULL
        )",
        columns: &[],
    },
    TableDef {
        name: "thought_captures",
        create_sql: "CREATE TABLE IF NOT EXISTS thought_captures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        columns: &[],
    },
    TableDef {
        name: "idle_tasks",
        create_sql: "CREATE TABLE IF NOT EXISTS idle_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            idle_since TEXT NOT NULL,
            reason TEXT
        )",
        columns: &[],
    },
];

pub fn migrate(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

    for table in TABLES {
        conn.execute(table.create_sql, [])?;
        ensure_columns(conn, table)?;
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_priority_created ON tasks(priority, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_deps_task ON task_dependencies(task_id)",
        [],
    )?;

    Ok(())
}

fn ensure_columns(conn: &Connection, table: &TableDef) -> StoreResult<()> {
    if table.columns.is_empty() {
        return Ok(());
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.name))?;
    let existing: std::collections::HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    for (column, ddl) in table.columns {
        if !existing.contains(*column) {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN {}", table.name, ddl), [])?;
        }
    }
    Ok(())
}
