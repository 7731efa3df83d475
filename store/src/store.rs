//! The durable store: a single SQLite connection behind a mutex, serializing
//! every writer. The store is the exclusive owner of the database file;
//! concurrent callers share one connection with internal serialization.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{StoreError, StoreResult};
use crate::schema;
use crate::types::*;

pub struct Store {
    conn: Mutex<Connection>,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn json_col<T: serde::Serialize>(table: &'static str, column: &'static str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|source| StoreError::InvalidJson { table, column, source })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    table: &'static str,
    column: &'static str,
    text: &str,
) -> StoreResult<T> {
    serde_json::from_str(text).map_err(|source| StoreError::InvalidJson { table, column, source })
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        schema::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ---------------------------------------------------------------- tasks

    pub fn create_task(&self, task: &Task) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<String> = conn
            .query_row("SELECT id FROM tasks WHERE id = ?1", params![task.id], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::TaskAlreadyExists(task.id.clone()));
        }

        let tx = conn.unchecked_transaction()?;
        insert_task_row(&tx, task)?;
        for dep in &task.depends_on {
            tx.execute(
                "INSERT INTO task_dependencies(task_id, depends_on_id) VALUES (?1, ?2)",
                params![task.id, dep],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        self.get_task_locked(&conn, id)
    }

    fn get_task_locked(&self, conn: &Connection, id: &str) -> StoreResult<Option<Task>> {
        let mut stmt = conn.prepare(TASK_SELECT)?;
        let task = stmt
            .query_row(params![id], row_to_task)
            .optional()?;
        let Some(mut task) = task else { return Ok(None) };
        self.hydrate(conn, &mut task)?;
        Ok(Some(task))
    }

    fn hydrate(&self, conn: &Connection, task: &mut Task) -> StoreResult<()> {
        task.depends_on = self.depends_on_locked(conn, &task.id)?;
        task.logs = self.logs_locked(conn, &task.id)?;
        task.artifacts = self.artifacts_locked(conn, &task.id)?;
        task.iteration_history = self.iteration_history_locked(conn, &task.id)?;
        task.blocked_by = self.compute_blocked_by(conn, &task.depends_on)?;
        Ok(())
    }

    fn depends_on_locked(&self, conn: &Connection, task_id: &str) -> StoreResult<Vec<String>> {
        let mut stmt = conn.prepare("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1")?;
        let rows = stmt
            .query_map(params![task_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn compute_blocked_by(&self, conn: &Connection, depends_on: &[String]) -> StoreResult<Vec<String>> {
        let mut blocked = Vec::new();
        for dep in depends_on {
            let status: Option<String> = conn
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![dep], |r| r.get(0))
                .optional()?;
            let incomplete = match status.as_deref() {
                Some("completed") | Some("cancelled") => false,
                _ => true,
            };
            if incomplete {
                blocked.push(dep.clone());
            }
        }
        Ok(blocked)
    }

    /// Partial update. See [`TaskPatch`] for the not-in-patch vs
    /// set-to-null distinction.
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row("SELECT id FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        if existing.is_none() {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }

        let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now_iso())];

        macro_rules! set_opt {
            ($col:literal, $val:expr) => {
                sets.push(format!("{} = ?", $col));
                values.push(Box::new($val));
            };
        }

        if let Some(status) = &patch.status {
            set_opt!("status", status.to_string());
        }
        if let Some(stage) = &patch.stage {
            set_opt!("stage", stage.clone());
        }
        if let Some(v) = patch.retry_count {
            set_opt!("retry_count", v);
        }
        if let Some(v) = patch.resume_attempts {
            set_opt!("resume_attempts", v);
        }
        if let Some(branch) = &patch.branch {
            set_opt!("branch", branch.clone());
        }
        if let Some(pr_url) = &patch.pr_url {
            set_opt!("pr_url", pr_url.clone());
        }
        if let Some(v) = &patch.completed_at {
            set_opt!("completed_at", v.clone());
        }
        if let Some(v) = &patch.trashed_at {
            set_opt!("trashed_at", v.clone());
        }
        if let Some(v) = &patch.paused_at {
            set_opt!("paused_at", v.clone());
        }
        if let Some(v) = &patch.resume_after {
            set_opt!("resume_after", v.clone());
        }
        if let Some(v) = &patch.pause_reason {
            let encoded = v.as_ref().map(|r| json_pause_reason(r));
            set_opt!("pause_reason", encoded);
        }
        if let Some(usage) = &patch.usage {
            sets.push("usage_input_tokens = ?".to_string());
            values.push(Box::new(usage.input_tokens as i64));
            sets.push("usage_output_tokens = ?".to_string());
            values.push(Box::new(usage.output_tokens as i64));
            sets.push("usage_estimated_cost = ?".to_string());
            values.push(Box::new(usage.estimated_cost));
        }
        if let Some(workspace_config) = &patch.workspace_config {
            set_opt!("workspace_config", json_col("tasks", "workspace_config", workspace_config)?);
        }
        if let Some(session_data) = &patch.session_data {
            set_opt!("session_data", json_col("tasks", "session_data", session_data)?);
        }
        if let Some(error) = &patch.error {
            set_opt!("error", error.clone());
        }
        if let Some(subtask_ids) = &patch.subtask_ids {
            set_opt!("subtask_ids", json_col("tasks", "subtask_ids", subtask_ids)?);
        }

        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id.to_string()));
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
        tx.execute(&sql, param_refs.as_slice())?;

        if let Some(new_deps) = &patch.depends_on {
            tx.execute("DELETE FROM task_dependencies WHERE task_id = ?1", params![id])?;
            for dep in new_deps {
                tx.execute(
                    "INSERT INTO task_dependencies(task_id, depends_on_id) VALUES (?1, ?2)",
                    params![id, dep],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("{TASK_SELECT_BASE} WHERE 1=1");
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.include_trashed {
            sql.push_str(" AND trashed_at IS NULL");
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            values.push(Box::new(status.to_string()));
        }
        if filter.order_by_priority {
            sql.push_str(
                " ORDER BY CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END, created_at ASC",
            );
        } else {
            sql.push_str(" ORDER BY created_at ASC");
        }
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
        let mut tasks = stmt
            .query_map(param_refs.as_slice(), row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        for task in &mut tasks {
            self.hydrate(&conn, task)?;
        }
        Ok(tasks)
    }

    pub fn list_trashed(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{TASK_SELECT_BASE} WHERE trashed_at IS NOT NULL ORDER BY trashed_at DESC");
        let mut stmt = conn.prepare(&sql)?;
        let mut tasks = stmt.query_map([], row_to_task)?.collect::<Result<Vec<_>, _>>()?;
        for task in &mut tasks {
            self.hydrate(&conn, task)?;
        }
        Ok(tasks)
    }

    /// Highest-priority pending task with an empty `blockedBy`, or `None`.
    /// MUST NOT return a task with an incomplete dependency.
    pub fn get_next_queued_task(&self) -> StoreResult<Option<Task>> {
        Ok(self.get_ready_tasks(Some(1), true)?.into_iter().next())
    }

    pub fn get_ready_tasks(&self, limit: Option<u32>, order_by_priority: bool) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("{TASK_SELECT_BASE} WHERE status = 'pending' AND trashed_at IS NULL");
        if order_by_priority {
            sql.push_str(
                " ORDER BY CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END, created_at ASC",
            );
        } else {
            sql.push_str(" ORDER BY created_at ASC");
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut candidates = stmt.query_map([], row_to_task)?.collect::<Result<Vec<_>, _>>()?;
        for task in &mut candidates {
            self.hydrate(&conn, task)?;
        }

        let ready: Vec<Task> = candidates.into_iter().filter(|t| t.blocked_by.is_empty()).collect();
        match limit {
            Some(n) => Ok(ready.into_iter().take(n as usize).collect()),
            None => Ok(ready),
        }
    }

    pub fn get_paused_tasks_for_resume(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "{TASK_SELECT_BASE} WHERE status = 'paused' AND trashed_at IS NULL \
             AND pause_reason IN ('\"usage_limit\"', '\"budget\"', '\"capacity\"') \
             AND (resume_after IS NULL OR resume_after <= ?1) \
             ORDER BY CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut tasks = stmt
            .query_map(params![now_iso()], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        for task in &mut tasks {
            self.hydrate(&conn, task)?;
        }
        Ok(tasks)
    }

    // ------------------------------------------------------------- logs/artifacts

    pub fn add_log(&self, log: &LogEntry) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_logs(task_id, timestamp, level, stage, agent, message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.task_id,
                log.timestamp,
                level_str(log.level),
                log.stage,
                log.agent,
                log.message,
                json_col("task_logs", "metadata", &log.metadata)?,
            ],
        )?;
        Ok(())
    }

    fn logs_locked(&self, conn: &Connection, task_id: &str) -> StoreResult<Vec<LogEntry>> {
        let mut stmt = conn.prepare(
            "SELECT task_id, timestamp, level, stage, agent, message, metadata FROM task_logs \
             WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (task_id, timestamp, level, stage, agent, message, metadata) = row?;
            out.push(LogEntry {
                task_id,
                timestamp,
                level: parse_level(&level),
                stage,
                agent,
                message,
                metadata: parse_json("task_logs", "metadata", &metadata)?,
            });
        }
        Ok(out)
    }

    pub fn add_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_artifacts(task_id, name, artifact_type, path, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.task_id,
                artifact.name,
                artifact.artifact_type,
                artifact.path,
                artifact.content,
                artifact.created_at,
            ],
        )?;
        Ok(())
    }

    fn artifacts_locked(&self, conn: &Connection, task_id: &str) -> StoreResult<Vec<Artifact>> {
        let mut stmt = conn.prepare(
            "SELECT task_id, name, artifact_type, path, content, created_at FROM task_artifacts \
             WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id], |r| {
                Ok(Artifact {
                    task_id: r.get(0)?,
                    name: r.get(1)?,
                    artifact_type: r.get(2)?,
                    path: r.get(3)?,
                    content: r.get(4)?,
                    created_at: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------ gates

    pub fn set_gate(&self, gate: &Gate) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO gates(task_id, name, status, required_at, responded_at, approver, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id, name) DO UPDATE SET
                status = excluded.status, required_at = excluded.required_at,
                responded_at = excluded.responded_at, approver = excluded.approver,
                comment = excluded.comment",
            params![
                gate.task_id,
                gate.name,
                gate_status_str(gate.status),
                gate.required_at,
                gate.responded_at,
                gate.approver,
                gate.comment,
            ],
        )?;
        Ok(())
    }

    fn respond_gate(&self, task_id: &str, name: &str, status: GateStatus, approver: Option<&str>, comment: Option<&str>) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE gates SET status = ?1, responded_at = ?2, approver = ?3, comment = ?4
             WHERE task_id = ?5 AND name = ?6",
            params![gate_status_str(status), now_iso(), approver, comment, task_id, name],
        )?;
        if changed == 0 {
            return Err(StoreError::GateNotFound {
                task_id: task_id.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn approve_gate(&self, task_id: &str, name: &str, approver: Option<&str>, comment: Option<&str>) -> StoreResult<()> {
        self.respond_gate(task_id, name, GateStatus::Approved, approver, comment)
    }

    pub fn reject_gate(&self, task_id: &str, name: &str, approver: Option<&str>, comment: Option<&str>) -> StoreResult<()> {
        self.respond_gate(task_id, name, GateStatus::Rejected, approver, comment)
    }

    pub fn get_pending_gates(&self, task_id: &str) -> StoreResult<Vec<Gate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, name, status, required_at, responded_at, approver, comment FROM gates \
             WHERE task_id = ?1 AND status = 'pending' ORDER BY required_at ASC",
        )?;
        collect_gates(&mut stmt, params![task_id])
    }

    pub fn get_all_gates(&self, task_id: &str) -> StoreResult<Vec<Gate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, name, status, required_at, responded_at, approver, comment FROM gates \
             WHERE task_id = ?1 ORDER BY required_at ASC",
        )?;
        collect_gates(&mut stmt, params![task_id])
    }

    // ------------------------------------------------------------- checkpoints

    pub fn save_checkpoint(&self, ck: &Checkpoint) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_checkpoints(task_id, checkpoint_id, stage, stage_index, conversation_state, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id, checkpoint_id) DO UPDATE SET
                stage = excluded.stage, stage_index = excluded.stage_index,
                conversation_state = excluded.conversation_state, metadata = excluded.metadata,
                created_at = excluded.created_at",
            params![
                ck.task_id,
                ck.checkpoint_id,
                ck.stage,
                ck.stage_index,
                json_col("task_checkpoints", "conversation_state", &ck.conversation_state)?,
                json_col("task_checkpoints", "metadata", &ck.metadata)?,
                ck.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_latest_checkpoint(&self, task_id: &str) -> StoreResult<Option<Checkpoint>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT task_id, checkpoint_id, stage, stage_index, conversation_state, metadata, created_at \
             FROM task_checkpoints WHERE task_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![task_id],
            row_to_checkpoint,
        )
        .optional()?
        .map(Ok)
        .transpose()
    }

    // -------------------------------------------------------------- iteration

    pub fn add_iteration_entry(&self, entry: &IterationEntry) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO iteration_entries(id, task_id, feedback, stage, before_state, after_state, modified_files, diff_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.task_id,
                entry.feedback,
                entry.stage,
                json_col("iteration_entries", "before_state", &entry.before_state)?,
                entry.after_state.as_ref().map(|v| json_col("iteration_entries", "after_state", v)).transpose()?,
                json_col("iteration_entries", "modified_files", &entry.modified_files)?,
                entry.diff_summary,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_iteration_entry(
        &self,
        iteration_id: &str,
        after_state: &serde_json::Value,
        diff_summary: &str,
        modified_files: &[String],
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE iteration_entries SET after_state = ?1, diff_summary = ?2, modified_files = ?3 WHERE id = ?4",
            params![
                json_col("iteration_entries", "after_state", after_state)?,
                diff_summary,
                json_col("iteration_entries", "modified_files", &modified_files.to_vec())?,
                iteration_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::InvalidPatch(format!("no such iteration entry: {iteration_id}")));
        }
        Ok(())
    }

    pub fn get_iteration_history(&self, task_id: &str) -> StoreResult<Vec<IterationEntry>> {
        let conn = self.conn.lock().unwrap();
        self.iteration_history_locked(&conn, task_id)
    }

    fn iteration_history_locked(&self, conn: &Connection, task_id: &str) -> StoreResult<Vec<IterationEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, task_id, feedback, stage, before_state, after_state, modified_files, diff_summary, created_at \
             FROM iteration_entries WHERE task_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, String>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, task_id, feedback, stage, before_state, after_state, modified_files, diff_summary, created_at) = row?;
            out.push(IterationEntry {
                id,
                task_id,
                feedback,
                stage,
                before_state: parse_json("iteration_entries", "before_state", &before_state)?,
                after_state: after_state
                    .map(|s| parse_json("iteration_entries", "after_state", &s))
                    .transpose()?,
                modified_files: parse_json("iteration_entries", "modified_files", &modified_files)?,
                diff_summary,
                created_at,
            });
        }
        Ok(out)
    }

    // -------------------------------------------------------------- workspace

    pub fn set_workspace_info(&self, info: &WorkspaceInfoRow) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workspace_info(task_id, kind, path, branch, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(task_id) DO UPDATE SET
                kind = excluded.kind, path = excluded.path, branch = excluded.branch,
                last_used_at = excluded.last_used_at",
            params![info.task_id, info.kind, info.path, info.branch, info.created_at, info.last_used_at],
        )?;
        Ok(())
    }

    pub fn get_workspace_info(&self, task_id: &str) -> StoreResult<Option<WorkspaceInfoRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT task_id, kind, path, branch, created_at, last_used_at FROM workspace_info WHERE task_id = ?1",
            params![task_id],
            row_to_workspace_info,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn delete_workspace_info(&self, task_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM workspace_info WHERE task_id = ?1", params![task_id])?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------ interactions

    pub fn add_interaction(
        &self,
        task_id: &str,
        command: &str,
        params_json: &serde_json::Value,
        requested_by: Option<&str>,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_interactions(task_id, command, params, requested_by, result, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task_id,
                command,
                json_col("task_interactions", "params", params_json)?,
                requested_by,
                result.map(|r| json_col("task_interactions", "result", r)).transpose()?,
                error,
                now_iso(),
            ],
        )?;
        Ok(())
    }
}

fn collect_gates(stmt: &mut rusqlite::Statement, params: impl rusqlite::Params) -> StoreResult<Vec<Gate>> {
    let rows = stmt
        .query_map(params, |r| {
            Ok(Gate {
                task_id: r.get(0)?,
                name: r.get(1)?,
                status: parse_gate_status(&r.get::<_, String>(2)?),
                required_at: r.get(3)?,
                responded_at: r.get(4)?,
                approver: r.get(5)?,
                comment: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert_task_row(tx: &rusqlite::Transaction, task: &Task) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO tasks (
            id, project_path, workflow, parent_id, subtask_ids, subtask_strategy,
            description, acceptance_criteria, autonomy, priority, effort,
            status, stage, retry_count, max_retries, resume_attempts, branch, pr_url,
            created_at, updated_at, completed_at, trashed_at,
            paused_at, resume_after, pause_reason,
            usage_input_tokens, usage_output_tokens, usage_estimated_cost,
            workspace_config, session_data, error
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31
        )",
        params![
            task.id,
            task.project_path,
            task.workflow,
            task.parent_id,
            json_col("tasks", "subtask_ids", &task.subtask_ids)?,
            subtask_strategy_str(task.subtask_strategy),
            task.description,
            task.acceptance_criteria,
            autonomy_str(task.autonomy),
            task.priority.to_string(),
            task.effort,
            task.status.to_string(),
            task.stage,
            task.retry_count,
            task.max_retries,
            task.resume_attempts,
            task.branch,
            task.pr_url,
            task.created_at,
            task.updated_at,
            task.completed_at,
            task.trashed_at,
            task.paused_at,
            task.resume_after,
            task.pause_reason.as_ref().map(json_pause_reason),
            task.usage.input_tokens as i64,
            task.usage.output_tokens as i64,
            task.usage.estimated_cost,
            json_col("tasks", "workspace_config", &task.workspace_config)?,
            json_col("tasks", "session_data", &task.session_data)?,
            task.error,
        ],
    )?;
    Ok(())
}

const TASK_SELECT_BASE: &str = "SELECT id, project_path, workflow, parent_id, subtask_ids, subtask_strategy,
    description, acceptance_criteria, autonomy, priority, effort,
    status, stage, retry_count, max_retries, resume_attempts, branch, pr_url,
    created_at, updated_at, completed_at, trashed_at,
    paused_at, resume_after, pause_reason,
    usage_input_tokens, usage_output_tokens, usage_estimated_cost,
    workspace_config, session_data, error
FROM tasks";

const TASK_SELECT: &str = "SELECT id, project_path, workflow, parent_id, subtask_ids, subtask_strategy,
    description, acceptance_criteria, autonomy, priority, effort,
    status, stage, retry_count, max_retries, resume_attempts, branch, pr_url,
    created_at, updated_at, completed_at, trashed_at,
    paused_at, resume_after, pause_reason,
    usage_input_tokens, usage_output_tokens, usage_estimated_cost,
    workspace_config, session_data, error
FROM tasks WHERE id = ?1";

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let subtask_ids_json: String = row.get(4)?;
    let workspace_config_json: String = row.get(28)?;
    let session_data_json: String = row.get(29)?;
    let pause_reason_raw: Option<String> = row.get(24)?;

    Ok(Task {
        id: row.get(0)?,
        project_path: row.get(1)?,
        workflow: row.get(2)?,
        parent_id: row.get(3)?,
        subtask_ids: serde_json::from_str(&subtask_ids_json).unwrap_or_default(),
        subtask_strategy: parse_subtask_strategy(&row.get::<_, String>(5)?),
        description: row.get(6)?,
        acceptance_criteria: row.get(7)?,
        autonomy: parse_autonomy(&row.get::<_, String>(8)?),
        priority: row.get::<_, String>(9)?.parse().unwrap_or_default(),
        effort: row.get(10)?,
        status: row.get::<_, String>(11)?.parse().unwrap_or_default(),
        stage: row.get(12)?,
        retry_count: row.get::<_, i64>(13)? as u32,
        max_retries: row.get::<_, i64>(14)? as u32,
        resume_attempts: row.get::<_, i64>(15)? as u32,
        branch: row.get(16)?,
        pr_url: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
        completed_at: row.get(20)?,
        trashed_at: row.get(21)?,
        paused_at: row.get(22)?,
        resume_after: row.get(23)?,
        pause_reason: pause_reason_raw.and_then(|s| serde_json::from_str(&s).ok()),
        usage: Usage {
            input_tokens: row.get::<_, i64>(25)? as u64,
            output_tokens: row.get::<_, i64>(26)? as u64,
            estimated_cost: row.get(27)?,
        },
        workspace_config: serde_json::from_str(&workspace_config_json).unwrap_or(serde_json::Value::Null),
        session_data: serde_json::from_str(&session_data_json).unwrap_or_default(),
        depends_on: Vec::new(),
        blocked_by: Vec::new(),
        error: row.get(30)?,
        logs: Vec::new(),
        artifacts: Vec::new(),
        iteration_history: Vec::new(),
    })
}

fn row_to_checkpoint(row: &Row) -> rusqlite::Result<Checkpoint> {
    let conversation_state: String = row.get(4)?;
    let metadata: String = row.get(5)?;
    Ok(Checkpoint {
        task_id: row.get(0)?,
        checkpoint_id: row.get(1)?,
        stage: row.get(2)?,
        stage_index: row.get::<_, i64>(3)? as u32,
        conversation_state: serde_json::from_str(&conversation_state).unwrap_or(serde_json::Value::Null),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.get(6)?,
    })
}

fn row_to_workspace_info(row: &Row) -> rusqlite::Result<WorkspaceInfoRow> {
    Ok(WorkspaceInfoRow {
        task_id: row.get(0)?,
        kind: row.get(1)?,
        path: row.get(2)?,
        branch: row.get(3)?,
        created_at: row.get(4)?,
        last_used_at: row.get(5)?,
    })
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn parse_level(s: &str) -> LogLevel {
    match s {
        "debug" => LogLevel::Debug,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn gate_status_str(status: GateStatus) -> &'static str {
    match status {
        GateStatus::Pending => "pending",
        GateStatus::Approved => "approved",
        GateStatus::Rejected => "rejected",
    }
}

fn parse_gate_status(s: &str) -> GateStatus {
    match s {
        "approved" => GateStatus::Approved,
        "rejected" => GateStatus::Rejected,
        _ => GateStatus::Pending,
    }
}

fn autonomy_str(a: Autonomy) -> &'static str {
    match a {
        Autonomy::Full => "full",
        Autonomy::Supervised => "supervised",
        Autonomy::Manual => "manual",
    }
}

fn parse_autonomy(s: &str) -> Autonomy {
    match s {
        "full" => Autonomy::Full,
        "manual" => Autonomy::Manual,
        _ => Autonomy::Supervised,
    }
}

fn subtask_strategy_str(s: SubtaskStrategy) -> &'static str {
    match s {
        SubtaskStrategy::Sequential => "sequential",
        SubtaskStrategy::Parallel => "parallel",
    }
}

fn parse_subtask_strategy(s: &str) -> SubtaskStrategy {
    match s {
        "parallel" => SubtaskStrategy::Parallel,
        _ => SubtaskStrategy::Sequential,
    }
}

fn json_pause_reason(reason: &PauseReason) -> String {
    serde_json::to_string(reason).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(description: &str, priority: Priority) -> Task {
        let mut t = Task::new("/tmp/project", "default", description);
        t.priority = priority;
        t
    }

    #[test]
    fn create_then_get_round_trips_non_derived_fields() {
        let store = Store::open_in_memory().unwrap();
        let task = sample_task("do the thing", Priority::High);
        store.create_task(&task).unwrap();

        let fetched = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.description, task.description);
        assert_eq!(fetched.priority, task.priority);
        assert!(fetched.blocked_by.is_empty());
    }

    #[test]
    fn create_task_rejects_duplicate_id() {
        let store = Store::open_in_memory().unwrap();
        let task = sample_task("dup", Priority::Normal);
        store.create_task(&task).unwrap();
        let err = store.create_task(&task).unwrap_err();
        assert!(matches!(err, StoreError::TaskAlreadyExists(_)));
    }

    #[test]
    fn dependency_gating_seed_scenario() {
        // Scenario 1 from the testable-properties seed list.
        let store = Store::open_in_memory().unwrap();
        let a = sample_task("A", Priority::Normal);
        let mut b = sample_task("B", Priority::Normal);
        b.depends_on = vec![a.id.clone()];

        store.create_task(&a).unwrap();
        store.create_task(&b).unwrap();

        let next = store.get_next_queued_task().unwrap().unwrap();
        assert_eq!(next.id, a.id);

        store
            .update_task(&a.id, TaskPatch { status: Some(TaskStatus::Completed), ..Default::default() })
            .unwrap();

        let next = store.get_next_queued_task().unwrap().unwrap();
        assert_eq!(next.id, b.id);
    }

    #[test]
    fn priority_then_fifo_seed_scenario() {
        // Scenario 2: urgent_1, high_1, normal_1, urgent_2, high_2 created in
        // that order; orderByPriority groups by tier, FIFO within tier.
        let store = Store::open_in_memory().unwrap();
        let specs = [
            ("urgent_1", Priority::Urgent),
            ("high_1", Priority::High),
            ("normal_1", Priority::Normal),
            ("urgent_2", Priority::Urgent),
            ("high_2", Priority::High),
        ];
        let mut ids = Vec::new();
        for (name, priority) in specs {
            let mut t = sample_task(name, priority);
            // force strictly increasing created_at even if the clock is coarse
            t.created_at = format!("2026-01-01T00:00:{:02}Z", ids.len());
            ids.push(t.id.clone());
            store.create_task(&t).unwrap();
        }

        let ordered = store
            .list_tasks(&TaskFilter { order_by_priority: true, ..Default::default() })
            .unwrap();
        let ordered_ids: Vec<&str> = ordered.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ordered_ids,
            vec![ids[0].as_str(), ids[3].as_str(), ids[1].as_str(), ids[4].as_str(), ids[2].as_str()]
        );
    }

    #[test]
    fn update_task_distinguishes_absent_from_null() {
        let store = Store::open_in_memory().unwrap();
        let mut task = sample_task("pausable", Priority::Normal);
        task.status = TaskStatus::Paused;
        task.paused_at = Some("2026-01-01T00:00:00Z".to_string());
        task.pause_reason = Some(PauseReason::Capacity);
        store.create_task(&task).unwrap();

        // Patch that doesn't mention pause fields: they must survive.
        store
            .update_task(&task.id, TaskPatch { retry_count: Some(1), ..Default::default() })
            .unwrap();
        let after = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(after.paused_at, task.paused_at);
        assert_eq!(after.retry_count, 1);

        // Patch that explicitly clears them.
        store
            .update_task(
                &task.id,
                TaskPatch {
                    paused_at: Some(None),
                    pause_reason: Some(None),
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                },
            )
            .unwrap();
        let cleared = store.get_task(&task.id).unwrap().unwrap();
        assert!(cleared.paused_at.is_none());
        assert!(cleared.pause_reason.is_none());
    }

    #[test]
    fn get_next_queued_task_never_returns_blocked() {
        let store = Store::open_in_memory().unwrap();
        let a = sample_task("A", Priority::Urgent);
        let mut b = sample_task("B", Priority::Urgent);
        b.depends_on = vec![a.id.clone()];
        b.created_at = "2020-01-01T00:00:00Z".to_string(); // earlier than A, still must not win
        store.create_task(&b).unwrap();
        store.create_task(&a).unwrap();

        let next = store.get_next_queued_task().unwrap().unwrap();
        assert_eq!(next.id, a.id);
    }

    #[test]
    fn gates_round_trip_and_respond() {
        let store = Store::open_in_memory().unwrap();
        let task = sample_task("gated", Priority::Normal);
        store.create_task(&task).unwrap();

        store
            .set_gate(&Gate {
                task_id: task.id.clone(),
                name: "plan-review".to_string(),
                status: GateStatus::Pending,
                required_at: now_iso(),
                responded_at: None,
                approver: None,
                comment: None,
            })
            .unwrap();

        let pending = store.get_pending_gates(&task.id).unwrap();
        assert_eq!(pending.len(), 1);

        store.approve_gate(&task.id, "plan-review", Some("alice"), None).unwrap();
        let pending_after = store.get_pending_gates(&task.id).unwrap();
        assert!(pending_after.is_empty());
        let all = store.get_all_gates(&task.id).unwrap();
        assert_eq!(all[0].status, GateStatus::Approved);
    }

    #[test]
    fn checkpoints_upsert_and_latest_wins() {
        let store = Store::open_in_memory().unwrap();
        let task = sample_task("checkpointed", Priority::Normal);
        store.create_task(&task).unwrap();

        store
            .save_checkpoint(&Checkpoint {
                task_id: task.id.clone(),
                checkpoint_id: "ck-1".to_string(),
                stage: "plan".to_string(),
                stage_index: 0,
                conversation_state: serde_json::json!({"n": 1}),
                metadata: serde_json::Value::Null,
                created_at: "2026-01-01T00:00:00Z".to_string(),
            })
            .unwrap();
        store
            .save_checkpoint(&Checkpoint {
                task_id: task.id.clone(),
                checkpoint_id: "ck-2".to_string(),
                stage: "implement".to_string(),
                stage_index: 1,
                conversation_state: serde_json::json!({"n": 2}),
                metadata: serde_json::Value::Null,
                created_at: "2026-01-02T00:00:00Z".to_string(),
            })
            .unwrap();

        let latest = store.get_latest_checkpoint(&task.id).unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, "ck-2");
    }

    #[test]
    fn iteration_entries_allow_nonexistent_task_id() {
        // Open question decision: no preflight existence check.
        let store = Store::open_in_memory().unwrap();
        let entry = IterationEntry {
            id: "ghost-task-iter-0".to_string(),
            task_id: "ghost-task".to_string(),
            feedback: "please retry".to_string(),
            stage: None,
            before_state: serde_json::Value::Null,
            after_state: None,
            modified_files: Vec::new(),
            diff_summary: None,
            created_at: now_iso(),
        };
        store.add_iteration_entry(&entry).unwrap();
        let history = store.get_iteration_history("ghost-task").unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn trashed_tasks_are_invisible_by_default() {
        let store = Store::open_in_memory().unwrap();
        let task = sample_task("to be trashed", Priority::Normal);
        store.create_task(&task).unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    trashed_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            )
            .unwrap();

        let visible = store.list_tasks(&TaskFilter::default()).unwrap();
        assert!(visible.is_empty());
        let trashed = store.list_trashed().unwrap();
        assert_eq!(trashed.len(), 1);
    }

    #[test]
    fn migration_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apex.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_task(&sample_task("persisted", Priority::Normal)).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let tasks = store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
