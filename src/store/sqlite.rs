//! SQLite-backed job store.
//!
//! A single pooled connection guarded by a mutex; every call runs on the
//! blocking thread pool so the async runtime is never parked on disk I/O.
//! Conditional updates (`set_status`) read and write inside one exclusive
//! transaction, which makes them linearizable per job.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::domain::{EventSource, FileCategory, JobStatus, ModelRef};
use crate::error::StoreError;
use crate::store::{
    FailureDetail, InputFileRecord, Job, JobEvent, JobFile, JobStore, NewEvent, NewJob,
    PermissionAction, SetStatusOutcome,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                   TEXT PRIMARY KEY,
    tenant_id            TEXT NOT NULL,
    created_by           TEXT NOT NULL,
    status               TEXT NOT NULL,
    requirement          TEXT NOT NULL,
    selected_skill       TEXT NOT NULL,
    agent                TEXT NOT NULL,
    model_json           TEXT,
    output_contract_json TEXT,
    session_id           TEXT,
    workspace_dir        TEXT NOT NULL,
    result_bundle_path   TEXT,
    error_code           TEXT,
    error_message        TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id        TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    category      TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    mime_type     TEXT,
    size_bytes    INTEGER NOT NULL,
    sha256        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE (job_id, category, relative_path)
);

CREATE TABLE IF NOT EXISTS job_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    status       TEXT,
    source       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    message      TEXT,
    payload_json TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events (job_id, id);

CREATE TABLE IF NOT EXISTS permission_actions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    request_id TEXT NOT NULL,
    action     TEXT NOT NULL,
    actor      TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency_records (
    tenant_id        TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL,
    requirement_hash TEXT NOT NULL,
    job_id           TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    created_at       TEXT NOT NULL,
    PRIMARY KEY (tenant_id, idempotency_key, requirement_hash)
);
"#;

/// SQLite implementation of [`JobStore`].
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory store, used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::TaskFailed {
            reason: e.to_string(),
        })?
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::TaskFailed {
        reason: format!("corrupt uuid column '{raw}': {e}"),
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    JobStatus::parse(raw).ok_or_else(|| StoreError::TaskFailed {
        reason: format!("corrupt status column '{raw}'"),
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        created_by: row.get("created_by")?,
        status: row.get("status")?,
        requirement: row.get("requirement")?,
        selected_skill: row.get("selected_skill")?,
        agent: row.get("agent")?,
        model_json: row.get("model_json")?,
        output_contract_json: row.get("output_contract_json")?,
        session_id: row.get("session_id")?,
        workspace_dir: row.get("workspace_dir")?,
        result_bundle_path: row.get("result_bundle_path")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Column-level image of a job row, converted to [`Job`] after the
/// rusqlite borrow ends.
struct RawJob {
    id: String,
    tenant_id: String,
    created_by: String,
    status: String,
    requirement: String,
    selected_skill: String,
    agent: String,
    model_json: Option<String>,
    output_contract_json: Option<String>,
    session_id: Option<String>,
    workspace_dir: String,
    result_bundle_path: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn into_job(self) -> Result<Job, StoreError> {
        let model = match self.model_json {
            Some(raw) => serde_json::from_str::<ModelRef>(&raw).ok(),
            None => None,
        };
        let output_contract = match self.output_contract_json {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };
        Ok(Job {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            created_by: self.created_by,
            status: parse_status(&self.status)?,
            requirement: self.requirement,
            selected_skill: self.selected_skill,
            agent: self.agent,
            model,
            output_contract,
            session_id: self.session_id,
            workspace_dir: self.workspace_dir,
            result_bundle_path: self.result_bundle_path,
            error_code: self.error_code,
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

fn load_job(conn: &Connection, job_id: Uuid) -> Result<Option<Job>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![job_id.to_string()],
            job_from_row,
        )
        .optional()?;
    raw.map(RawJob::into_job).transpose()
}

fn insert_event(
    conn: &Connection,
    job_id: Uuid,
    status: Option<JobStatus>,
    source: EventSource,
    event_type: &str,
    message: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO job_events (job_id, status, source, event_type, message, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            job_id.to_string(),
            status.map(|s| s.as_str()),
            source.as_str(),
            event_type,
            message,
            payload.map(|p| p.to_string()),
            now_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, JobFileColumns)> {
    Ok((
        row.get("job_id")?,
        row.get("category")?,
        JobFileColumns {
            id: row.get("id")?,
            relative_path: row.get("relative_path")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
            sha256: row.get("sha256")?,
            created_at: row.get("created_at")?,
        },
    ))
}

struct JobFileColumns {
    id: i64,
    relative_path: String,
    mime_type: Option<String>,
    size_bytes: i64,
    sha256: String,
    created_at: String,
}

fn into_job_file(
    (job_id, category, cols): (String, String, JobFileColumns),
) -> Result<JobFile, StoreError> {
    Ok(JobFile {
        id: cols.id,
        job_id: parse_uuid(&job_id)?,
        category: FileCategory::parse(&category).ok_or_else(|| StoreError::TaskFailed {
            reason: format!("corrupt file category '{category}'"),
        })?,
        relative_path: cols.relative_path,
        mime_type: cols.mime_type,
        size_bytes: cols.size_bytes.max(0) as u64,
        sha256: cols.sha256,
        created_at: parse_timestamp(&cols.created_at),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(ref key) = new.idempotency_key {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT job_id FROM idempotency_records
                         WHERE tenant_id = ?1 AND idempotency_key = ?2 AND requirement_hash = ?3",
                        params![new.tenant_id, key, new.requirement_hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing_id) = existing {
                    // Concurrent duplicate submission; hand back the winner.
                    let job = load_job(&tx, parse_uuid(&existing_id)?)?;
                    if let Some(job) = job {
                        tx.commit()?;
                        return Ok(job);
                    }
                }
            }

            let now = now_rfc3339();
            tx.execute(
                "INSERT INTO jobs (id, tenant_id, created_by, status, requirement, selected_skill,
                                   agent, model_json, output_contract_json, session_id, workspace_dir,
                                   result_bundle_path, error_code, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, NULL, NULL, NULL, ?11, ?11)",
                params![
                    new.id.to_string(),
                    new.tenant_id,
                    new.created_by,
                    JobStatus::Created.as_str(),
                    new.requirement,
                    new.selected_skill,
                    new.agent,
                    new.model
                        .as_ref()
                        .map(|m| serde_json::to_string(m).unwrap_or_default()),
                    new.output_contract.as_ref().map(|c| c.to_string()),
                    new.workspace_dir,
                    now,
                ],
            )?;

            for file in &new.input_files {
                insert_file(&tx, new.id, FileCategory::Input, file)?;
            }

            if let Some(ref key) = new.idempotency_key {
                tx.execute(
                    "INSERT INTO idempotency_records
                         (tenant_id, idempotency_key, requirement_hash, job_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        new.tenant_id,
                        key,
                        new.requirement_hash,
                        new.id.to_string(),
                        now_rfc3339()
                    ],
                )?;
            }

            insert_event(
                &tx,
                new.id,
                Some(JobStatus::Created),
                EventSource::Api,
                "job.created",
                Some("job created"),
                Some(&serde_json::json!({ "selected_skill": new.selected_skill })),
            )?;

            let job = load_job(&tx, new.id)?.ok_or(StoreError::JobNotFound { job_id: new.id })?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.with_conn(move |conn| load_job(conn, job_id)).await
    }

    async fn find_by_idempotency(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        requirement_hash: &str,
    ) -> Result<Option<Job>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let idempotency_key = idempotency_key.to_string();
        let requirement_hash = requirement_hash.to_string();
        self.with_conn(move |conn| {
            let job_id: Option<String> = conn
                .query_row(
                    "SELECT job_id FROM idempotency_records
                     WHERE tenant_id = ?1 AND idempotency_key = ?2 AND requirement_hash = ?3",
                    params![tenant_id, idempotency_key, requirement_hash],
                    |row| row.get(0),
                )
                .optional()?;
            match job_id {
                Some(raw) => load_job(conn, parse_uuid(&raw)?),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        failure: Option<FailureDetail>,
    ) -> Result<SetStatusOutcome, StoreError> {
        let from = from.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current_raw: Option<String> = tx
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let current = match current_raw {
                Some(raw) => parse_status(&raw)?,
                None => return Err(StoreError::JobNotFound { job_id }),
            };

            if current == JobStatus::Aborted
                || !from.contains(&current)
                || !current.can_transition_to(to)
            {
                return Ok(SetStatusOutcome::Refused { current });
            }

            match (to, &failure) {
                (JobStatus::Failed, Some(detail)) => {
                    tx.execute(
                        "UPDATE jobs SET status = ?1, error_code = ?2, error_message = ?3,
                                         updated_at = ?4 WHERE id = ?5",
                        params![
                            to.as_str(),
                            detail.code,
                            detail.message,
                            now_rfc3339(),
                            job_id.to_string()
                        ],
                    )?;
                }
                (JobStatus::Succeeded, _) => {
                    // A clean finish clears any error left over from a
                    // previous failed attempt.
                    tx.execute(
                        "UPDATE jobs SET status = ?1, error_code = NULL, error_message = NULL,
                                         updated_at = ?2 WHERE id = ?3",
                        params![to.as_str(), now_rfc3339(), job_id.to_string()],
                    )?;
                }
                (JobStatus::Queued, _) => {
                    // A restart gets a fresh session binding; the old
                    // session is stale once its run failed.
                    tx.execute(
                        "UPDATE jobs SET status = ?1, session_id = NULL, updated_at = ?2
                         WHERE id = ?3",
                        params![to.as_str(), now_rfc3339(), job_id.to_string()],
                    )?;
                }
                _ => {
                    tx.execute(
                        "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                        params![to.as_str(), now_rfc3339(), job_id.to_string()],
                    )?;
                }
            }

            insert_event(
                &tx,
                job_id,
                Some(to),
                EventSource::Worker,
                "job.status.changed",
                Some(to.as_str()),
                failure
                    .as_ref()
                    .map(|d| serde_json::json!({ "error_code": d.code }))
                    .as_ref(),
            )?;

            tx.commit()?;
            Ok(SetStatusOutcome::Applied)
        })
        .await
    }

    async fn set_session_id(&self, job_id: Uuid, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT session_id FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                None => return Err(StoreError::JobNotFound { job_id }),
                Some(Some(bound)) if bound != session_id => {
                    return Err(StoreError::SessionAlreadyBound { job_id });
                }
                Some(Some(_)) => {
                    // Same value twice is a no-op.
                    tx.commit()?;
                    return Ok(());
                }
                Some(None) => {}
            }
            tx.execute(
                "UPDATE jobs SET session_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![session_id, now_rfc3339(), job_id.to_string()],
            )?;
            insert_event(
                &tx,
                job_id,
                None,
                EventSource::Worker,
                "opencode.session.created",
                Some(&session_id),
                Some(&serde_json::json!({ "session_id": session_id })),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_result_bundle(&self, job_id: Uuid, bundle_path: &str) -> Result<(), StoreError> {
        let bundle_path = bundle_path.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs SET result_bundle_path = ?1, updated_at = ?2 WHERE id = ?3",
                params![bundle_path, now_rfc3339(), job_id.to_string()],
            )?;
            if updated == 0 {
                return Err(StoreError::JobNotFound { job_id });
            }
            Ok(())
        })
        .await
    }

    async fn append_event(&self, event: NewEvent) -> Result<JobEvent, StoreError> {
        self.with_conn(move |conn| {
            let id = insert_event(
                conn,
                event.job_id,
                event.status,
                event.source,
                &event.event_type,
                event.message.as_deref(),
                event.payload.as_ref(),
            )?;
            Ok(JobEvent {
                id,
                job_id: event.job_id,
                status: event.status,
                source: event.source,
                event_type: event.event_type,
                message: event.message,
                payload: event.payload,
                created_at: Utc::now(),
            })
        })
        .await
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<JobEvent>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, status, source, event_type, message, payload_json, created_at
                 FROM job_events WHERE job_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![job_id.to_string(), after_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, job_raw, status, source, event_type, message, payload, created_at) = row?;
                events.push(JobEvent {
                    id,
                    job_id: parse_uuid(&job_raw)?,
                    status: status.as_deref().and_then(JobStatus::parse),
                    source: match source.as_str() {
                        "api" => EventSource::Api,
                        "opencode" => EventSource::Opencode,
                        _ => EventSource::Worker,
                    },
                    event_type,
                    message,
                    payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                    created_at: parse_timestamp(&created_at),
                });
            }
            Ok(events)
        })
        .await
    }

    async fn add_permission_action(
        &self,
        job_id: Uuid,
        request_id: &str,
        action: &str,
        actor: &str,
    ) -> Result<(), StoreError> {
        let request_id = request_id.to_string();
        let action = action.to_string();
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO permission_actions (job_id, request_id, action, actor, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id.to_string(), request_id, action, actor, now_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_permission_actions(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PermissionAction>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, request_id, action, actor, created_at
                 FROM permission_actions WHERE job_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![job_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            let mut actions = Vec::new();
            for row in rows {
                let (id, job_raw, request_id, action, actor, created_at) = row?;
                actions.push(PermissionAction {
                    id,
                    job_id: parse_uuid(&job_raw)?,
                    request_id,
                    action,
                    actor,
                    created_at: parse_timestamp(&created_at),
                });
            }
            Ok(actions)
        })
        .await
    }

    async fn upsert_file(
        &self,
        job_id: Uuid,
        category: FileCategory,
        relative_path: &str,
        mime_type: Option<&str>,
        size_bytes: u64,
        sha256: &str,
    ) -> Result<(), StoreError> {
        let relative_path = relative_path.to_string();
        let mime_type = mime_type.map(str::to_string);
        let sha256 = sha256.to_string();
        self.with_conn(move |conn| {
            insert_file(
                conn,
                job_id,
                category,
                &InputFileRecord {
                    relative_path,
                    mime_type,
                    size_bytes,
                    sha256,
                },
            )
        })
        .await
    }

    async fn list_files(
        &self,
        job_id: Uuid,
        category: Option<FileCategory>,
    ) -> Result<Vec<JobFile>, StoreError> {
        self.with_conn(move |conn| {
            let mut files = Vec::new();
            match category {
                Some(cat) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM job_files WHERE job_id = ?1 AND category = ?2 ORDER BY id ASC",
                    )?;
                    let rows =
                        stmt.query_map(params![job_id.to_string(), cat.as_str()], file_from_row)?;
                    for row in rows {
                        files.push(into_job_file(row?)?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM job_files WHERE job_id = ?1 ORDER BY id ASC")?;
                    let rows = stmt.query_map(params![job_id.to_string()], file_from_row)?;
                    for row in rows {
                        files.push(into_job_file(row?)?);
                    }
                }
            }
            Ok(files)
        })
        .await
    }

    async fn get_file(&self, file_id: i64) -> Result<Option<JobFile>, StoreError> {
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT * FROM job_files WHERE id = ?1",
                    params![file_id],
                    file_from_row,
                )
                .optional()?;
            raw.map(into_job_file).transpose()
        })
        .await
    }

    async fn list_jobs_in_status(&self, status: JobStatus) -> Result<Vec<Uuid>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC")?;
            let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(parse_uuid(&row?)?);
            }
            Ok(ids)
        })
        .await
    }
}

fn insert_file(
    conn: &Connection,
    job_id: Uuid,
    category: FileCategory,
    file: &InputFileRecord,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO job_files (job_id, category, relative_path, mime_type, size_bytes, sha256, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (job_id, category, relative_path)
         DO UPDATE SET mime_type = excluded.mime_type,
                       size_bytes = excluded.size_bytes,
                       sha256 = excluded.sha256",
        params![
            job_id.to_string(),
            category.as_str(),
            file.relative_path,
            file.mime_type,
            file.size_bytes as i64,
            file.sha256,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}
