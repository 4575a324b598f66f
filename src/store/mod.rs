//! Durable job store.
//!
//! The store is the single authority for job state: every transition is
//! committed through [`JobStore::set_status`], a conditional update that
//! enforces the legal transition set and the absorbing `aborted` state.
//! Executors and the API never coordinate with each other directly; they
//! race on these conditional updates instead.

mod sqlite;

pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{EventSource, FileCategory, JobStatus, ModelRef};
use crate::error::StoreError;

/// A persisted job row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub created_by: String,
    pub status: JobStatus,
    pub requirement: String,
    pub selected_skill: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub output_contract: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub workspace_dir: String,
    pub result_bundle_path: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A catalog entry for a file belonging to a job.
#[derive(Debug, Clone)]
pub struct JobFile {
    pub id: i64,
    pub job_id: Uuid,
    pub category: FileCategory,
    pub relative_path: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// An append-only audit record.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub status: Option<JobStatus>,
    pub source: EventSource,
    pub event_type: String,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Audit of one automated permission reply.
#[derive(Debug, Clone)]
pub struct PermissionAction {
    pub id: i64,
    pub job_id: Uuid,
    pub request_id: String,
    pub action: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Input-file metadata captured at job creation.
#[derive(Debug, Clone)]
pub struct InputFileRecord {
    pub relative_path: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Parameters for creating a job together with its input files and
/// (optionally) an idempotency claim, all in one transaction.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub tenant_id: String,
    pub created_by: String,
    pub requirement: String,
    pub selected_skill: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub output_contract: Option<serde_json::Value>,
    pub workspace_dir: String,
    pub input_files: Vec<InputFileRecord>,
    pub idempotency_key: Option<String>,
    pub requirement_hash: String,
}

/// Parameters for appending an audit event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub job_id: Uuid,
    pub status: Option<JobStatus>,
    pub source: EventSource,
    pub event_type: String,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(job_id: Uuid, source: EventSource, event_type: impl Into<String>) -> Self {
        Self {
            job_id,
            status: None,
            source,
            event_type: event_type.into(),
            message: None,
            payload: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Outcome of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatusOutcome {
    /// The transition was committed.
    Applied,
    /// The update was refused; `current` is the prevailing status.
    Refused { current: JobStatus },
}

impl SetStatusOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Error details written alongside a `failed` transition.
#[derive(Debug, Clone)]
pub struct FailureDetail {
    pub code: String,
    pub message: String,
}

/// Durable record of jobs, files, events, permission actions, and the
/// idempotency index.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job in `created` state together with its input files,
    /// idempotency claim, and a `job.created` event. When the idempotency
    /// triple already maps to another job, that job is returned instead
    /// and nothing is inserted.
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn find_by_idempotency(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        requirement_hash: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Conditionally transition a job.
    ///
    /// Applies only when the current status is in `from`, is not
    /// `aborted`, and the transition is in the legal set. Emits a
    /// `job.status.changed` event in the same transaction. Error details
    /// are written when moving to `failed` and cleared on `succeeded`;
    /// other transitions leave them untouched. Moving to `queued` clears
    /// the session binding so a restarted run can bind a fresh session.
    async fn set_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        failure: Option<FailureDetail>,
    ) -> Result<SetStatusOutcome, StoreError>;

    /// Bind the agent session id. Idempotent for the same value; a second
    /// assignment with a different value is rejected.
    async fn set_session_id(&self, job_id: Uuid, session_id: &str) -> Result<(), StoreError>;

    async fn set_result_bundle(&self, job_id: Uuid, bundle_path: &str) -> Result<(), StoreError>;

    async fn append_event(&self, event: NewEvent) -> Result<JobEvent, StoreError>;

    /// Events with id greater than `after_id`, ascending, at most `limit`.
    async fn list_events(
        &self,
        job_id: Uuid,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<JobEvent>, StoreError>;

    async fn add_permission_action(
        &self,
        job_id: Uuid,
        request_id: &str,
        action: &str,
        actor: &str,
    ) -> Result<(), StoreError>;

    async fn list_permission_actions(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PermissionAction>, StoreError>;

    /// Insert or update a file row keyed by `(job_id, category,
    /// relative_path)`.
    async fn upsert_file(
        &self,
        job_id: Uuid,
        category: FileCategory,
        relative_path: &str,
        mime_type: Option<&str>,
        size_bytes: u64,
        sha256: &str,
    ) -> Result<(), StoreError>;

    async fn list_files(
        &self,
        job_id: Uuid,
        category: Option<FileCategory>,
    ) -> Result<Vec<JobFile>, StoreError>;

    async fn get_file(&self, file_id: i64) -> Result<Option<JobFile>, StoreError>;

    /// Job ids currently in the given status (startup requeue sweep).
    async fn list_jobs_in_status(&self, status: JobStatus) -> Result<Vec<Uuid>, StoreError>;
}
