//! Error types for foundry.
//!
//! Each area gets its own `thiserror` enum; the executor folds every
//! terminal failure into a stable `error_code` string (see [`codes`])
//! plus a trimmed message before writing the `failed` state.

use uuid::Uuid;

/// Stable identifiers persisted in `Job.error_code`.
pub mod codes {
    pub const AGENT_SESSION_CREATE_FAILED: &str = "agent.session.create_failed";
    pub const AGENT_PROMPT_FAILED: &str = "agent.prompt_failed";
    pub const AGENT_UNAVAILABLE: &str = "agent.unavailable";
    pub const AGENT_AUTH_FAILED: &str = "agent.auth_failed";
    pub const PERMISSION_TIMEOUT: &str = "permission.timeout";
    pub const PERMISSION_REJECT_UNRECOVERABLE: &str = "permission.reject_unrecoverable";
    pub const INPUTS_TAMPERED: &str = "inputs.tampered";
    pub const OUTPUTS_CONTRACT_VIOLATED: &str = "outputs.contract.violated";
    pub const OUTPUTS_MISSING: &str = "outputs.missing";
    pub const JOB_TIMEOUT: &str = "job.timeout";
    pub const JOB_KILLED: &str = "job.killed";
    pub const STORAGE_WRITE_FAILED: &str = "storage.write_failed";
    pub const BUNDLE_FAILED: &str = "bundle.failed";
    pub const INPUT_INVALID: &str = "input.invalid";
    pub const STATE_ILLEGAL_TRANSITION: &str = "state.illegal_transition";
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },

    #[error("data root {path} is not usable: {reason}")]
    DataRoot { path: String, reason: String },
}

/// Persistence errors from the job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: Uuid },

    #[error("artifact not found: {artifact_id}")]
    ArtifactNotFound { artifact_id: i64 },

    #[error("session already bound for job {job_id}")]
    SessionAlreadyBound { job_id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store task failed: {reason}")]
    TaskFailed { reason: String },
}

/// Errors from the opencode HTTP client.
///
/// The taxonomy drives retry decisions: `Transport` is retriable at the
/// queue layer, `Server` once within a call, everything else is final.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("opencode transport error: {reason}")]
    Transport { reason: String },

    #[error("opencode authentication failed (status {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("opencode resource not found (status {status}): {body}")]
    NotFound { status: u16, body: String },

    #[error("opencode server error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("opencode rejected request (status {status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("opencode response missing field: {field}")]
    MalformedResponse { field: String },
}

impl AgentError {
    /// True for failures worth retrying at the queue layer.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Workspace and bundle filesystem errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("empty upload is not allowed: {filename}")]
    EmptyUpload { filename: String },

    #[error("file exceeds size limit of {limit_bytes} bytes: {filename}")]
    UploadTooLarge { filename: String, limit_bytes: u64 },

    #[error("workspace io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bundle build failed: {reason}")]
    Bundle { reason: String },
}

/// Skill resolution and output-contract errors.
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("unknown skill code: {code}")]
    UnknownSkill { code: String },

    #[error("output contract violated: {reason}")]
    ContractViolated { reason: String },

    /// The agent produced no outputs at all, as opposed to the wrong ones.
    #[error("outputs missing: {reason}")]
    OutputsMissing { reason: String },
}

/// Terminal outcomes of a single executor run.
///
/// `Aborted` is a control-flow signal, not a failure: the job has already
/// been moved to `aborted` by an external actor and the executor must stop
/// without writing any further state.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("job was aborted")]
    Aborted,

    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    /// The agent server was unreachable while creating the session.
    /// The only failure the queue layer retries.
    #[error("agent unavailable during session create: {message}")]
    SessionCreateUnavailable { message: String },

    #[error("job execution failed ({code}): {message}")]
    Failed { code: &'static str, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutorError {
    /// Fold any failure into a `(code, message)` pair for the store.
    ///
    /// `Aborted` deliberately has no code; callers must branch on it first.
    pub fn as_failure(&self) -> (&'static str, String) {
        match self {
            Self::Aborted => (codes::STATE_ILLEGAL_TRANSITION, "job was aborted".to_string()),
            Self::IllegalTransition { from, to, .. } => (
                codes::STATE_ILLEGAL_TRANSITION,
                format!("illegal transition {from} -> {to}"),
            ),
            Self::SessionCreateUnavailable { message } => {
                (codes::AGENT_UNAVAILABLE, message.clone())
            }
            Self::Failed { code, message } => (*code, message.clone()),
            Self::Store(e) => (codes::STORAGE_WRITE_FAILED, e.to_string()),
        }
    }

    /// Session-create transport failures are the only queue-level retries.
    pub fn is_retriable_session_create(&self) -> bool {
        matches!(self, Self::SessionCreateUnavailable { .. })
    }
}

impl From<AgentError> for ExecutorError {
    fn from(err: AgentError) -> Self {
        let code = match &err {
            AgentError::Transport { .. } => codes::AGENT_UNAVAILABLE,
            AgentError::Auth { .. } => codes::AGENT_AUTH_FAILED,
            _ => codes::AGENT_PROMPT_FAILED,
        };
        Self::Failed {
            code,
            message: trim_message(&err.to_string()),
        }
    }
}

impl From<WorkspaceError> for ExecutorError {
    fn from(err: WorkspaceError) -> Self {
        let code = match &err {
            WorkspaceError::Bundle { .. } => codes::BUNDLE_FAILED,
            _ => codes::STORAGE_WRITE_FAILED,
        };
        Self::Failed {
            code,
            message: trim_message(&err.to_string()),
        }
    }
}

/// Cap stored error messages so a pathological agent response cannot
/// bloat the job row or the SSE payloads built from it.
pub fn trim_message(message: &str) -> String {
    const MAX: usize = 2000;
    if message.len() <= MAX {
        return message.to_string();
    }
    let mut end = MAX;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
