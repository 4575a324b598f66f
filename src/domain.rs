//! Core domain types: job lifecycle states, file categories, event sources,
//! and the context handed to skills.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
///
/// `aborted` is absorbing: once written it can never be overwritten.
/// `succeeded` is terminal; `failed` is terminal but restartable via
/// `failed -> queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    WaitingApproval,
    Verifying,
    Packaging,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Verifying => "verifying",
            Self::Packaging => "packaging",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting_approval" => Some(Self::WaitingApproval),
            "verifying" => Some(Self::Verifying),
            "packaging" => Some(Self::Packaging),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// True for states no executor will ever advance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Whether `self -> to` is in the legal transition set.
    ///
    /// The full set: `created->queued`, `queued->running`,
    /// `running<->waiting_approval`, `running->verifying`,
    /// `verifying->packaging`, `packaging->succeeded`,
    /// any non-aborted -> `failed`, any non-{succeeded,aborted} -> `aborted`,
    /// and the `failed->queued` restart.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Aborted, _) => false,
            (_, Failed) => true,
            (Succeeded, Aborted) => false,
            (_, Aborted) => true,
            (Created, Queued) => true,
            (Failed, Queued) => true,
            (Queued, Running) => true,
            (Running, WaitingApproval) => true,
            (WaitingApproval, Running) => true,
            (Running, Verifying) => true,
            (Verifying, Packaging) => true,
            (Packaging, Succeeded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Category of a file attached to a job.
///
/// Only `output` and `bundle` are externally listable and downloadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Input,
    Output,
    Bundle,
    Log,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Bundle => "bundle",
            Self::Log => "log",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            "bundle" => Some(Self::Bundle),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    /// Whether artifacts of this category may be served to clients.
    pub fn is_downloadable(&self) -> bool {
        matches!(self, Self::Output | Self::Bundle)
    }
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Origin of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Worker,
    Opencode,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Worker => "worker",
            Self::Opencode => "opencode",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider/model pair forwarded verbatim to the agent server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// Everything a skill needs to score, plan, prompt, and validate a job.
///
/// Skills are pure value objects; they never touch the store or the queue.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub requirement: String,
    pub workspace_dir: PathBuf,
    pub input_files: Vec<PathBuf>,
    pub selected_skill: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub output_contract: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_absorbing() {
        for to in [
            JobStatus::Created,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Failed,
            JobStatus::Succeeded,
            JobStatus::Aborted,
        ] {
            assert!(!JobStatus::Aborted.can_transition_to(to));
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use JobStatus::*;
        let path = [Created, Queued, Running, Verifying, Packaging, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn approval_wait_is_reversible() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::WaitingApproval));
        assert!(JobStatus::WaitingApproval.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn failed_is_restartable_but_succeeded_is_not() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Aborted));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Aborted));
    }

    #[test]
    fn skipping_stages_is_illegal() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Verifying));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Created.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Created,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::WaitingApproval,
            JobStatus::Verifying,
            JobStatus::Packaging,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Aborted,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn model_ref_uses_wire_field_names() {
        let model = ModelRef {
            provider_id: "anthropic".to_string(),
            model_id: "claude-sonnet-4".to_string(),
        };
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["providerID"], "anthropic");
        assert_eq!(json["modelID"], "claude-sonnet-4");
    }
}
