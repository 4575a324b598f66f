//! Job executor: drives one job from `queued` to a terminal state.
//!
//! The pipeline is a linear stage progression with one embedded loop and
//! one universal interrupt:
//!
//! ```text
//! queued -> running -> [convergence loop] -> verifying -> packaging -> succeeded
//!                          |    ^
//!            event tick ---+    +--- poll tick (every T_poll)
//!
//! abort: checked before every transition and around every suspending
//! operation; once observed, no further state is written.
//! ```
//!
//! The convergence loop fuses the event stream (low latency) with a
//! compensating status/permission poll (correctness). Either path can
//! complete the job; both agree at steady state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::domain::{EventSource, FileCategory, JobContext, JobStatus};
use crate::error::{codes, trim_message, AgentError, ExecutorError, StoreError};
use crate::opencode::{BridgeEvent, EventBridge, OpencodeClient, PermissionRequest};
use crate::policy::PermissionPolicyEngine;
use crate::skills::SkillRegistry;
use crate::store::{FailureDetail, JobStore, NewEvent, SetStatusOutcome};
use crate::workspace::{
    sha256_file, BundleBuilder, WorkspaceManager, BUNDLE_FILE, LAST_MESSAGE_FILE,
};

/// Actor recorded on automated permission replies.
const POLICY_ACTOR: &str = "policy-engine";

/// Drives a single job through the full pipeline. One executor owns one
/// job at a time; the shared client, bridge, and store are process
/// singletons safe for concurrent use across executors.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    client: Arc<OpencodeClient>,
    bridge: Arc<EventBridge>,
    registry: Arc<SkillRegistry>,
    workspace: WorkspaceManager,
    bundles: BundleBuilder,
    policy: PermissionPolicyEngine,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<OpencodeClient>,
        bridge: Arc<EventBridge>,
        registry: Arc<SkillRegistry>,
        workspace: WorkspaceManager,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            client,
            bridge,
            registry,
            workspace,
            bundles: BundleBuilder::new(),
            policy: PermissionPolicyEngine::new(),
            config,
        }
    }

    /// Run the job to a terminal state.
    ///
    /// Every terminal exception becomes a state write plus a `job.failed`
    /// event before this returns; the `Err` value only informs the worker
    /// pool (retry decisions). An observed abort is not an error.
    pub async fn run(&self, job_id: Uuid) -> Result<(), ExecutorError> {
        match self.execute(job_id).await {
            Ok(()) => Ok(()),
            Err(ExecutorError::Aborted) => {
                tracing::info!(job_id = %job_id, "Executor released after abort");
                Ok(())
            }
            Err(err) => {
                let (code, message) = err.as_failure();
                self.record_failure(job_id, code, &message).await;
                Err(err)
            }
        }
    }

    /// Write the `failed` state and `job.failed` event, unless the job
    /// was aborted meanwhile (abort preempts every error path).
    async fn record_failure(&self, job_id: Uuid, code: &str, message: &str) {
        let from = [
            JobStatus::Created,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::WaitingApproval,
            JobStatus::Verifying,
            JobStatus::Packaging,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ];
        let outcome = self
            .store
            .set_status(
                job_id,
                &from,
                JobStatus::Failed,
                Some(FailureDetail {
                    code: code.to_string(),
                    message: trim_message(message),
                }),
            )
            .await;
        match outcome {
            Ok(SetStatusOutcome::Applied) => {
                let event = NewEvent::new(job_id, EventSource::Worker, "job.failed")
                    .with_status(JobStatus::Failed)
                    .with_message(trim_message(message))
                    .with_payload(serde_json::json!({ "error_code": code }));
                if let Err(e) = self.store.append_event(event).await {
                    tracing::warn!(job_id = %job_id, "Failed to record job.failed event: {e}");
                }
                tracing::warn!(job_id = %job_id, error_code = code, "Job failed: {message}");
            }
            Ok(SetStatusOutcome::Refused { current }) => {
                tracing::info!(
                    job_id = %job_id,
                    current = %current,
                    "Failure superseded by terminal state"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, "Could not write failed state: {e}");
            }
        }
    }

    async fn execute(&self, job_id: Uuid) -> Result<(), ExecutorError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(StoreError::JobNotFound { job_id })?;
        if job.status == JobStatus::Aborted {
            // Cancelled before the worker claimed it; nothing to do.
            return Err(ExecutorError::Aborted);
        }

        let workspace_dir = PathBuf::from(&job.workspace_dir);
        let input_files = self
            .store
            .list_files(job_id, Some(FileCategory::Input))
            .await?;
        let ctx = JobContext {
            job_id,
            tenant_id: job.tenant_id.clone(),
            requirement: job.requirement.clone(),
            workspace_dir: workspace_dir.clone(),
            input_files: input_files
                .iter()
                .map(|f| workspace_dir.join(&f.relative_path))
                .collect(),
            selected_skill: job.selected_skill.clone(),
            agent: job.agent.clone(),
            model: job.model.clone(),
            output_contract: job.output_contract.clone(),
        };
        let skill =
            self.registry
                .get(&job.selected_skill)
                .map_err(|e| ExecutorError::Failed {
                    code: codes::INPUT_INVALID,
                    message: e.to_string(),
                })?;

        // 1. queued -> running
        self.set_status_or_abort(job_id, &[JobStatus::Queued], JobStatus::Running)
            .await?;

        // 2. Create the agent session. Transport failures surface as
        //    `agent.unavailable` so the worker pool can retry them.
        let session_id = match self
            .client
            .create_session(&workspace_dir, &format!("job-{job_id}"))
            .await
        {
            Ok(session_id) => session_id,
            Err(err @ AgentError::Transport { .. }) => {
                return Err(ExecutorError::SessionCreateUnavailable {
                    message: trim_message(&err.to_string()),
                });
            }
            Err(err) => {
                return Err(ExecutorError::Failed {
                    code: codes::AGENT_SESSION_CREATE_FAILED,
                    message: trim_message(&err.to_string()),
                });
            }
        };
        self.store.set_session_id(job_id, &session_id).await?;
        self.ensure_not_aborted(job_id, &workspace_dir, Some(&session_id))
            .await?;

        // 3. Prompt from the same plan snapshot written at creation time.
        let plan = self
            .workspace
            .read_execution_plan(&workspace_dir)
            .map_err(ExecutorError::from)?;
        let prompt = skill.build_prompt(&ctx, &plan);
        self.client
            .prompt_async(
                &workspace_dir,
                &session_id,
                &prompt,
                &ctx.agent,
                ctx.model.as_ref(),
            )
            .await
            .map_err(|err| ExecutorError::Failed {
                code: match err {
                    AgentError::Auth { .. } => codes::AGENT_AUTH_FAILED,
                    _ => codes::AGENT_PROMPT_FAILED,
                },
                message: trim_message(&err.to_string()),
            })?;
        self.append_event(
            NewEvent::new(job_id, EventSource::Worker, "opencode.prompt_async.sent")
                .with_message("prompt_async submitted"),
        )
        .await;

        // 4. Converge on session idle.
        self.convergence_loop(job_id, &workspace_dir, &session_id)
            .await?;
        self.ensure_not_aborted(job_id, &workspace_dir, Some(&session_id))
            .await?;

        // 5. Capture the final assistant message; failure is not fatal.
        match self
            .client
            .last_message(&workspace_dir, &session_id, 1)
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                let pretty = serde_json::to_string_pretty(&messages[0])
                    .unwrap_or_else(|_| messages[0].to_string());
                if let Err(e) = self.workspace.write_last_message(&workspace_dir, &pretty) {
                    tracing::warn!(job_id = %job_id, "Could not write last message: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => {
                self.append_event(
                    NewEvent::new(
                        job_id,
                        EventSource::Worker,
                        "opencode.last_message.read.failed",
                    )
                    .with_message(trim_message(&e.to_string())),
                )
                .await;
            }
        }

        // 6. running -> verifying
        self.set_status_or_abort(job_id, &[JobStatus::Running], JobStatus::Verifying)
            .await?;

        // 7. Inputs must hash to their creation-time digests.
        self.verify_inputs_unchanged(&workspace_dir, &input_files)?;

        // 8. Skill contract check over outputs/.
        skill
            .validate_outputs(&ctx)
            .map_err(|e| ExecutorError::Failed {
                code: match e {
                    crate::error::SkillError::OutputsMissing { .. } => codes::OUTPUTS_MISSING,
                    _ => codes::OUTPUTS_CONTRACT_VIOLATED,
                },
                message: e.to_string(),
            })?;

        // 9. verifying -> packaging
        self.set_status_or_abort(job_id, &[JobStatus::Verifying], JobStatus::Packaging)
            .await?;

        // 10. Bundle and index artifacts.
        self.package(job_id, &workspace_dir, &session_id).await?;

        // 11. packaging -> succeeded
        self.set_status_or_abort(job_id, &[JobStatus::Packaging], JobStatus::Succeeded)
            .await?;
        self.append_event(
            NewEvent::new(job_id, EventSource::Worker, "job.succeeded")
                .with_status(JobStatus::Succeeded)
                .with_message("job succeeded"),
        )
        .await;
        tracing::info!(job_id = %job_id, "Job succeeded");
        Ok(())
    }

    /// Dual-path completion detector.
    ///
    /// Consumes bridge events as they arrive and polls status plus
    /// pending permissions every `poll_interval` regardless. The poll is
    /// authoritative; the stream only shortens latency.
    async fn convergence_loop(
        &self,
        job_id: Uuid,
        workspace_dir: &Path,
        session_id: &str,
    ) -> Result<(), ExecutorError> {
        let mut events: Option<mpsc::Receiver<BridgeEvent>> = Some(
            self.bridge
                .subscribe(workspace_dir.to_path_buf(), session_id.to_string()),
        );
        let started = Instant::now();
        let mut wait = ApprovalWait::default();
        // Force an immediate first sweep.
        let mut force_poll = true;
        let mut last_poll = Instant::now();

        loop {
            self.ensure_not_aborted(job_id, workspace_dir, Some(session_id))
                .await?;

            if started.elapsed() >= self.config.soft_timeout {
                let _ = self.client.abort_session(workspace_dir, session_id).await;
                return Err(ExecutorError::Failed {
                    code: codes::JOB_TIMEOUT,
                    message: format!(
                        "soft deadline of {}s exceeded",
                        self.config.soft_timeout.as_secs()
                    ),
                });
            }

            if force_poll || last_poll.elapsed() >= self.config.poll_interval {
                force_poll = false;
                last_poll = Instant::now();
                if self
                    .sweep(job_id, workspace_dir, session_id, &mut wait)
                    .await?
                {
                    return Ok(());
                }
            }

            let until_next_poll = self
                .config
                .poll_interval
                .saturating_sub(last_poll.elapsed());
            let received = match events {
                Some(ref mut rx) => {
                    Some(tokio::time::timeout(until_next_poll, rx.recv()).await)
                }
                None => {
                    tokio::time::sleep(until_next_poll).await;
                    None
                }
            };
            match received {
                Some(Ok(Some(event))) => {
                    self.record_bridge_event(job_id, &event).await;
                    match event {
                        BridgeEvent::PermissionAsked { .. } => {
                            // Answer immediately instead of waiting for
                            // the next poll.
                            self.process_permissions(job_id, workspace_dir, session_id)
                                .await?;
                        }
                        BridgeEvent::SessionUpdated { .. }
                        | BridgeEvent::StreamDisconnected { .. } => {
                            // Status may have changed, or events may have
                            // been missed; resweep now.
                            force_poll = true;
                        }
                        _ => {}
                    }
                }
                Some(Ok(None)) => {
                    // Bridge exhausted its retry budget; polling carries
                    // the job from here.
                    events = None;
                }
                Some(Err(_)) | None => {}
            }
        }
    }

    /// One compensating sweep: permissions, session status, approval
    /// bookkeeping. Returns `true` when the session reported idle.
    async fn sweep(
        &self,
        job_id: Uuid,
        workspace_dir: &Path,
        session_id: &str,
        wait: &mut ApprovalWait,
    ) -> Result<bool, ExecutorError> {
        self.process_permissions(job_id, workspace_dir, session_id)
            .await?;

        let status_map = self.client.session_status(workspace_dir).await?;
        if let Some(state) = status_map.get(session_id) {
            if state.is_idle() {
                self.append_event(
                    NewEvent::new(job_id, EventSource::Opencode, "session.updated")
                        .with_message("session idle")
                        .with_payload(serde_json::json!({ "type": "idle" })),
                )
                .await;
                if wait.waiting {
                    self.set_status_or_abort(
                        job_id,
                        &[JobStatus::WaitingApproval],
                        JobStatus::Running,
                    )
                    .await?;
                }
                return Ok(true);
            }
            if state.is_retry() {
                self.append_event(
                    NewEvent::new(job_id, EventSource::Opencode, "session.retry")
                        .with_message(state.message.clone().unwrap_or_default())
                        .with_payload(serde_json::json!({ "type": "retry" })),
                )
                .await;
            }
        }

        let pending = self.pending_for_session(workspace_dir, session_id).await?;
        if pending {
            match wait.since {
                None => {
                    wait.since = Some(Instant::now());
                    wait.waiting = true;
                    self.set_status_or_abort(
                        job_id,
                        &[JobStatus::Running],
                        JobStatus::WaitingApproval,
                    )
                    .await?;
                }
                Some(since) if since.elapsed() > self.config.permission_wait => {
                    return Err(ExecutorError::Failed {
                        code: codes::PERMISSION_TIMEOUT,
                        message: format!(
                            "permissions pending for more than {}s",
                            self.config.permission_wait.as_secs()
                        ),
                    });
                }
                Some(_) => {}
            }
        } else {
            wait.since = None;
            if wait.waiting {
                wait.waiting = false;
                self.set_status_or_abort(job_id, &[JobStatus::WaitingApproval], JobStatus::Running)
                    .await?;
            }
        }
        Ok(false)
    }

    /// Decide and reply to every pending permission of this session.
    async fn process_permissions(
        &self,
        job_id: Uuid,
        workspace_dir: &Path,
        session_id: &str,
    ) -> Result<(), ExecutorError> {
        let requests = self.client.list_permissions(workspace_dir).await?;
        for request in requests {
            if !belongs_to_session(&request, session_id) || request.id.is_empty() {
                continue;
            }
            let decision = self.policy.decide(&request, workspace_dir);
            self.client
                .reply_permission(
                    workspace_dir,
                    &request.id,
                    decision.reply,
                    decision.message.as_deref(),
                )
                .await?;
            self.store
                .add_permission_action(job_id, &request.id, decision.reply.as_str(), POLICY_ACTOR)
                .await?;
            self.append_event(
                NewEvent::new(job_id, EventSource::Worker, "permission.replied")
                    .with_message(format!("{}:{}", request.id, decision.reply))
                    .with_payload(serde_json::json!({
                        "request_id": request.id,
                        "reply": decision.reply.as_str(),
                        "tool": request.permission,
                    })),
            )
            .await;
            tracing::info!(
                job_id = %job_id,
                request_id = %request.id,
                reply = %decision.reply,
                "Permission replied"
            );
        }
        Ok(())
    }

    async fn pending_for_session(
        &self,
        workspace_dir: &Path,
        session_id: &str,
    ) -> Result<bool, ExecutorError> {
        let requests = self.client.list_permissions(workspace_dir).await?;
        Ok(requests
            .iter()
            .any(|request| belongs_to_session(request, session_id)))
    }

    /// Persist the filtered stream frames that matter for the audit trail.
    async fn record_bridge_event(&self, job_id: Uuid, event: &BridgeEvent) {
        let (source, message, payload) = match event {
            BridgeEvent::MessagePartUpdated { .. } => return,
            BridgeEvent::StreamDisconnected { reason } => {
                (EventSource::Worker, reason.clone(), None)
            }
            BridgeEvent::SessionUpdated { payload }
            | BridgeEvent::SessionRetry { payload }
            | BridgeEvent::PermissionAsked { payload } => (
                EventSource::Opencode,
                payload
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                Some(payload.clone()),
            ),
        };
        let mut record = NewEvent::new(job_id, source, event.event_type()).with_message(message);
        if let Some(payload) = payload {
            record = record.with_payload(payload);
        }
        self.append_event(record).await;
    }

    /// A re-hash of every input must match its creation-time digest.
    fn verify_inputs_unchanged(
        &self,
        workspace_dir: &Path,
        input_files: &[crate::store::JobFile],
    ) -> Result<(), ExecutorError> {
        for file in input_files {
            let path = workspace_dir.join(&file.relative_path);
            if !path.exists() {
                return Err(ExecutorError::Failed {
                    code: codes::INPUTS_TAMPERED,
                    message: format!("input file missing: {}", file.relative_path),
                });
            }
            let current = sha256_file(&path).map_err(ExecutorError::from)?;
            if current != file.sha256 {
                return Err(ExecutorError::Failed {
                    code: codes::INPUTS_TAMPERED,
                    message: format!("input file modified unexpectedly: {}", file.relative_path),
                });
            }
        }
        Ok(())
    }

    /// Build the bundle and index outputs, bundle, and log files.
    async fn package(
        &self,
        job_id: Uuid,
        workspace_dir: &Path,
        session_id: &str,
    ) -> Result<(), ExecutorError> {
        let (bundle_path, _manifest) = self
            .bundles
            .build_bundle(workspace_dir, job_id, Some(session_id))
            .map_err(|e| ExecutorError::Failed {
                code: codes::BUNDLE_FAILED,
                message: e.to_string(),
            })?;
        self.store
            .set_result_bundle(job_id, &bundle_path.display().to_string())
            .await?;

        for entry in self
            .bundles
            .collect_output_entries(workspace_dir)
            .map_err(ExecutorError::from)?
        {
            self.store
                .upsert_file(
                    job_id,
                    FileCategory::Output,
                    &entry.relative_path,
                    None,
                    entry.size_bytes,
                    &entry.sha256,
                )
                .await?;
        }

        let bundle_size = std::fs::metadata(&bundle_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let bundle_sha = sha256_file(&bundle_path).map_err(ExecutorError::from)?;
        self.store
            .upsert_file(
                job_id,
                FileCategory::Bundle,
                BUNDLE_FILE,
                Some("application/zip"),
                bundle_size,
                &bundle_sha,
            )
            .await?;

        let log_path = workspace_dir.join(LAST_MESSAGE_FILE);
        if log_path.is_file() {
            let size = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
            let sha = sha256_file(&log_path).map_err(ExecutorError::from)?;
            self.store
                .upsert_file(
                    job_id,
                    FileCategory::Log,
                    LAST_MESSAGE_FILE,
                    Some("text/markdown"),
                    size,
                    &sha,
                )
                .await?;
        }
        Ok(())
    }

    /// Conditional transition; an abort observed here raises `Aborted`,
    /// any other refusal is an illegal transition.
    async fn set_status_or_abort(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<(), ExecutorError> {
        match self.store.set_status(job_id, from, to, None).await? {
            SetStatusOutcome::Applied => Ok(()),
            SetStatusOutcome::Refused {
                current: JobStatus::Aborted,
            } => Err(ExecutorError::Aborted),
            SetStatusOutcome::Refused { current } => Err(ExecutorError::IllegalTransition {
                job_id,
                from: current.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// Read the current status; if `aborted`, best-effort abort the agent
    /// session and raise.
    async fn ensure_not_aborted(
        &self,
        job_id: Uuid,
        workspace_dir: &Path,
        session_id: Option<&str>,
    ) -> Result<(), ExecutorError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(StoreError::JobNotFound { job_id })?;
        if job.status != JobStatus::Aborted {
            return Ok(());
        }
        if let Some(session_id) = session_id {
            if let Err(e) = self.client.abort_session(workspace_dir, session_id).await {
                tracing::debug!(job_id = %job_id, "Session abort after cancellation failed: {e}");
            }
        }
        Err(ExecutorError::Aborted)
    }

    async fn append_event(&self, event: NewEvent) {
        if let Err(e) = self.store.append_event(event).await {
            tracing::warn!("Failed to append job event: {e}");
        }
    }
}

fn belongs_to_session(request: &PermissionRequest, session_id: &str) -> bool {
    match request.session_id.as_deref() {
        Some(bound) => bound == session_id,
        // Requests without a session binding are answered too; leaving
        // them pending would stall the whole directory.
        None => true,
    }
}

/// Approval-wait bookkeeping for the convergence loop.
#[derive(Default)]
struct ApprovalWait {
    since: Option<Instant>,
    waiting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_binding_matches_or_is_open() {
        let mut request = PermissionRequest {
            id: "p1".to_string(),
            session_id: Some("ses-1".to_string()),
            permission: None,
            patterns: Vec::new(),
            metadata: serde_json::Value::Null,
        };
        assert!(belongs_to_session(&request, "ses-1"));
        assert!(!belongs_to_session(&request, "ses-2"));

        request.session_id = None;
        assert!(belongs_to_session(&request, "ses-1"));
    }
}
