//! Orchestrator service: the public contract behind the HTTP API.
//!
//! Creates jobs (workspace, uploads, skill routing, plan snapshot),
//! starts them (health guardrail, conditional enqueue), and answers
//! queries. Idempotency is enforced here via the content-addressed
//! requirement hash.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{IdentityConfig, SkillsConfig};
use crate::domain::{EventSource, JobContext, JobStatus, ModelRef};
use crate::error::{SkillError, StoreError, WorkspaceError};
use crate::opencode::OpencodeClient;
use crate::queue::WorkQueue;
use crate::skills::{SkillDescriptor, SkillRegistry, SkillRouter};
use crate::store::{InputFileRecord, Job, JobEvent, JobFile, JobStore, NewEvent, NewJob};
use crate::workspace::WorkspaceManager;

/// An upload held in memory between the HTTP layer and the workspace.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

/// Parameters for creating a job.
#[derive(Debug, Clone, Default)]
pub struct CreateJobRequest {
    pub requirement: String,
    pub files: Vec<UploadedFile>,
    pub skill_code: Option<String>,
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub output_contract: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub tenant_id: Option<String>,
    pub created_by: Option<String>,
}

/// Service-level failures, mapped onto HTTP statuses by the API layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("not found: {reason}")]
    NotFound { reason: String },

    #[error("job cannot be started from status {current}")]
    Conflict { current: JobStatus },

    #[error("job is in terminal status {status}")]
    Terminal { status: JobStatus },

    #[error("agent server unavailable: {reason}")]
    AgentUnavailable { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound { job_id } => Self::NotFound {
                reason: format!("job not found: {job_id}"),
            },
            StoreError::ArtifactNotFound { artifact_id } => Self::NotFound {
                reason: format!("artifact not found: {artifact_id}"),
            },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

impl From<SkillError> for ServiceError {
    fn from(err: SkillError) -> Self {
        Self::InvalidInput {
            reason: err.to_string(),
        }
    }
}

impl From<WorkspaceError> for ServiceError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::EmptyUpload { .. } | WorkspaceError::UploadTooLarge { .. } => {
                Self::InvalidInput {
                    reason: err.to_string(),
                }
            }
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

/// Artifact listing with the bundle-ready flag.
pub struct ArtifactListing {
    pub artifacts: Vec<JobFile>,
    pub bundle_ready: bool,
}

/// The orchestration façade used by the HTTP API.
pub struct OrchestratorService {
    store: Arc<dyn JobStore>,
    workspace: WorkspaceManager,
    registry: Arc<SkillRegistry>,
    router: SkillRouter,
    client: Arc<OpencodeClient>,
    queue: WorkQueue,
    identity: IdentityConfig,
}

impl OrchestratorService {
    pub fn new(
        store: Arc<dyn JobStore>,
        workspace: WorkspaceManager,
        registry: Arc<SkillRegistry>,
        skills_config: &SkillsConfig,
        client: Arc<OpencodeClient>,
        queue: WorkQueue,
        identity: IdentityConfig,
    ) -> Self {
        let router = SkillRouter::new(Arc::clone(&registry), skills_config.fallback_threshold);
        Self {
            store,
            workspace,
            registry,
            router,
            client,
            queue,
            identity,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue_handle(&self) -> &WorkQueue {
        &self.queue
    }

    /// Create a job: workspace, uploads, skill routing, plan, store rows.
    ///
    /// A hit on `(tenant, idempotency_key, requirement_hash)` returns the
    /// existing job without creating a second workspace.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Job, ServiceError> {
        if request.requirement.trim().is_empty() {
            return Err(ServiceError::InvalidInput {
                reason: "requirement is required".to_string(),
            });
        }
        if request.files.is_empty() {
            return Err(ServiceError::InvalidInput {
                reason: "at least one file is required".to_string(),
            });
        }

        let tenant = request
            .tenant_id
            .clone()
            .unwrap_or_else(|| self.identity.default_tenant.clone());
        let actor = request
            .created_by
            .clone()
            .unwrap_or_else(|| self.identity.default_actor.clone());
        let requirement_hash = requirement_hash(&request.requirement, &request.files);

        if let Some(ref key) = request.idempotency_key {
            if let Some(existing) = self
                .store
                .find_by_idempotency(&tenant, key, &requirement_hash)
                .await?
            {
                tracing::info!(
                    job_id = %existing.id,
                    "Idempotent resubmission, returning existing job"
                );
                return Ok(existing);
            }
        }

        let job_id = Uuid::new_v4();
        let workspace_dir = self.workspace.create_workspace(job_id)?;

        let mut stored = Vec::with_capacity(request.files.len());
        for file in &request.files {
            stored.push(self.workspace.store_input_file(
                &workspace_dir,
                &file.filename,
                &file.content,
                file.content_type.as_deref(),
            )?);
        }
        let input_paths: Vec<PathBuf> = stored.iter().map(|f| f.absolute_path.clone()).collect();

        let route = self.router.select(
            &request.requirement,
            &input_paths,
            request.skill_code.as_deref(),
        )?;
        let skill = route.skill;
        let selected_skill = skill.descriptor().code;
        let agent = request
            .agent
            .clone()
            .unwrap_or_else(|| self.identity.default_agent.clone());

        let ctx = JobContext {
            job_id,
            tenant_id: tenant.clone(),
            requirement: request.requirement.clone(),
            workspace_dir: workspace_dir.clone(),
            input_files: input_paths,
            selected_skill: selected_skill.clone(),
            agent: agent.clone(),
            model: request.model.clone(),
            output_contract: request.output_contract.clone(),
        };
        let plan = skill.build_execution_plan(&ctx);
        self.workspace
            .write_request_markdown(&workspace_dir, &request.requirement)?;
        self.workspace.write_execution_plan(&workspace_dir, &plan)?;

        let input_records = stored
            .iter()
            .map(|f| InputFileRecord {
                relative_path: f.relative_path.clone(),
                mime_type: f.mime_type.clone(),
                size_bytes: f.size_bytes,
                sha256: f.sha256.clone(),
            })
            .collect();

        let job = self
            .store
            .create_job(NewJob {
                id: job_id,
                tenant_id: tenant,
                created_by: actor,
                requirement: request.requirement.clone(),
                selected_skill: selected_skill.clone(),
                agent,
                model: request.model.clone(),
                output_contract: plan.get("output_contract").cloned(),
                workspace_dir: workspace_dir.display().to_string(),
                input_files: input_records,
                idempotency_key: request.idempotency_key.clone(),
                requirement_hash,
            })
            .await?;

        if let Some(reason) = route.fallback_reason {
            let mut payload = serde_json::json!({ "selected_skill": selected_skill });
            if let Some((candidate, score)) = route.best_candidate {
                payload["best_candidate"] = serde_json::Value::String(candidate);
                payload["winning_score"] = serde_json::json!(score);
            }
            self.store
                .append_event(
                    NewEvent::new(job.id, EventSource::Api, "skill.router.fallback")
                        .with_message(reason)
                        .with_payload(payload),
                )
                .await?;
        }

        tracing::info!(
            job_id = %job.id,
            selected_skill = %job.selected_skill,
            "Created job"
        );
        Ok(job)
    }

    /// Enqueue a job for execution.
    ///
    /// Requires status `created` or `failed`; probes the agent server
    /// first and refuses without touching state when it is unreachable.
    pub async fn start_job(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        let job = self.require_job(job_id).await?;
        if !matches!(job.status, JobStatus::Created | JobStatus::Failed) {
            return Err(ServiceError::Conflict {
                current: job.status,
            });
        }

        self.client
            .health()
            .await
            .map_err(|e| ServiceError::AgentUnavailable {
                reason: e.to_string(),
            })?;

        let outcome = self
            .store
            .set_status(
                job_id,
                &[JobStatus::Created, JobStatus::Failed],
                JobStatus::Queued,
                None,
            )
            .await?;
        if let crate::store::SetStatusOutcome::Refused { current } = outcome {
            return Err(ServiceError::Conflict { current });
        }

        let ticket = self.queue.enqueue(job_id).map_err(|reason| {
            ServiceError::Internal { reason }
        })?;
        self.store
            .append_event(
                NewEvent::new(job_id, EventSource::Api, "job.enqueued")
                    .with_status(JobStatus::Queued)
                    .with_message(ticket.to_string())
                    .with_payload(serde_json::json!({ "ticket": ticket.to_string() })),
            )
            .await?;

        tracing::info!(job_id = %job_id, ticket = %ticket, "Job enqueued");
        self.require_job(job_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        self.require_job(job_id).await
    }

    /// Write `aborted` and best-effort abort the agent session.
    ///
    /// Replaying an abort is a no-op that returns the same state;
    /// aborting a succeeded job is refused.
    pub async fn abort_job(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        let job = self.require_job(job_id).await?;
        match job.status {
            JobStatus::Aborted => return Ok(job),
            JobStatus::Succeeded => {
                return Err(ServiceError::Terminal {
                    status: JobStatus::Succeeded,
                })
            }
            _ => {}
        }

        let from = [
            JobStatus::Created,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::WaitingApproval,
            JobStatus::Verifying,
            JobStatus::Packaging,
            JobStatus::Failed,
        ];
        match self
            .store
            .set_status(job_id, &from, JobStatus::Aborted, None)
            .await?
        {
            crate::store::SetStatusOutcome::Applied => {}
            crate::store::SetStatusOutcome::Refused { current } => {
                // Lost the race: someone else aborted (fine) or the job
                // finished first.
                return match current {
                    JobStatus::Aborted => self.require_job(job_id).await,
                    status => Err(ServiceError::Terminal { status }),
                };
            }
        }

        self.store
            .append_event(
                NewEvent::new(job_id, EventSource::Api, "job.aborted")
                    .with_status(JobStatus::Aborted)
                    .with_message("job aborted"),
            )
            .await?;

        if let Some(ref session_id) = job.session_id {
            let directory = PathBuf::from(&job.workspace_dir);
            if let Err(e) = self.client.abort_session(&directory, session_id).await {
                tracing::warn!(job_id = %job_id, "Best-effort session abort failed: {e}");
            }
        }

        tracing::info!(job_id = %job_id, "Job aborted");
        self.require_job(job_id).await
    }

    pub async fn list_events(
        &self,
        job_id: Uuid,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<JobEvent>, ServiceError> {
        Ok(self.store.list_events(job_id, after_id, limit).await?)
    }

    /// Only `output` and `bundle` categories are exposed.
    pub async fn list_artifacts(&self, job_id: Uuid) -> Result<ArtifactListing, ServiceError> {
        let job = self.require_job(job_id).await?;
        let artifacts = self
            .store
            .list_files(job_id, None)
            .await?
            .into_iter()
            .filter(|file| file.category.is_downloadable())
            .collect();
        let bundle_ready = job
            .result_bundle_path
            .as_ref()
            .map(|path| std::path::Path::new(path).exists())
            .unwrap_or(false);
        Ok(ArtifactListing {
            artifacts,
            bundle_ready,
        })
    }

    pub async fn bundle_path(&self, job_id: Uuid) -> Result<PathBuf, ServiceError> {
        let job = self.require_job(job_id).await?;
        let path = job
            .result_bundle_path
            .ok_or_else(|| ServiceError::NotFound {
                reason: "bundle not generated yet".to_string(),
            })?;
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(ServiceError::NotFound {
                reason: "bundle missing on disk".to_string(),
            });
        }
        Ok(path)
    }

    /// Resolve a single artifact for download, enforcing category scoping.
    pub async fn artifact_path(
        &self,
        job_id: Uuid,
        artifact_id: i64,
    ) -> Result<(PathBuf, JobFile), ServiceError> {
        let job = self.require_job(job_id).await?;
        let artifact = self
            .store
            .get_file(artifact_id)
            .await?
            .filter(|file| file.job_id == job_id)
            .ok_or_else(|| ServiceError::NotFound {
                reason: "artifact not found".to_string(),
            })?;
        // Inputs and logs stay private; a forbidden category looks the
        // same as a missing artifact from the outside.
        if !artifact.category.is_downloadable() {
            return Err(ServiceError::NotFound {
                reason: "artifact not found".to_string(),
            });
        }
        let path = PathBuf::from(&job.workspace_dir).join(&artifact.relative_path);
        if !path.exists() {
            return Err(ServiceError::NotFound {
                reason: "artifact file missing".to_string(),
            });
        }
        Ok((path, artifact))
    }

    pub fn list_skills(&self, task_type: Option<&str>) -> Vec<SkillDescriptor> {
        let descriptors = self.registry.list_descriptors();
        match task_type {
            Some(task_type) => descriptors
                .into_iter()
                .filter(|d| d.task_type == task_type)
                .collect(),
            None => descriptors,
        }
    }

    /// Skill detail: descriptor plus the contract a sample plan carries.
    pub fn get_skill(&self, code: &str) -> Result<serde_json::Value, ServiceError> {
        let skill = self
            .registry
            .get(code)
            .map_err(|_| ServiceError::NotFound {
                reason: format!("skill not found: {code}"),
            })?;
        let descriptor = skill.descriptor();
        let sample_ctx = JobContext {
            job_id: Uuid::nil(),
            tenant_id: self.identity.default_tenant.clone(),
            requirement: "sample".to_string(),
            workspace_dir: PathBuf::from("/tmp/sample"),
            input_files: Vec::new(),
            selected_skill: descriptor.code.clone(),
            agent: self.identity.default_agent.clone(),
            model: None,
            output_contract: None,
        };
        let plan = skill.build_execution_plan(&sample_ctx);
        let mut detail = serde_json::to_value(&descriptor).map_err(|e| ServiceError::Internal {
            reason: e.to_string(),
        })?;
        detail["sample_output_contract"] = plan
            .get("output_contract")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(detail)
    }

    async fn require_job(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                reason: format!("job not found: {job_id}"),
            })
    }
}

/// Content-addressed hash of a submission: trimmed requirement text plus,
/// for each file in submission order, the filename and the sha256 of its
/// content. Same key with different content yields a different job.
pub fn requirement_hash(requirement: &str, files: &[UploadedFile]) -> String {
    let mut digest = Sha256::new();
    digest.update(requirement.trim().as_bytes());
    for file in files {
        let content_hash = hex::encode(Sha256::digest(&file.content));
        digest.update(file.filename.as_bytes());
        digest.update(content_hash.as_bytes());
    }
    hex::encode(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, content: &[u8]) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            content: content.to_vec(),
            content_type: None,
        }
    }

    #[test]
    fn requirement_hash_is_content_addressed() {
        let base = requirement_hash("analyze this", &[upload("a.csv", b"1,2,3")]);

        // Whitespace-only changes to the requirement do not matter.
        assert_eq!(
            base,
            requirement_hash("  analyze this \n", &[upload("a.csv", b"1,2,3")])
        );

        // One changed byte in the file content changes the hash.
        assert_ne!(
            base,
            requirement_hash("analyze this", &[upload("a.csv", b"1,2,4")])
        );

        // A renamed file changes the hash.
        assert_ne!(
            base,
            requirement_hash("analyze this", &[upload("b.csv", b"1,2,3")])
        );

        // Different requirement text changes the hash.
        assert_ne!(
            base,
            requirement_hash("analyze that", &[upload("a.csv", b"1,2,3")])
        );
    }

    #[test]
    fn requirement_hash_covers_every_file() {
        let one = requirement_hash("r", &[upload("a", b"x")]);
        let two = requirement_hash("r", &[upload("a", b"x"), upload("b", b"y")]);
        assert_ne!(one, two);
    }
}
