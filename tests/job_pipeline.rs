//! End-to-end pipeline tests against a stub opencode server.
//!
//! The stub implements the agent server contract (sessions, async
//! prompts, status, permissions, SSE) with configurable behavior per
//! test: which output files the "agent" writes, whether it raises
//! permission requests, and whether it ever goes idle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::response::sse::{Event as StubSseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Mutex;
use uuid::Uuid;

use foundry::config::{
    ExecutorConfig, IdentityConfig, OpencodeConfig, QueueConfig, SkillsConfig, WorkspaceConfig,
};
use foundry::domain::{FileCategory, JobStatus};
use foundry::executor::JobExecutor;
use foundry::opencode::{EventBridge, OpencodeClient};
use foundry::queue::{WorkQueue, WorkerPool};
use foundry::service::{CreateJobRequest, OrchestratorService, ServiceError, UploadedFile};
use foundry::skills::SkillRegistry;
use foundry::store::{JobStore, SqliteJobStore};
use foundry::workspace::WorkspaceManager;

// ---------------------------------------------------------------------------
// Stub opencode server
// ---------------------------------------------------------------------------

/// Per-test behavior of the stub agent.
#[derive(Clone, Default)]
struct StubBehavior {
    /// Files written under `outputs/` when the prompt arrives.
    outputs: Vec<(&'static str, &'static str)>,
    /// A permission request raised after the prompt; `{path}` patterns
    /// are kept verbatim.
    permission: Option<serde_json::Value>,
    /// Stay busy until the pending permission is replied to.
    idle_after_reply: bool,
    /// Keep the permission pending even after replies (a stuck agent
    /// that re-raises the same request).
    sticky_permissions: bool,
    /// Never report idle (abort and timeout scenarios).
    stay_busy: bool,
    /// Overwrite this input file after the prompt (tamper scenario).
    tamper_input: Option<&'static str>,
}

#[derive(Default)]
struct StubState {
    behavior: StubBehavior,
    /// session id -> (status type, directory)
    sessions: Mutex<HashMap<String, (String, String)>>,
    pending_permissions: Mutex<Vec<serde_json::Value>>,
    replies: Mutex<Vec<(String, String)>>,
    aborted_sessions: Mutex<Vec<String>>,
}

type StubHandle = Arc<StubState>;

async fn stub_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "healthy": true, "version": "stub-1" }))
}

async fn stub_create_session(
    State(stub): State<StubHandle>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let session_id = format!("ses-{}", Uuid::new_v4());
    let directory = params.get("directory").cloned().unwrap_or_default();
    stub.sessions
        .lock()
        .await
        .insert(session_id.clone(), ("busy".to_string(), directory));
    Json(serde_json::json!({ "id": session_id }))
}

async fn stub_prompt(
    State(stub): State<StubHandle>,
    AxumPath(session_id): AxumPath<String>,
) -> Json<serde_json::Value> {
    let directory = {
        let sessions = stub.sessions.lock().await;
        sessions
            .get(&session_id)
            .map(|(_, dir)| dir.clone())
            .unwrap_or_default()
    };
    let workspace = PathBuf::from(&directory);

    for (relative, content) in &stub.behavior.outputs {
        let path = workspace.join("outputs").join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    if let Some(relative) = stub.behavior.tamper_input {
        std::fs::write(workspace.join(relative), b"tampered!").unwrap();
    }

    let mut went_idle = true;
    if let Some(ref template) = stub.behavior.permission {
        let mut request = template.clone();
        request["sessionID"] = serde_json::Value::String(session_id.clone());
        stub.pending_permissions.lock().await.push(request);
        if stub.behavior.idle_after_reply {
            went_idle = false;
        }
    }
    if stub.behavior.stay_busy {
        went_idle = false;
    }
    if went_idle {
        if let Some(entry) = stub.sessions.lock().await.get_mut(&session_id) {
            entry.0 = "idle".to_string();
        }
    }
    Json(serde_json::json!({ "ok": true }))
}

async fn stub_session_status(State(stub): State<StubHandle>) -> Json<serde_json::Value> {
    let sessions = stub.sessions.lock().await;
    let map: serde_json::Map<String, serde_json::Value> = sessions
        .iter()
        .map(|(id, (status, _))| (id.clone(), serde_json::json!({ "type": status })))
        .collect();
    Json(serde_json::Value::Object(map))
}

async fn stub_list_permissions(State(stub): State<StubHandle>) -> Json<serde_json::Value> {
    Json(serde_json::Value::Array(
        stub.pending_permissions.lock().await.clone(),
    ))
}

async fn stub_reply_permission(
    State(stub): State<StubHandle>,
    AxumPath(request_id): AxumPath<String>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let reply = body["reply"].as_str().unwrap_or_default().to_string();
    stub.replies
        .lock()
        .await
        .push((request_id.clone(), reply));

    let mut pending = stub.pending_permissions.lock().await;
    let session_id = pending
        .iter()
        .find(|p| p["id"] == request_id.as_str())
        .and_then(|p| p["sessionID"].as_str().map(str::to_string));
    if !stub.behavior.sticky_permissions {
        pending.retain(|p| p["id"] != request_id.as_str());
    }
    drop(pending);

    if stub.behavior.idle_after_reply && !stub.behavior.stay_busy {
        if let Some(session_id) = session_id {
            if let Some(entry) = stub.sessions.lock().await.get_mut(&session_id) {
                entry.0 = "idle".to_string();
            }
        }
    }
    Json(serde_json::json!({ "ok": true }))
}

async fn stub_abort_session(
    State(stub): State<StubHandle>,
    AxumPath(session_id): AxumPath<String>,
) -> Json<serde_json::Value> {
    stub.aborted_sessions.lock().await.push(session_id);
    Json(serde_json::json!({ "ok": true }))
}

async fn stub_last_message(
    AxumPath(_session_id): AxumPath<String>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!([
        { "role": "assistant", "content": "All requested outputs were written." }
    ]))
}

async fn stub_events(
) -> Sse<impl futures_util::Stream<Item = Result<StubSseEvent, std::convert::Infallible>>> {
    // A silent stream that never closes; the executor's polling sweep
    // carries every test.
    Sse::new(futures_util::stream::pending())
}

async fn start_stub(behavior: StubBehavior) -> (SocketAddr, StubHandle) {
    let stub = Arc::new(StubState {
        behavior,
        ..Default::default()
    });
    let router = Router::new()
        .route("/global/health", get(stub_health))
        .route("/session", post(stub_create_session))
        .route("/session/status", get(stub_session_status))
        .route("/session/{id}/prompt_async", post(stub_prompt))
        .route("/session/{id}/abort", post(stub_abort_session))
        .route("/session/{id}/message", get(stub_last_message))
        .route("/permission", get(stub_list_permissions))
        .route("/permission/{id}/reply", post(stub_reply_permission))
        .route("/event", get(stub_events))
        .with_state(Arc::clone(&stub));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, stub)
}

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

struct Harness {
    service: Arc<OrchestratorService>,
    store: Arc<dyn JobStore>,
    stub: StubHandle,
    data_root: tempfile::TempDir,
    _pool: WorkerPool,
}

fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        poll_interval: Duration::from_millis(50),
        permission_wait: Duration::from_secs(30),
        soft_timeout: Duration::from_secs(10),
        hard_timeout: Duration::from_secs(20),
        sse_backoff_floor: Duration::from_millis(50),
        sse_backoff_ceiling: Duration::from_millis(100),
        sse_max_retries: 2,
    }
}

async fn harness_with(behavior: StubBehavior, executor_config: ExecutorConfig) -> Harness {
    let (addr, stub) = start_stub(behavior).await;
    harness_against(format!("http://{addr}"), stub, executor_config).await
}

async fn harness_against(
    base_url: String,
    stub: StubHandle,
    executor_config: ExecutorConfig,
) -> Harness {
    let data_root = tempfile::tempdir().unwrap();
    let workspace_config = WorkspaceConfig {
        data_root: data_root.path().to_path_buf(),
        max_upload_bytes: 50 * 1024 * 1024,
    };
    let opencode_config = OpencodeConfig {
        base_url,
        username: "opencode".to_string(),
        password: None,
        request_timeout: Duration::from_secs(5),
    };
    let queue_config = QueueConfig {
        workers: 1,
        retry_backoffs: vec![Duration::from_millis(50), Duration::from_millis(50)],
    };

    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    let workspace = WorkspaceManager::new(&workspace_config);
    let client = Arc::new(OpencodeClient::new(&opencode_config).unwrap());
    let bridge = Arc::new(EventBridge::new(&opencode_config, &executor_config).unwrap());
    let registry = Arc::new(SkillRegistry::with_builtin_skills());

    let (queue, rx) = WorkQueue::new();
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        Arc::clone(&client),
        bridge,
        Arc::clone(&registry),
        workspace.clone(),
        executor_config.clone(),
    ));
    let pool = WorkerPool::spawn(
        executor,
        Arc::clone(&store),
        queue.clone(),
        queue_config,
        executor_config.hard_timeout,
        rx,
    );

    let service = Arc::new(OrchestratorService::new(
        Arc::clone(&store),
        workspace,
        registry,
        &SkillsConfig::default(),
        client,
        queue,
        IdentityConfig::default(),
    ));

    Harness {
        service,
        store,
        stub,
        data_root,
        _pool: pool,
    }
}

fn upload(name: &str, content: &[u8], mime: &str) -> UploadedFile {
    UploadedFile {
        filename: name.to_string(),
        content: content.to_vec(),
        content_type: Some(mime.to_string()),
    }
}

fn csv_request(requirement: &str) -> CreateJobRequest {
    CreateJobRequest {
        requirement: requirement.to_string(),
        files: vec![upload(
            "sales.csv",
            b"region,revenue\nnorth,120\nsouth,95\n",
            "text/csv",
        )],
        ..Default::default()
    }
}

async fn wait_for_status(harness: &Harness, job_id: Uuid, expected: JobStatus) -> JobStatus {
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let job = harness.store.get_job(job_id).await.unwrap().unwrap();
        if job.status == expected {
            return job.status;
        }
        if job.status.is_terminal() || std::time::Instant::now() > deadline {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_runs_to_succeeded_bundle() {
    let harness = harness_with(
        StubBehavior {
            outputs: vec![("report.md", "# Sales report\nNorth leads.\n")],
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    assert_eq!(job.selected_skill, "data-analysis");
    assert_eq!(job.status, JobStatus::Created);

    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Succeeded).await;
    assert_eq!(status, JobStatus::Succeeded);

    // Artifacts: at least one output plus the ready bundle.
    let listing = harness.service.list_artifacts(job.id).await.unwrap();
    assert!(listing.bundle_ready);
    assert!(listing
        .artifacts
        .iter()
        .any(|a| a.category == FileCategory::Output && a.relative_path == "outputs/report.md"));
    assert!(listing
        .artifacts
        .iter()
        .any(|a| a.category == FileCategory::Bundle));

    // The bundle carries outputs, context files, and the manifest.
    let bundle_path = harness.service.bundle_path(job.id).await.unwrap();
    let file = std::fs::File::open(&bundle_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    for expected in [
        "manifest.json",
        "outputs/report.md",
        "job/request.md",
        "job/execution-plan.json",
    ] {
        assert!(names.contains(&expected.to_string()), "missing {expected}");
    }

    // Input immutability held through the run.
    let inputs = harness
        .store
        .list_files(job.id, Some(FileCategory::Input))
        .await
        .unwrap();
    let workspace = PathBuf::from(
        &harness
            .store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .workspace_dir,
    );
    for input in inputs {
        let rehashed =
            foundry::workspace::sha256_file(&workspace.join(&input.relative_path)).unwrap();
        assert_eq!(rehashed, input.sha256);
    }

    // The audit trail ends on job.succeeded.
    let events = harness.store.list_events(job.id, 0, 500).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"job.created"));
    assert!(types.contains(&"job.enqueued"));
    assert!(types.contains(&"opencode.prompt_async.sent"));
    assert_eq!(types.last().copied(), Some("job.succeeded"));
}

#[tokio::test]
async fn explicit_skill_override_wins_over_scoring() {
    let harness = harness_with(StubBehavior::default(), fast_executor_config()).await;

    let request = CreateJobRequest {
        requirement: "Make slides about Q3".to_string(),
        files: vec![upload("q3.png", b"pngbytes", "image/png")],
        skill_code: Some("ppt".to_string()),
        ..Default::default()
    };
    let job = harness.service.create_job(request).await.unwrap();
    assert_eq!(job.selected_skill, "ppt");

    // An unknown skill code is rejected outright.
    let request = CreateJobRequest {
        requirement: "anything".to_string(),
        files: vec![upload("a.txt", b"x", "text/plain")],
        skill_code: Some("no-such-skill".to_string()),
        ..Default::default()
    };
    let err = harness.service.create_job(request).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput { .. }));
}

#[tokio::test]
async fn low_confidence_request_falls_back_with_event() {
    let harness = harness_with(StubBehavior::default(), fast_executor_config()).await;

    let request = CreateJobRequest {
        requirement: "hello".to_string(),
        files: vec![upload("note.txt", b"hi", "text/plain")],
        ..Default::default()
    };
    let job = harness.service.create_job(request).await.unwrap();
    assert_eq!(job.selected_skill, "general-default");

    let events = harness.store.list_events(job.id, 0, 100).await.unwrap();
    let fallback = events
        .iter()
        .find(|e| e.event_type == "skill.router.fallback")
        .expect("fallback event missing");
    let score = fallback.payload.as_ref().unwrap()["winning_score"]
        .as_f64()
        .unwrap();
    assert!(score < 0.45, "score {score}");
}

#[tokio::test]
async fn idempotent_resubmit_returns_same_job() {
    let harness = harness_with(StubBehavior::default(), fast_executor_config()).await;

    let mut request = csv_request("Summarize sales.csv into a report");
    request.idempotency_key = Some("K1".to_string());
    let first = harness.service.create_job(request.clone()).await.unwrap();
    let second = harness.service.create_job(request.clone()).await.unwrap();
    assert_eq!(first.id, second.id);

    // Exactly one workspace was created.
    let workspaces = std::fs::read_dir(harness.data_root.path())
        .unwrap()
        .count();
    assert_eq!(workspaces, 1);

    // Same key, one changed byte: a different job.
    request.files = vec![upload(
        "sales.csv",
        b"region,revenue\nnorth,121\nsouth,95\n",
        "text/csv",
    )];
    let third = harness.service.create_job(request).await.unwrap();
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn abort_mid_run_is_absorbing() {
    let harness = harness_with(
        StubBehavior {
            stay_busy: true,
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Running).await;
    assert_eq!(status, JobStatus::Running);

    let aborted = harness.service.abort_job(job.id).await.unwrap();
    assert_eq!(aborted.status, JobStatus::Aborted);

    // Give the executor time to observe the abort and release.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let job_after = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_after.status, JobStatus::Aborted);

    // No event after the abort carries a non-aborted status.
    let events = harness.store.list_events(job.id, 0, 500).await.unwrap();
    let abort_idx = events
        .iter()
        .position(|e| e.event_type == "job.aborted")
        .expect("job.aborted event missing");
    for event in &events[abort_idx..] {
        if let Some(status) = event.status {
            assert_eq!(status, JobStatus::Aborted, "event {}", event.event_type);
        }
    }

    // The agent session received a best-effort abort.
    assert!(!harness.stub.aborted_sessions.lock().await.is_empty());

    // Replaying the abort is a no-op returning the same state.
    let replay = harness.service.abort_job(job.id).await.unwrap();
    assert_eq!(replay.status, JobStatus::Aborted);
}

#[tokio::test]
async fn external_path_permission_is_rejected_and_job_continues() {
    let harness = harness_with(
        StubBehavior {
            outputs: vec![("report.md", "# ok\n")],
            permission: Some(serde_json::json!({
                "id": "perm-ext",
                "permission": "edit",
                "patterns": ["/etc/hosts"],
                "metadata": {},
            })),
            idle_after_reply: true,
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Succeeded).await;
    assert_eq!(status, JobStatus::Succeeded);

    // The policy rejected the request and the audit trail recorded it.
    let replies = harness.stub.replies.lock().await.clone();
    assert!(replies.contains(&("perm-ext".to_string(), "reject".to_string())));

    let actions = harness
        .store
        .list_permission_actions(job.id)
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, "reject");
    assert_eq!(actions[0].request_id, "perm-ext");
    assert_eq!(actions[0].actor, "policy-engine");

    let events = harness.store.list_events(job.id, 0, 500).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "permission.replied"));
}

#[tokio::test]
async fn workspace_write_permission_is_granted_once() {
    let harness = harness_with(
        StubBehavior {
            outputs: vec![("report.md", "# ok\n")],
            permission: Some(serde_json::json!({
                "id": "perm-ws",
                "permission": "write",
                "patterns": ["outputs/report.md"],
                "metadata": {},
            })),
            idle_after_reply: true,
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    assert_eq!(
        wait_for_status(&harness, job.id, JobStatus::Succeeded).await,
        JobStatus::Succeeded
    );

    let actions = harness
        .store
        .list_permission_actions(job.id)
        .await
        .unwrap();
    assert_eq!(actions[0].action, "once");
}

#[tokio::test]
async fn forever_pending_permissions_time_out_the_job() {
    let mut config = fast_executor_config();
    config.permission_wait = Duration::from_millis(300);
    let harness = harness_with(
        StubBehavior {
            permission: Some(serde_json::json!({
                "id": "perm-stuck",
                "permission": "webfetch",
                "patterns": [],
                "metadata": {},
            })),
            sticky_permissions: true,
            stay_busy: true,
            ..Default::default()
        },
        config,
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Failed).await;
    assert_eq!(status, JobStatus::Failed);

    let job = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.error_code.as_deref(), Some("permission.timeout"));
}

#[tokio::test]
async fn soft_deadline_fails_with_timeout_and_aborts_session() {
    let mut config = fast_executor_config();
    config.soft_timeout = Duration::from_millis(400);
    let harness = harness_with(
        StubBehavior {
            stay_busy: true,
            ..Default::default()
        },
        config,
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Failed).await;
    assert_eq!(status, JobStatus::Failed);

    let job = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.error_code.as_deref(), Some("job.timeout"));
    assert!(!harness.stub.aborted_sessions.lock().await.is_empty());
}

#[tokio::test]
async fn tampered_inputs_fail_verification() {
    let harness = harness_with(
        StubBehavior {
            outputs: vec![("report.md", "# ok\n")],
            tamper_input: Some("inputs/sales.csv"),
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Failed).await;
    assert_eq!(status, JobStatus::Failed);

    let job = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.error_code.as_deref(), Some("inputs.tampered"));
}

#[tokio::test]
async fn missing_contract_outputs_fail_verification() {
    // The agent "finishes" without writing the required report.
    let harness = harness_with(StubBehavior::default(), fast_executor_config()).await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    let status = wait_for_status(&harness, job.id, JobStatus::Failed).await;
    assert_eq!(status, JobStatus::Failed);

    let job = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.error_code.as_deref(), Some("outputs.contract.violated"));
}

#[tokio::test]
async fn unreachable_agent_refuses_start_without_state_change() {
    let (_, stub) = start_stub(StubBehavior::default()).await;
    // Point the harness at a port nothing listens on.
    let harness = harness_against(
        "http://127.0.0.1:9".to_string(),
        stub,
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    let err = harness.service.start_job(job.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::AgentUnavailable { .. }));

    let job = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Created);
}

#[tokio::test]
async fn session_create_transport_failure_retries_then_fails() {
    let (_, stub) = start_stub(StubBehavior::default()).await;
    let harness = harness_against(
        "http://127.0.0.1:9".to_string(),
        stub,
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();

    // Bypass the health guardrail; enqueue directly.
    harness
        .store
        .set_status(job.id, &[JobStatus::Created], JobStatus::Queued, None)
        .await
        .unwrap();
    harness.service.queue_handle().enqueue(job.id).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let events = harness.store.list_events(job.id, 0, 500).await.unwrap();
        let retries = events
            .iter()
            .filter(|e| e.event_type == "job.retry.scheduled")
            .count();
        let job_row = harness.store.get_job(job.id).await.unwrap().unwrap();
        if retries == 2 && job_row.status == JobStatus::Failed {
            assert_eq!(job_row.error_code.as_deref(), Some("agent.unavailable"));
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "retries {retries}, status {}",
            job_row.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn failed_job_can_be_restarted() {
    // First run fails on the missing report, then the stub's outputs
    // appear and a restart succeeds.
    let harness = harness_with(
        StubBehavior {
            outputs: vec![],
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    assert_eq!(
        wait_for_status(&harness, job.id, JobStatus::Failed).await,
        JobStatus::Failed
    );

    // Simulate the agent writing outputs on the second attempt.
    let workspace = PathBuf::from(
        &harness
            .store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .workspace_dir,
    );
    std::fs::write(workspace.join("outputs/report.md"), "# second try\n").unwrap();

    harness.service.start_job(job.id).await.unwrap();
    assert_eq!(
        wait_for_status(&harness, job.id, JobStatus::Succeeded).await,
        JobStatus::Succeeded
    );

    // Success cleared the error left by the first attempt.
    let job = harness.store.get_job(job.id).await.unwrap().unwrap();
    assert!(job.error_code.is_none());
}

#[tokio::test]
async fn artifact_scoping_hides_inputs_and_logs() {
    let harness = harness_with(
        StubBehavior {
            outputs: vec![("report.md", "# ok\n")],
            ..Default::default()
        },
        fast_executor_config(),
    )
    .await;

    let job = harness
        .service
        .create_job(csv_request("Summarize sales.csv into a report"))
        .await
        .unwrap();
    harness.service.start_job(job.id).await.unwrap();
    assert_eq!(
        wait_for_status(&harness, job.id, JobStatus::Succeeded).await,
        JobStatus::Succeeded
    );

    let listing = harness.service.list_artifacts(job.id).await.unwrap();
    assert!(listing
        .artifacts
        .iter()
        .all(|a| a.category.is_downloadable()));

    // Downloading an input by id is a 404-equivalent, not a leak.
    let input = harness
        .store
        .list_files(job.id, Some(FileCategory::Input))
        .await
        .unwrap()
        .remove(0);
    let err = harness
        .service
        .artifact_path(job.id, input.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound { .. }));
}
