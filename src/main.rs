//! Foundry - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use foundry::api::{self, AppState};
use foundry::config::Config;
use foundry::executor::JobExecutor;
use foundry::opencode::{EventBridge, OpencodeClient};
use foundry::queue::{self, WorkQueue, WorkerPool};
use foundry::service::OrchestratorService;
use foundry::skills::SkillRegistry;
use foundry::store::{JobStore, SqliteJobStore};
use foundry::workspace::WorkspaceManager;

#[derive(Parser, Debug)]
#[command(name = "foundry")]
#[command(about = "Job orchestrator for an opencode agent server")]
#[command(version)]
struct Args {
    /// Bind address override (else FOUNDRY_BIND_ADDR / default).
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Worker count override (else FOUNDRY_WORKERS / default).
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("foundry=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.api.bind_addr = bind;
    }
    if let Some(workers) = args.workers {
        config.queue.workers = workers.max(1);
    }

    tracing::info!(
        bind = %config.api.bind_addr,
        data_root = %config.workspace.data_root.display(),
        agent = %config.opencode.base_url,
        workers = config.queue.workers,
        "Starting foundry"
    );

    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&config.database.path)?);
    let workspace = WorkspaceManager::new(&config.workspace);
    let client = Arc::new(OpencodeClient::new(&config.opencode)?);
    let bridge = Arc::new(EventBridge::new(&config.opencode, &config.executor)?);
    let registry = Arc::new(SkillRegistry::with_builtin_skills());

    let (queue, rx) = WorkQueue::new();
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        Arc::clone(&client),
        bridge,
        Arc::clone(&registry),
        workspace.clone(),
        config.executor.clone(),
    ));
    let _pool = WorkerPool::spawn(
        executor,
        Arc::clone(&store),
        queue.clone(),
        config.queue.clone(),
        config.executor.hard_timeout,
        rx,
    );

    // Jobs left in `queued` by a previous process go back on the lane.
    queue::requeue_stranded(&store, &queue).await;

    let service = Arc::new(OrchestratorService::new(
        store,
        workspace,
        registry,
        &config.skills,
        client,
        queue,
        config.identity.clone(),
    ));

    let state = AppState {
        service,
        // Multipart overhead on top of the largest allowed upload.
        max_body_bytes: (config.workspace.max_upload_bytes as usize).saturating_mul(2) + 1024 * 1024,
    };
    api::serve(state, config.api.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("API server failed: {e}"))?;

    Ok(())
}
