//! Foundry - job orchestrator for an external opencode agent server.
//!
//! A user request (requirement text plus uploaded files) becomes one **Job**
//! with its own workspace, state machine, and audit trail. A worker drives
//! the opencode server through session creation, prompting, event streaming,
//! permission handling, and idle detection, then verifies the outputs and
//! packages them into a downloadable bundle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Foundry                             │
//! │                                                         │
//! │  HTTP API (/api/v1)                                     │
//! │    POST /jobs            multipart create               │
//! │    POST /jobs/{id}/start enqueue                        │
//! │    GET  /jobs/{id}/events SSE fan-out                   │
//! │                                                         │
//! │  WorkerPool ──▶ JobExecutor ──▶ OpencodeClient          │
//! │                      │              EventBridge (SSE)   │
//! │                      ▼                                  │
//! │                  JobStore (sqlite)                      │
//! │                  WorkspaceManager / BundleBuilder       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod opencode;
pub mod policy;
pub mod queue;
pub mod service;
pub mod skills;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use error::{AgentError, ExecutorError, StoreError, WorkspaceError};
pub use service::OrchestratorService;
