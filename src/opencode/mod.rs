//! Client-side integration with the external opencode agent server.
//!
//! The server is a black box reached over HTTP: sessions, async prompts,
//! status snapshots, permission requests, and a server-sent event stream.
//! Every request carries a `directory` query parameter binding it to the
//! job's workspace.
//!
//! ```text
//! ┌──────────────┐   POST /session                ┌────────────────┐
//! │  JobExecutor │──▶POST /session/{id}/prompt_async─▶│    opencode    │
//! │              │   GET  /session/status          │  agent server  │
//! │              │   GET  /permission              │                │
//! │  EventBridge │◀──GET  /event (SSE)─────────────│                │
//! └──────────────┘                                 └────────────────┘
//! ```

pub mod client;
pub mod events;

pub use client::{
    OpencodeClient, PermissionReply, PermissionRequest, SessionState,
};
pub use events::{BridgeEvent, EventBridge};
