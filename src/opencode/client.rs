//! Typed HTTP client for the opencode agent server.
//!
//! One pooled `reqwest::Client` shared by every executor; Basic Auth is
//! attached only when a password is configured. Errors are mapped into
//! the [`AgentError`] taxonomy so callers can tell retriable transport
//! failures from fatal ones.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::OpencodeConfig;
use crate::domain::ModelRef;
use crate::error::AgentError;

/// How much of an error response body is carried in the error.
const BODY_EXCERPT_LEN: usize = 512;

/// Snapshot of one session's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(rename = "type", default)]
    pub state_type: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        self.state_type == "idle"
    }

    pub fn is_retry(&self) -> bool {
        self.state_type == "retry"
    }
}

/// A pending permission request raised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", alias = "session_id", default)]
    pub session_id: Option<String>,
    /// Tool kind, e.g. `edit`, `write`, `file`, `bash`.
    #[serde(default)]
    pub permission: Option<String>,
    /// Target patterns; file tools put paths here.
    #[serde(default)]
    pub patterns: Vec<serde_json::Value>,
    /// Tool metadata; `bash` puts the command string here.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PermissionRequest {
    pub fn command(&self) -> Option<&str> {
        self.metadata.get("command").and_then(|v| v.as_str())
    }
}

/// Reply choices for a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

impl PermissionReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }
}

impl std::fmt::Display for PermissionReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health probe result.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub version: Option<String>,
}

/// Synchronous, typed client for the opencode server.
pub struct OpencodeClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: Option<String>,
}

impl OpencodeClient {
    pub fn new(config: &OpencodeConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| AgentError::Transport {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        directory: Option<&Path>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(ref password) = self.password {
            builder = builder.basic_auth(&self.username, Some(password));
        }
        if let Some(dir) = directory {
            builder = builder.query(&[("directory", dir.display().to_string())]);
        }
        builder
    }

    /// Send with a single retry on 5xx responses. Transport failures are
    /// left to the caller's retry policy.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AgentError> {
        let retry = builder.try_clone();
        match (self.send_once(builder).await, retry) {
            (Err(AgentError::Server { .. }), Some(retry)) => self.send_once(retry).await,
            (outcome, _) => outcome,
        }
    }

    async fn send_once(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AgentError> {
        let response = builder.send().await.map_err(|e| AgentError::Transport {
            reason: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let excerpt = body.chars().take(BODY_EXCERPT_LEN).collect::<String>();
        let code = status.as_u16();
        Err(match code {
            401 | 403 => AgentError::Auth {
                status: code,
                body: excerpt,
            },
            404 => AgentError::NotFound {
                status: code,
                body: excerpt,
            },
            400..=499 => AgentError::BadRequest {
                status: code,
                body: excerpt,
            },
            _ => AgentError::Server {
                status: code,
                body: excerpt,
            },
        })
    }

    /// Probe `GET /global/health`.
    pub async fn health(&self) -> Result<HealthStatus, AgentError> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/global/health", None))
            .await?;
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(HealthStatus {
            healthy: true,
            version: payload
                .get("version")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// Create a session bound to the workspace; returns the session id.
    pub async fn create_session(
        &self,
        directory: &Path,
        title: &str,
    ) -> Result<String, AgentError> {
        let response = self
            .send(
                self.request(reqwest::Method::POST, "/session", Some(directory))
                    .json(&serde_json::json!({ "title": title })),
            )
            .await?;
        let payload: serde_json::Value =
            response.json().await.map_err(|e| AgentError::Transport {
                reason: format!("invalid session response: {e}"),
            })?;
        payload
            .get("id")
            .or_else(|| payload.get("sessionID"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(AgentError::MalformedResponse {
                field: "session id".to_string(),
            })
    }

    /// Fire-and-forget prompt; the agent continues in the background.
    pub async fn prompt_async(
        &self,
        directory: &Path,
        session_id: &str,
        prompt: &str,
        agent: &str,
        model: Option<&ModelRef>,
    ) -> Result<(), AgentError> {
        let mut body = serde_json::json!({
            "agent": agent,
            "parts": [{ "type": "text", "text": prompt }],
        });
        if let Some(model) = model {
            body["model"] = serde_json::json!({
                "providerID": model.provider_id,
                "modelID": model.model_id,
            });
        }
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/session/{session_id}/prompt_async"),
                Some(directory),
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    /// Map of session id to state for the workspace.
    pub async fn session_status(
        &self,
        directory: &Path,
    ) -> Result<HashMap<String, SessionState>, AgentError> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/session/status", Some(directory)))
            .await?;
        response.json().await.map_err(|e| AgentError::Transport {
            reason: format!("invalid session status response: {e}"),
        })
    }

    pub async fn abort_session(
        &self,
        directory: &Path,
        session_id: &str,
    ) -> Result<(), AgentError> {
        self.send(self.request(
            reqwest::Method::POST,
            &format!("/session/{session_id}/abort"),
            Some(directory),
        ))
        .await?;
        Ok(())
    }

    /// Pending permission requests for the workspace.
    pub async fn list_permissions(
        &self,
        directory: &Path,
    ) -> Result<Vec<PermissionRequest>, AgentError> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/permission", Some(directory)))
            .await?;
        response.json().await.map_err(|e| AgentError::Transport {
            reason: format!("invalid permission list response: {e}"),
        })
    }

    pub async fn reply_permission(
        &self,
        directory: &Path,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<(), AgentError> {
        let mut body = serde_json::json!({ "reply": reply.as_str() });
        if let Some(message) = message {
            body["message"] = serde_json::Value::String(message.to_string());
        }
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/permission/{request_id}/reply"),
                Some(directory),
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    /// Most recent messages of a session, newest-limited by `limit`.
    pub async fn last_message(
        &self,
        directory: &Path,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<serde_json::Value>, AgentError> {
        let response = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/session/{session_id}/message"),
                    Some(directory),
                )
                .query(&[("limit", limit)]),
            )
            .await?;
        response.json().await.map_err(|e| AgentError::Transport {
            reason: format!("invalid message response: {e}"),
        })
    }

    /// File metadata lookup, used sparingly for sanity checks.
    pub async fn read_file(
        &self,
        directory: &Path,
        path: &str,
    ) -> Result<serde_json::Value, AgentError> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, "/file", Some(directory))
                    .query(&[("path", path)]),
            )
            .await?;
        response.json().await.map_err(|e| AgentError::Transport {
            reason: format!("invalid file response: {e}"),
        })
    }
}
