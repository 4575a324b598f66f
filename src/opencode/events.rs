//! Event bridge: the opencode SSE stream, filtered and normalized.
//!
//! The bridge is advisory. It accelerates convergence by pushing
//! session and permission events to the executor as they happen, but the
//! executor's polling sweep remains the correctness path; a dropped or
//! never-established stream only costs latency.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::config::{ExecutorConfig, OpencodeConfig};

/// Capacity of the bridge-to-executor channel. Overflowing
/// `message.part.updated` frames are coalesced; session and permission
/// frames apply back-pressure instead.
const CHANNEL_CAPACITY: usize = 64;

/// Normalized event vocabulary delivered to the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    SessionUpdated { payload: serde_json::Value },
    SessionRetry { payload: serde_json::Value },
    PermissionAsked { payload: serde_json::Value },
    MessagePartUpdated { payload: serde_json::Value },
    /// The stream dropped; the executor should force a polling sweep.
    StreamDisconnected { reason: String },
}

impl BridgeEvent {
    /// Event type identifier recorded in the audit trail.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionRetry { .. } => "session.retry",
            Self::PermissionAsked { .. } => "permission.asked",
            Self::MessagePartUpdated { .. } => "message.part.updated",
            Self::StreamDisconnected { .. } => "opencode.event.stream.disconnected",
        }
    }
}

/// A raw SSE frame: event name plus parsed data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub event: String,
    pub data: serde_json::Value,
}

/// Incremental SSE frame parser.
///
/// Frames are separated by blank lines; `data:` lines accumulate,
/// `event:` names the frame, and `:` comment lines (keep-alives) are
/// skipped. Chunk boundaries may fall anywhere, so input is buffered
/// until complete lines are available.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every frame completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(frame) = self.push_line(line.trim_end_matches(['\r', '\n'])) {
                frames.push(frame);
            }
        }
        frames
    }

    fn push_line(&mut self, line: &str) -> Option<RawFrame> {
        let line = line.trim();
        if line.is_empty() {
            if self.data_lines.is_empty() {
                self.event_name = None;
                return None;
            }
            let payload = self.data_lines.join("\n");
            let data = serde_json::from_str(&payload)
                .unwrap_or(serde_json::Value::String(payload));
            let frame = RawFrame {
                event: self
                    .event_name
                    .take()
                    .unwrap_or_else(|| "message".to_string()),
                data,
            };
            self.data_lines.clear();
            return Some(frame);
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim().to_string());
        }
        None
    }
}

/// True when the payload mentions the session anywhere in its tree.
pub fn mentions_session(payload: &serde_json::Value, session_id: &str) -> bool {
    match payload {
        serde_json::Value::Object(map) => {
            for key in ["sessionID", "session_id"] {
                if map.get(key).and_then(|v| v.as_str()) == Some(session_id) {
                    return true;
                }
            }
            map.values().any(|v| mentions_session(v, session_id))
        }
        serde_json::Value::Array(items) => {
            items.iter().any(|v| mentions_session(v, session_id))
        }
        _ => false,
    }
}

/// Map a raw frame into the normalized vocabulary; `None` for frames the
/// executor does not care about.
pub fn normalize(frame: &RawFrame) -> Option<BridgeEvent> {
    let payload = frame.data.clone();
    if frame.event.starts_with("permission.") {
        return Some(BridgeEvent::PermissionAsked { payload });
    }
    if frame.event == "message.part.updated" {
        return Some(BridgeEvent::MessagePartUpdated { payload });
    }
    if frame.event.starts_with("session.") {
        if frame.event.contains("retry") {
            return Some(BridgeEvent::SessionRetry { payload });
        }
        return Some(BridgeEvent::SessionUpdated { payload });
    }
    None
}

/// Factory for per-job SSE subscriptions against the opencode server.
pub struct EventBridge {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: Option<String>,
    backoff_floor: Duration,
    backoff_ceiling: Duration,
    max_retries: u32,
}

impl EventBridge {
    pub fn new(
        opencode: &OpencodeConfig,
        executor: &ExecutorConfig,
    ) -> Result<Self, crate::error::AgentError> {
        // No overall timeout on the stream client: the /event connection
        // is expected to stay open for the life of the job.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::error::AgentError::Transport {
                reason: format!("failed to build event stream client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: opencode.base_url.clone(),
            username: opencode.username.clone(),
            password: opencode.password.clone(),
            backoff_floor: executor.sse_backoff_floor,
            backoff_ceiling: executor.sse_backoff_ceiling,
            max_retries: executor.sse_max_retries,
        })
    }

    /// Subscribe to events for one session. The background task runs
    /// until the receiver is dropped or the retry budget is exhausted.
    pub fn subscribe(
        &self,
        directory: PathBuf,
        session_id: String,
    ) -> mpsc::Receiver<BridgeEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let username = self.username.clone();
        let password = self.password.clone();
        let backoff_floor = self.backoff_floor;
        let backoff_ceiling = self.backoff_ceiling;
        let max_retries = self.max_retries;

        tokio::spawn(async move {
            let mut retries = 0u32;
            let mut backoff = backoff_floor;
            loop {
                let mut request = http
                    .get(format!("{base_url}/event"))
                    .query(&[("directory", directory.display().to_string())]);
                if let Some(ref pw) = password {
                    request = request.basic_auth(&username, Some(pw));
                }

                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        retries = 0;
                        backoff = backoff_floor;
                        let reason =
                            pump_stream(response, &session_id, &tx).await;
                        if tx.is_closed() {
                            return;
                        }
                        if tx
                            .send(BridgeEvent::StreamDisconnected { reason })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(response) => {
                        let reason = format!("event stream status {}", response.status());
                        if tx
                            .send(BridgeEvent::StreamDisconnected { reason })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        if tx
                            .send(BridgeEvent::StreamDisconnected {
                                reason: err.to_string(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }

                retries += 1;
                if retries > max_retries {
                    tracing::warn!(
                        session_id = %session_id,
                        "Event stream retry budget exhausted, polling takes over"
                    );
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_ceiling);
            }
        });

        rx
    }
}

/// Read one stream until it ends or errors; returns the disconnect reason.
async fn pump_stream(
    response: reqwest::Response,
    session_id: &str,
    tx: &mpsc::Sender<BridgeEvent>,
) -> String {
    let mut parser = SseFrameParser::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return err.to_string(),
        };
        for frame in parser.push_chunk(&chunk) {
            if !mentions_session(&frame.data, session_id) {
                continue;
            }
            let Some(event) = normalize(&frame) else {
                continue;
            };
            match event {
                // Part updates are chatty; coalesce under pressure.
                BridgeEvent::MessagePartUpdated { .. } => {
                    let _ = tx.try_send(event);
                }
                _ => {
                    if tx.send(event).await.is_err() {
                        return "receiver dropped".to_string();
                    }
                }
            }
        }
        if tx.is_closed() {
            return "receiver dropped".to_string();
        }
    }
    "stream ended".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_assembles_frames_across_chunks() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push_chunk(b"event: session.upd").is_empty());
        assert!(parser
            .push_chunk(b"ated\ndata: {\"sessionID\":\"s1\",\"type\":\"idle\"}\n")
            .is_empty());
        let frames = parser.push_chunk(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "session.updated");
        assert_eq!(frames[0].data["sessionID"], "s1");
    }

    #[test]
    fn parser_skips_keepalive_comments() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push_chunk(b": keep-alive\n\n: keep-alive\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn parser_defaults_event_name_to_message() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push_chunk(b"data: {\"x\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn parser_joins_multiline_data() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push_chunk(b"data: line one\ndata: line two\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].data,
            serde_json::Value::String("line one\nline two".to_string())
        );
    }

    #[test]
    fn mentions_session_searches_nested_payloads() {
        let payload = serde_json::json!({
            "properties": {
                "info": { "sessionID": "ses-42" }
            }
        });
        assert!(mentions_session(&payload, "ses-42"));
        assert!(!mentions_session(&payload, "ses-43"));

        let list = serde_json::json!([{ "session_id": "ses-42" }]);
        assert!(mentions_session(&list, "ses-42"));
        assert!(!mentions_session(&serde_json::json!("ses-42"), "ses-42"));
    }

    #[test]
    fn normalize_maps_the_vocabulary() {
        let frame = |event: &str| RawFrame {
            event: event.to_string(),
            data: serde_json::Value::Null,
        };
        assert!(matches!(
            normalize(&frame("session.updated")),
            Some(BridgeEvent::SessionUpdated { .. })
        ));
        assert!(matches!(
            normalize(&frame("session.status.retry")),
            Some(BridgeEvent::SessionRetry { .. })
        ));
        assert!(matches!(
            normalize(&frame("permission.updated")),
            Some(BridgeEvent::PermissionAsked { .. })
        ));
        assert!(matches!(
            normalize(&frame("message.part.updated")),
            Some(BridgeEvent::MessagePartUpdated { .. })
        ));
        assert!(normalize(&frame("installation.updated")).is_none());
    }

    #[test]
    fn event_types_are_stable_identifiers() {
        let event = BridgeEvent::PermissionAsked {
            payload: serde_json::Value::Null,
        };
        assert_eq!(event.event_type(), "permission.asked");
        let event = BridgeEvent::StreamDisconnected {
            reason: "x".to_string(),
        };
        assert_eq!(event.event_type(), "opencode.event.stream.disconnected");
    }
}
