//! Configuration for foundry.
//!
//! Everything is env-var driven (a local `.env` is loaded via dotenvy
//! early in startup). Each concern resolves into its own typed struct
//! with a `Default` that matches the documented defaults; invalid numeric
//! values fall back to those defaults with a warning.

pub(crate) mod helpers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Top-level configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub workspace: WorkspaceConfig,
    pub opencode: OpencodeConfig,
    pub executor: ExecutorConfig,
    pub queue: QueueConfig,
    pub skills: SkillsConfig,
    pub identity: IdentityConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            api: ApiConfig::resolve()?,
            database: DatabaseConfig::resolve(),
            workspace: WorkspaceConfig::resolve()?,
            opencode: OpencodeConfig::resolve(),
            executor: ExecutorConfig::resolve(),
            queue: QueueConfig::resolve(),
            skills: SkillsConfig::resolve(),
            identity: IdentityConfig::resolve(),
        })
    }
}

/// HTTP API listener configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8642)),
        }
    }
}

impl ApiConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let default = Self::default();
        let bind_addr = match optional_env("FOUNDRY_BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "FOUNDRY_BIND_ADDR".to_string(),
                reason: format!("'{raw}' is not a socket address"),
            })?,
            None => default.bind_addr,
        };
        Ok(Self { bind_addr })
    }
}

/// SQLite database location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./foundry.db"),
        }
    }
}

impl DatabaseConfig {
    fn resolve() -> Self {
        Self {
            path: PathBuf::from(parse_string_env("FOUNDRY_DATABASE_PATH", "./foundry.db")),
        }
    }
}

/// Workspace root and upload limits.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub data_root: PathBuf,
    pub max_upload_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data/foundry-jobs"),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl WorkspaceConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let default = Self::default();
        let configured = PathBuf::from(parse_string_env(
            "FOUNDRY_DATA_ROOT",
            &default.data_root.display().to_string(),
        ));
        let data_root = ensure_writable_root(configured)?;
        Ok(Self {
            data_root,
            max_upload_bytes: parse_optional_env(
                "FOUNDRY_MAX_UPLOAD_BYTES",
                default.max_upload_bytes,
            ),
        })
    }
}

/// Resolve a data root, falling back to a cwd-local directory when the
/// configured one cannot be created (read-only container image, etc.).
fn ensure_writable_root(configured: PathBuf) -> Result<PathBuf, ConfigError> {
    let absolute = if configured.is_absolute() {
        configured
    } else {
        std::env::current_dir()
            .map_err(|e| ConfigError::DataRoot {
                path: configured.display().to_string(),
                reason: e.to_string(),
            })?
            .join(configured)
    };

    match std::fs::create_dir_all(&absolute) {
        Ok(()) => Ok(absolute),
        Err(err) if matches!(err.kind(), std::io::ErrorKind::PermissionDenied) => {
            let fallback = std::env::current_dir()
                .map_err(|e| ConfigError::DataRoot {
                    path: absolute.display().to_string(),
                    reason: e.to_string(),
                })?
                .join("data")
                .join("foundry-jobs");
            std::fs::create_dir_all(&fallback).map_err(|e| ConfigError::DataRoot {
                path: fallback.display().to_string(),
                reason: e.to_string(),
            })?;
            tracing::warn!(
                "Data root {} is not writable, falling back to {}",
                absolute.display(),
                fallback.display()
            );
            Ok(fallback)
        }
        Err(err) => Err(ConfigError::DataRoot {
            path: absolute.display().to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Connection settings for the opencode agent server.
#[derive(Debug, Clone)]
pub struct OpencodeConfig {
    pub base_url: String,
    pub username: String,
    /// Basic auth is only enabled when a password is configured, which
    /// keeps unauthenticated local development servers working.
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl Default for OpencodeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            username: "opencode".to_string(),
            password: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl OpencodeConfig {
    fn resolve() -> Self {
        let default = Self::default();
        Self {
            base_url: parse_string_env("OPENCODE_BASE_URL", &default.base_url)
                .trim_end_matches('/')
                .to_string(),
            username: parse_string_env("OPENCODE_USERNAME", &default.username),
            password: optional_env("OPENCODE_PASSWORD"),
            request_timeout: Duration::from_secs(parse_optional_env(
                "OPENCODE_REQUEST_TIMEOUT_SECS",
                30u64,
            )),
        }
    }
}

/// Executor timing knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Status/permission poll cadence inside the convergence loop.
    pub poll_interval: Duration,
    /// Ceiling on continuously-pending permission requests.
    pub permission_wait: Duration,
    /// Soft job deadline; exceeding it aborts the agent session.
    pub soft_timeout: Duration,
    /// Hard job deadline enforced by the worker pool.
    pub hard_timeout: Duration,
    /// Event stream reconnect backoff floor and ceiling.
    pub sse_backoff_floor: Duration,
    pub sse_backoff_ceiling: Duration,
    /// Reconnect attempts per event-stream connection.
    pub sse_max_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            permission_wait: Duration::from_secs(120),
            soft_timeout: Duration::from_secs(900),
            hard_timeout: Duration::from_secs(1200),
            sse_backoff_floor: Duration::from_secs(1),
            sse_backoff_ceiling: Duration::from_secs(16),
            sse_max_retries: 5,
        }
    }
}

impl ExecutorConfig {
    fn resolve() -> Self {
        let default = Self::default();
        Self {
            poll_interval: Duration::from_secs(parse_optional_env(
                "FOUNDRY_POLL_INTERVAL_SECS",
                default.poll_interval.as_secs(),
            )),
            permission_wait: Duration::from_secs(parse_optional_env(
                "FOUNDRY_PERMISSION_WAIT_SECS",
                default.permission_wait.as_secs(),
            )),
            soft_timeout: Duration::from_secs(parse_optional_env(
                "FOUNDRY_JOB_SOFT_TIMEOUT_SECS",
                default.soft_timeout.as_secs(),
            )),
            hard_timeout: Duration::from_secs(parse_optional_env(
                "FOUNDRY_JOB_HARD_TIMEOUT_SECS",
                default.hard_timeout.as_secs(),
            )),
            ..default
        }
    }
}

/// Worker pool sizing and the session-create retry schedule.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub retry_backoffs: Vec<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry_backoffs: vec![Duration::from_secs(30), Duration::from_secs(120)],
        }
    }
}

impl QueueConfig {
    fn resolve() -> Self {
        let default = Self::default();
        Self {
            workers: parse_optional_env("FOUNDRY_WORKERS", default.workers).max(1),
            retry_backoffs: default.retry_backoffs,
        }
    }
}

/// Skill routing configuration.
#[derive(Debug, Clone)]
pub struct SkillsConfig {
    pub fallback_threshold: f64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            fallback_threshold: 0.45,
        }
    }
}

impl SkillsConfig {
    fn resolve() -> Self {
        Self {
            fallback_threshold: parse_optional_env("FOUNDRY_SKILL_FALLBACK_THRESHOLD", 0.45f64),
        }
    }
}

/// Single-tenant defaults; the schema is multi-tenant ready but no policy
/// is enforced yet.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub default_tenant: String,
    pub default_actor: String,
    pub default_agent: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            default_tenant: "default".to_string(),
            default_actor: "system".to_string(),
            default_agent: "build".to_string(),
        }
    }
}

impl IdentityConfig {
    fn resolve() -> Self {
        let default = Self::default();
        Self {
            default_tenant: parse_string_env("FOUNDRY_DEFAULT_TENANT", &default.default_tenant),
            default_actor: parse_string_env("FOUNDRY_DEFAULT_ACTOR", &default.default_actor),
            default_agent: parse_string_env("FOUNDRY_DEFAULT_AGENT", &default.default_agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let executor = ExecutorConfig::default();
        assert_eq!(executor.poll_interval, Duration::from_secs(2));
        assert_eq!(executor.permission_wait, Duration::from_secs(120));
        assert_eq!(executor.soft_timeout, Duration::from_secs(900));
        assert_eq!(executor.hard_timeout, Duration::from_secs(1200));

        let workspace = WorkspaceConfig::default();
        assert_eq!(workspace.max_upload_bytes, 50 * 1024 * 1024);

        assert_eq!(SkillsConfig::default().fallback_threshold, 0.45);
        assert_eq!(QueueConfig::default().retry_backoffs.len(), 2);
    }

    #[test]
    fn ensure_writable_root_creates_relative_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("nested").join("jobs");
        let resolved = ensure_writable_root(target.clone()).unwrap();
        assert_eq!(resolved, target);
        assert!(target.is_dir());
    }
}
