//! Per-job workspace management.
//!
//! Every job owns one directory tree under the data root:
//!
//! ```text
//! <data_root>/<job_id>/
//!   job/
//!     request.md           user requirement text
//!     execution-plan.json  skill-built plan snapshot
//!   inputs/                uploaded files, immutable after creation
//!   outputs/               agent-written results, the verification surface
//!   logs/
//!     agent-last-message.md
//!   bundle/
//!     manifest.json
//!     result.zip
//! ```

pub mod bundle;

pub use bundle::{ArtifactEntry, BundleBuilder};

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::error::WorkspaceError;

pub const REQUEST_FILE: &str = "job/request.md";
pub const PLAN_FILE: &str = "job/execution-plan.json";
pub const LAST_MESSAGE_FILE: &str = "logs/agent-last-message.md";
pub const BUNDLE_FILE: &str = "bundle/result.zip";

/// Hex-encoded SHA-256 of an in-memory buffer.
pub fn sha256_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hex-encoded SHA-256 of a file, read in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String, WorkspaceError> {
    let mut file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(|e| io_err(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn io_err(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Metadata of an upload persisted into `inputs/`.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub mime_type: Option<String>,
}

/// Creates workspaces, persists uploads, and writes job metadata files.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    data_root: PathBuf,
    max_upload_bytes: u64,
}

impl WorkspaceManager {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    pub fn workspace_dir(&self, job_id: Uuid) -> PathBuf {
        self.data_root.join(job_id.to_string())
    }

    /// Create the standard directory layout for a job.
    pub fn create_workspace(&self, job_id: Uuid) -> Result<PathBuf, WorkspaceError> {
        let root = self.workspace_dir(job_id);
        for segment in ["job", "inputs", "outputs", "logs", "bundle"] {
            let dir = root.join(segment);
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(root)
    }

    /// Reduce an upload name to a safe basename.
    ///
    /// Path components and control characters are stripped, anything
    /// outside `[A-Za-z0-9._-]` becomes `_`, and a fully-consumed name
    /// falls back to `upload.bin`.
    pub fn sanitize_filename(&self, filename: &str) -> String {
        let base = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let clean: String = base
            .trim()
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let clean = clean.trim_matches('.').to_string();
        if clean.is_empty() {
            "upload.bin".to_string()
        } else {
            clean
        }
    }

    /// Persist one upload into `inputs/`, suffixing on name collisions.
    pub fn store_input_file(
        &self,
        workspace_dir: &Path,
        filename: &str,
        content: &[u8],
        mime_type: Option<&str>,
    ) -> Result<StoredFile, WorkspaceError> {
        if content.is_empty() {
            return Err(WorkspaceError::EmptyUpload {
                filename: filename.to_string(),
            });
        }
        if content.len() as u64 > self.max_upload_bytes {
            return Err(WorkspaceError::UploadTooLarge {
                filename: filename.to_string(),
                limit_bytes: self.max_upload_bytes,
            });
        }

        let safe_name = self.sanitize_filename(filename);
        let inputs_dir = workspace_dir.join("inputs");
        let mut target = inputs_dir.join(&safe_name);
        if target.exists() {
            let stem = target
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload".to_string());
            let suffix = target
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let mut idx = 1;
            loop {
                let candidate = inputs_dir.join(format!("{stem}_{idx}{suffix}"));
                if !candidate.exists() {
                    target = candidate;
                    break;
                }
                idx += 1;
            }
        }

        std::fs::write(&target, content).map_err(|e| io_err(&target, e))?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(safe_name);
        Ok(StoredFile {
            relative_path: format!("inputs/{name}"),
            absolute_path: target,
            size_bytes: content.len() as u64,
            sha256: sha256_bytes(content),
            mime_type: mime_type.map(str::to_string),
        })
    }

    /// Write the user requirement to `job/request.md`.
    pub fn write_request_markdown(
        &self,
        workspace_dir: &Path,
        requirement: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = workspace_dir.join(REQUEST_FILE);
        std::fs::write(&path, format!("{}\n", requirement.trim())).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Write the skill's plan to `job/execution-plan.json`.
    pub fn write_execution_plan(
        &self,
        workspace_dir: &Path,
        plan: &serde_json::Value,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = workspace_dir.join(PLAN_FILE);
        let pretty = serde_json::to_string_pretty(plan).unwrap_or_else(|_| "{}".to_string());
        std::fs::write(&path, format!("{pretty}\n")).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Read back the plan snapshot written at creation time.
    pub fn read_execution_plan(
        &self,
        workspace_dir: &Path,
    ) -> Result<serde_json::Value, WorkspaceError> {
        let path = workspace_dir.join(PLAN_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| WorkspaceError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Write the final assistant message to `logs/agent-last-message.md`.
    pub fn write_last_message(
        &self,
        workspace_dir: &Path,
        content: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = workspace_dir.join(LAST_MESSAGE_FILE);
        std::fs::write(&path, content).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;

    fn manager(root: &Path) -> WorkspaceManager {
        WorkspaceManager::new(&WorkspaceConfig {
            data_root: root.to_path_buf(),
            max_upload_bytes: 1024,
        })
    }

    #[test]
    fn create_workspace_builds_standard_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = manager(tmp.path());
        let root = ws.create_workspace(Uuid::new_v4()).unwrap();
        for segment in ["job", "inputs", "outputs", "logs", "bundle"] {
            assert!(root.join(segment).is_dir(), "missing {segment}/");
        }
    }

    #[test]
    fn sanitize_strips_paths_and_odd_characters() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = manager(tmp.path());
        assert_eq!(ws.sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(ws.sanitize_filename("report final (v2).md"), "report_final__v2_.md");
        assert_eq!(ws.sanitize_filename("data\u{7}\u{8}.csv"), "data.csv");
        assert_eq!(ws.sanitize_filename("///"), "upload.bin");
        assert_eq!(ws.sanitize_filename(""), "upload.bin");
    }

    #[test]
    fn store_input_rejects_empty_and_oversized() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = manager(tmp.path());
        let root = ws.create_workspace(Uuid::new_v4()).unwrap();

        let err = ws.store_input_file(&root, "a.txt", b"", None).unwrap_err();
        assert!(matches!(err, WorkspaceError::EmptyUpload { .. }));

        let big = vec![0u8; 2048];
        let err = ws.store_input_file(&root, "b.bin", &big, None).unwrap_err();
        assert!(matches!(err, WorkspaceError::UploadTooLarge { .. }));
    }

    #[test]
    fn store_input_suffixes_collisions() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = manager(tmp.path());
        let root = ws.create_workspace(Uuid::new_v4()).unwrap();

        let first = ws
            .store_input_file(&root, "data.csv", b"a,b\n1,2\n", Some("text/csv"))
            .unwrap();
        let second = ws
            .store_input_file(&root, "data.csv", b"c,d\n3,4\n", Some("text/csv"))
            .unwrap();
        let third = ws
            .store_input_file(&root, "data.csv", b"e,f\n5,6\n", None)
            .unwrap();

        assert_eq!(first.relative_path, "inputs/data.csv");
        assert_eq!(second.relative_path, "inputs/data_1.csv");
        assert_eq!(third.relative_path, "inputs/data_2.csv");
        assert_ne!(first.sha256, second.sha256);
    }

    #[test]
    fn stored_hash_matches_rehash() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = manager(tmp.path());
        let root = ws.create_workspace(Uuid::new_v4()).unwrap();

        let stored = ws
            .store_input_file(&root, "notes.txt", b"hello world", None)
            .unwrap();
        let rehashed = sha256_file(&stored.absolute_path).unwrap();
        assert_eq!(stored.sha256, rehashed);
        assert_eq!(stored.sha256, sha256_bytes(b"hello world"));
    }

    #[test]
    fn plan_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = manager(tmp.path());
        let root = ws.create_workspace(Uuid::new_v4()).unwrap();

        let plan = serde_json::json!({
            "schema_version": "1.0.0",
            "selected_skill": "general-default",
            "output_contract": { "required_files": ["report.md"] },
        });
        ws.write_execution_plan(&root, &plan).unwrap();
        assert_eq!(ws.read_execution_plan(&root).unwrap(), plan);
    }
}
