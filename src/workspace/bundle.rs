//! Result bundle construction.
//!
//! The bundle is the job's deliverable: everything under `outputs/`, the
//! request and plan snapshots, the final agent message when present, and
//! a `manifest.json` indexing each entry by path, size, and sha256.
//! Entries are sorted by relative path so the manifest and archive are
//! deterministic for identical content.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::WorkspaceError;
use crate::workspace::{sha256_bytes, sha256_file, LAST_MESSAGE_FILE, PLAN_FILE, REQUEST_FILE};

/// One file destined for the bundle.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Collects outputs, builds the manifest, and writes `bundle/result.zip`.
#[derive(Debug, Clone, Default)]
pub struct BundleBuilder;

impl BundleBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Every file under `outputs/`, sorted by relative path.
    pub fn collect_output_entries(
        &self,
        workspace_dir: &Path,
    ) -> Result<Vec<ArtifactEntry>, WorkspaceError> {
        let outputs_root = workspace_dir.join("outputs");
        if !outputs_root.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        walk_files(&outputs_root, &mut files)?;
        files.sort();

        let mut entries = Vec::with_capacity(files.len());
        for path in files {
            entries.push(entry_for(workspace_dir, &path)?);
        }
        Ok(entries)
    }

    /// Build the manifest object for the given entries.
    pub fn build_manifest(
        &self,
        job_id: Uuid,
        session_id: Option<&str>,
        entries: &[ArtifactEntry],
    ) -> serde_json::Value {
        serde_json::json!({
            "job_id": job_id.to_string(),
            "session_id": session_id,
            "generated_at": Utc::now().to_rfc3339(),
            "entries": entries
                .iter()
                .map(|entry| serde_json::json!({
                    "relative_path": entry.relative_path,
                    "size_bytes": entry.size_bytes,
                    "sha256": entry.sha256,
                }))
                .collect::<Vec<_>>(),
        })
    }

    /// Build `bundle/result.zip` and `bundle/manifest.json`.
    ///
    /// Returns the bundle path and the manifest value. Context files
    /// (`job/request.md`, `job/execution-plan.json`, the last agent
    /// message) are included when they exist so a bundle can be replayed
    /// offline.
    pub fn build_bundle(
        &self,
        workspace_dir: &Path,
        job_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<(PathBuf, serde_json::Value), WorkspaceError> {
        let bundle_dir = workspace_dir.join("bundle");
        std::fs::create_dir_all(&bundle_dir).map_err(|e| WorkspaceError::Io {
            path: bundle_dir.display().to_string(),
            source: e,
        })?;
        let bundle_path = bundle_dir.join("result.zip");

        let mut entries = self.collect_output_entries(workspace_dir)?;
        for relative in [PLAN_FILE, REQUEST_FILE, LAST_MESSAGE_FILE] {
            let path = workspace_dir.join(relative);
            if path.is_file() {
                entries.push(entry_for(workspace_dir, &path)?);
            }
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let manifest = self.build_manifest(job_id, session_id, &entries);
        let manifest_bytes = format!(
            "{}\n",
            serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string())
        )
        .into_bytes();
        let manifest_path = bundle_dir.join("manifest.json");
        std::fs::write(&manifest_path, &manifest_bytes).map_err(|e| WorkspaceError::Io {
            path: manifest_path.display().to_string(),
            source: e,
        })?;

        let file = std::fs::File::create(&bundle_path).map_err(|e| WorkspaceError::Io {
            path: bundle_path.display().to_string(),
            source: e,
        })?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in &entries {
            zip.start_file(entry.relative_path.as_str(), options)
                .map_err(|e| bundle_err(&entry.relative_path, e))?;
            let content =
                std::fs::read(&entry.absolute_path).map_err(|e| WorkspaceError::Io {
                    path: entry.absolute_path.display().to_string(),
                    source: e,
                })?;
            zip.write_all(&content).map_err(|e| WorkspaceError::Bundle {
                reason: format!("{}: {e}", entry.relative_path),
            })?;
        }

        zip.start_file("manifest.json", options)
            .map_err(|e| bundle_err("manifest.json", e))?;
        zip.write_all(&manifest_bytes)
            .map_err(|e| WorkspaceError::Bundle {
                reason: format!("manifest.json: {e}"),
            })?;
        zip.finish().map_err(|e| bundle_err("result.zip", e))?;

        Ok((bundle_path, manifest))
    }

    /// Sha256 of the manifest file on disk, for indexing.
    pub fn manifest_sha256(&self, workspace_dir: &Path) -> Result<String, WorkspaceError> {
        let manifest_path = workspace_dir.join("bundle").join("manifest.json");
        let bytes = std::fs::read(&manifest_path).map_err(|e| WorkspaceError::Io {
            path: manifest_path.display().to_string(),
            source: e,
        })?;
        Ok(sha256_bytes(&bytes))
    }
}

fn bundle_err(path: &str, err: zip::result::ZipError) -> WorkspaceError {
    WorkspaceError::Bundle {
        reason: format!("{path}: {err}"),
    }
}

fn entry_for(workspace_dir: &Path, path: &Path) -> Result<ArtifactEntry, WorkspaceError> {
    let metadata = std::fs::metadata(path).map_err(|e| WorkspaceError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let relative = path
        .strip_prefix(workspace_dir)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| path.display().to_string());
    Ok(ArtifactEntry {
        relative_path: relative,
        absolute_path: path.to_path_buf(),
        size_bytes: metadata.len(),
        sha256: sha256_file(path)?,
    })
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), WorkspaceError> {
    let entries = std::fs::read_dir(dir).map_err(|e| WorkspaceError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| WorkspaceError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}
