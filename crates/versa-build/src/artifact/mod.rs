//! Artifact packaging.
//!
//! Walks the artifact tree in deterministic order and emits a gzipped tar
//! stream through the chunk splitter. The manifest records what this
//! release changed; it is written into the artifact root before packing so
//! it travels inside the archive.

mod chunk;

pub use chunk::{ChunkWriter, DEFAULT_CHUNK_SIZE};

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{info, instrument, warn};

use versa_core::{DeployError, DeployResult};

use crate::engine::BuildReport;

/// The in-artifact manifest.json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Release directory name.
    pub release_version: String,
    /// Full commit identifier.
    pub commit_hash: String,
    /// When the artifact was built, UTC.
    pub build_timestamp: DateTime<Utc>,
    /// Per-engine change counters.
    pub changes_applied: ChangesApplied,
}

/// What the build stage applied, as persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesApplied {
    /// Number of changed PHP files.
    pub php_files_changed: usize,
    /// The Go binary was recompiled.
    pub go_binary_rebuilt: bool,
    /// Number of front-end compile runs.
    pub frontend_files_compiled: usize,
    /// composer install ran.
    pub composer_updated: bool,
    /// npm install ran.
    pub npm_updated: bool,
    /// Changed templates require a cache cleanup.
    pub twig_cache_cleanup: bool,
    /// Route caches must be regenerated.
    pub route_cache_regenerate: bool,
}

impl From<&BuildReport> for ChangesApplied {
    fn from(report: &BuildReport) -> Self {
        Self {
            php_files_changed: report.php_files_changed,
            go_binary_rebuilt: report.go_binary_rebuilt,
            frontend_files_compiled: report.frontend_compiled,
            composer_updated: report.composer_updated,
            npm_updated: report.npm_updated,
            twig_cache_cleanup: report.twig_cache_cleanup,
            route_cache_regenerate: report.route_cache_regenerate,
        }
    }
}

/// Write `manifest.json` into the artifact root.
pub fn write_manifest(
    artifact_dir: &Path,
    release_version: &str,
    commit_hash: &str,
    report: &BuildReport,
) -> DeployResult<Manifest> {
    let manifest = Manifest {
        release_version: release_version.to_owned(),
        commit_hash: commit_hash.to_owned(),
        build_timestamp: Utc::now(),
        changes_applied: ChangesApplied::from(report),
    };

    let data = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| DeployError::Internal(format!("failed to serialize manifest: {e}")))?;
    std::fs::write(artifact_dir.join("manifest.json"), data)?;

    Ok(manifest)
}

/// Total size in bytes of every regular file under `dir`.
pub fn directory_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Pack the artifact tree into gzip chunks named `<base>.001`, `.002`, ….
///
/// Returns the ordered chunk list. The gzip stream is continuous across
/// chunk boundaries.
#[instrument(skip_all, fields(artifact = %artifact_dir.display()))]
pub async fn pack_chunked(
    artifact_dir: &Path,
    archive_base: &Path,
    chunk_size: u64,
) -> DeployResult<Vec<PathBuf>> {
    let artifact_dir = artifact_dir.to_owned();
    let archive_base = archive_base.to_owned();

    let chunks = task::spawn_blocking(move || pack_sync(&artifact_dir, &archive_base, chunk_size))
        .await
        .map_err(|e| DeployError::Internal(format!("pack task failed: {e}")))??;

    info!(chunks = chunks.len(), "artifact packed");
    Ok(chunks)
}

fn pack_sync(
    artifact_dir: &Path,
    archive_base: &Path,
    chunk_size: u64,
) -> DeployResult<Vec<PathBuf>> {
    let writer = ChunkWriter::new(archive_base, chunk_size);
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = walkdir::WalkDir::new(artifact_dir).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable path while packing");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(artifact_dir)
            .map_err(|e| DeployError::PackFailed(format!("walk escaped artifact root: {e}")))?
            .to_owned();

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %rel.display(), error = %e, "skipping entry without metadata");
                continue;
            }
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());

        if entry.path_is_symlink() {
            let target = match std::fs::read_link(entry.path()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %rel.display(), error = %e, "skipping unreadable symlink");
                    continue;
                }
            };
            let target = normalize_link_target(artifact_dir, entry.path(), &target);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_mtime(mtime);
            builder
                .append_link(&mut header, &rel, &target)
                .map_err(|e| DeployError::PackFailed(format!("{}: {e}", rel.display())))?;
        } else if metadata.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o775);
            header.set_mtime(mtime);
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .map_err(|e| DeployError::PackFailed(format!("{}: {e}", rel.display())))?;
        } else if metadata.is_file() {
            let file = match File::open(entry.path()) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %rel.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(0o664);
            header.set_mtime(mtime);
            builder
                .append_data(&mut header, &rel, file)
                .map_err(|e| DeployError::PackFailed(format!("{}: {e}", rel.display())))?;
        } else {
            warn!(path = %rel.display(), "skipping irregular entry");
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| DeployError::PackFailed(format!("failed to finish tar stream: {e}")))?;
    let writer = encoder
        .finish()
        .map_err(|e| DeployError::PackFailed(format!("failed to finish gzip stream: {e}")))?;
    writer
        .finish()
        .map_err(|e| DeployError::PackFailed(format!("failed to close chunks: {e}")))
}

/// Rewrite absolute link targets that resolve inside the artifact to a path
/// relative to the link's own directory, so the payload stays relocatable.
/// Targets outside the artifact are preserved verbatim.
fn normalize_link_target(artifact_root: &Path, link_path: &Path, target: &Path) -> PathBuf {
    if !target.is_absolute() || !target.starts_with(artifact_root) {
        return target.to_owned();
    }
    match link_path.parent() {
        Some(link_dir) => relative_from(link_dir, target),
        None => target.to_owned(),
    }
}

/// Relative path from `base` (a directory) to `target`; both absolute.
fn relative_from(base: &Path, target: &Path) -> PathBuf {
    let base_components: Vec<Component<'_>> = base.components().collect();
    let target_components: Vec<Component<'_>> = target.components().collect();

    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_from_sibling_and_nested_targets() {
        assert_eq!(
            relative_from(Path::new("/a/app"), Path::new("/a/app/vendor")),
            PathBuf::from("vendor")
        );
        assert_eq!(
            relative_from(Path::new("/a/app/sub"), Path::new("/a/app/vendor")),
            PathBuf::from("../vendor")
        );
        assert_eq!(
            relative_from(Path::new("/a/app"), Path::new("/a/app")),
            PathBuf::from(".")
        );
    }

    #[test]
    fn normalize_rewrites_only_in_artifact_targets() {
        let root = Path::new("/tmp/artifact");
        let link = Path::new("/tmp/artifact/app/link");

        assert_eq!(
            normalize_link_target(root, link, Path::new("/tmp/artifact/app/real")),
            PathBuf::from("real")
        );
        assert_eq!(
            normalize_link_target(root, link, Path::new("/etc/ssl/certs")),
            PathBuf::from("/etc/ssl/certs")
        );
        assert_eq!(
            normalize_link_target(root, link, Path::new("../real")),
            PathBuf::from("../real")
        );
    }

    #[test]
    fn manifest_serializes_expected_keys() {
        let report = BuildReport {
            php_files_changed: 3,
            twig_cache_cleanup: true,
            ..BuildReport::default()
        };
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = write_manifest(dir.path(), "20260131-120000", "abc123", &report).unwrap();

        assert_eq!(manifest.changes_applied.php_files_changed, 3);

        let text = std::fs::read_to_string(dir.path().join("manifest.json")).unwrap();
        for key in [
            "release_version",
            "commit_hash",
            "build_timestamp",
            "changes_applied",
            "php_files_changed",
            "go_binary_rebuilt",
            "frontend_files_compiled",
            "composer_updated",
            "npm_updated",
            "twig_cache_cleanup",
            "route_cache_regenerate",
        ] {
            assert!(text.contains(key), "manifest missing key {key}");
        }
        let parsed: Manifest = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn directory_size_counts_only_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 32]).unwrap();
        assert_eq!(directory_size(dir.path()), 42);
    }
}
