//! Source snapshotting.
//!
//! A deployment never builds inside the user's working copy. The snapshotter
//! validates the repository, refuses dirty working trees unless told
//! otherwise, and materialises the committed HEAD tree into a fresh
//! temporary directory that the rest of the pipeline operates on.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::task;
use tracing::{info, instrument, warn};

use versa_core::{DeployError, DeployResult};

/// A detached copy of the committed tree, ready for building.
#[derive(Debug)]
pub struct Snapshot {
    dir: TempDir,
    commit_hash: String,
}

impl Snapshot {
    /// Snapshot the repository at `repo_path`.
    ///
    /// Fails with `not_a_repository` when the path is not version
    /// controlled and with `dirty_working_tree` when uncommitted changes
    /// exist and `skip_dirty_check` is false. The snapshot directory is
    /// removed when the returned value is dropped.
    #[instrument(skip_all, fields(repo = %repo_path.display()))]
    pub async fn create(repo_path: &Path, skip_dirty_check: bool) -> DeployResult<Self> {
        let repo_path = repo_path.to_owned();
        task::spawn_blocking(move || create_sync(&repo_path, skip_dirty_check))
            .await
            .map_err(|e| DeployError::Internal(format!("snapshot task failed: {e}")))?
    }

    /// Root of the materialised tree.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Full identifier of the snapshotted commit.
    #[must_use]
    pub fn commit_hash(&self) -> &str {
        &self.commit_hash
    }
}

fn create_sync(repo_path: &Path, skip_dirty_check: bool) -> DeployResult<Snapshot> {
    let repo =
        gix::open(repo_path).map_err(|_| DeployError::NotARepository(repo_path.to_owned()))?;

    if skip_dirty_check {
        warn!("skipping working tree cleanliness check");
    } else {
        let dirty = repo
            .is_dirty()
            .map_err(|e| DeployError::SnapshotFailed(format!("failed to check status: {e}")))?;
        if dirty {
            return Err(DeployError::DirtyWorkingTree);
        }
    }

    let head = repo
        .head_id()
        .map_err(|e| DeployError::SnapshotFailed(format!("failed to resolve HEAD: {e}")))?
        .detach();

    let commit = repo
        .find_commit(head)
        .map_err(|e| DeployError::SnapshotFailed(format!("failed to read HEAD commit: {e}")))?;
    let tree = commit
        .tree()
        .map_err(|e| DeployError::SnapshotFailed(format!("failed to read HEAD tree: {e}")))?;

    let dir = tempfile::Builder::new()
        .prefix("versa-snapshot-")
        .tempdir()?;

    extract_tree(&repo, &tree, dir.path())?;

    info!(
        path = %dir.path().display(),
        commit = %head,
        "snapshot complete"
    );

    Ok(Snapshot {
        dir,
        commit_hash: head.to_string(),
    })
}

/// Recursively extract a tree to a directory.
fn extract_tree(repo: &gix::Repository, tree: &gix::Tree<'_>, dest: &Path) -> DeployResult<()> {
    for entry in tree.iter() {
        let entry =
            entry.map_err(|e| DeployError::SnapshotFailed(format!("failed to read tree entry: {e}")))?;

        let name = std::str::from_utf8(entry.filename())
            .map_err(|_| DeployError::SnapshotFailed("invalid filename encoding".to_owned()))?;

        if name.contains("..") || name.starts_with('/') || name.contains('\0') {
            return Err(DeployError::SnapshotFailed(format!(
                "refusing to extract suspicious tree entry: {name}"
            )));
        }

        let entry_path = dest.join(name);

        match entry.mode().kind() {
            gix::object::tree::EntryKind::Tree => {
                std::fs::create_dir_all(&entry_path)?;
                let subtree = repo.find_tree(entry.oid()).map_err(|e| {
                    DeployError::SnapshotFailed(format!("failed to find subtree: {e}"))
                })?;
                extract_tree(repo, &subtree, &entry_path)?;
            }
            gix::object::tree::EntryKind::Blob | gix::object::tree::EntryKind::BlobExecutable => {
                let object = repo.find_object(entry.oid()).map_err(|e| {
                    DeployError::SnapshotFailed(format!("failed to find blob: {e}"))
                })?;
                std::fs::write(&entry_path, object.data.as_slice())?;

                #[cfg(unix)]
                if matches!(
                    entry.mode().kind(),
                    gix::object::tree::EntryKind::BlobExecutable
                ) {
                    use std::os::unix::fs::PermissionsExt;
                    let mut perms = std::fs::metadata(&entry_path)?.permissions();
                    perms.set_mode(0o755);
                    std::fs::set_permissions(&entry_path, perms)?;
                }
            }
            gix::object::tree::EntryKind::Link => {
                // The build mirror resolves these by value later.
                #[cfg(unix)]
                {
                    let object = repo.find_object(entry.oid()).map_err(|e| {
                        DeployError::SnapshotFailed(format!("failed to find link blob: {e}"))
                    })?;
                    let target =
                        PathBuf::from(String::from_utf8_lossy(&object.data).into_owned());
                    if let Err(e) = std::os::unix::fs::symlink(&target, &entry_path) {
                        warn!(path = %entry_path.display(), error = %e, "failed to materialise symlink");
                    }
                }
                #[cfg(not(unix))]
                warn!(path = %entry_path.display(), "skipping symlink on non-unix host");
            }
            gix::object::tree::EntryKind::Commit => {
                warn!(path = %entry_path.display(), "skipping submodule");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_repository_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = create_sync(dir.path(), false).unwrap_err();
        assert!(matches!(err, DeployError::NotARepository(_)));
        assert_eq!(err.code(), "NOT_A_REPOSITORY");
    }
}
