//! Remote layout paths and retention planning.
//!
//! All remote paths are plain POSIX strings; the layout under `remote_path`
//! is fixed:
//!
//! ```text
//! remote_path/
//!   releases/<ver>/app/...
//!   releases/<ver>/manifest.json
//!   current -> releases/<ver>/app
//!   shared/<p>/...
//!   deploy.lock
//!   .versa.lock/
//! ```

use versa_remote::posix_join;

/// Name of the distributed lock directory.
pub const LOCK_DIR_NAME: &str = ".versa.lock";

/// Name of the persisted state file.
pub const STATE_FILE_NAME: &str = "deploy.lock";

/// Suffix of a release directory that is still being extracted.
pub const STAGING_SUFFIX: &str = ".staging";

/// Computes every remote path the coordinator touches.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    /// Layout rooted at the environment's `remote_path`.
    #[must_use]
    pub fn new(remote_path: &str) -> Self {
        Self {
            root: remote_path.trim_end_matches('/').to_owned(),
        }
    }

    /// The layout root.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/.versa.lock`
    #[must_use]
    pub fn lock_dir(&self) -> String {
        posix_join(&self.root, LOCK_DIR_NAME)
    }

    /// `<root>/deploy.lock`
    #[must_use]
    pub fn state_file(&self) -> String {
        posix_join(&self.root, STATE_FILE_NAME)
    }

    /// `<root>/releases`
    #[must_use]
    pub fn releases_dir(&self) -> String {
        posix_join(&self.root, "releases")
    }

    /// `<root>/releases/<version>`
    #[must_use]
    pub fn release_dir(&self, version: &str) -> String {
        posix_join(&self.releases_dir(), version)
    }

    /// `<root>/releases/<version>.staging`
    #[must_use]
    pub fn staging_dir(&self, version: &str) -> String {
        format!("{}{STAGING_SUFFIX}", self.release_dir(version))
    }

    /// `<root>/releases/<version>/app`
    #[must_use]
    pub fn release_app_dir(&self, version: &str) -> String {
        posix_join(&self.release_dir(version), "app")
    }

    /// `<root>/current`
    #[must_use]
    pub fn current_link(&self) -> String {
        posix_join(&self.root, "current")
    }

    /// `<root>/shared`
    #[must_use]
    pub fn shared_dir(&self) -> String {
        posix_join(&self.root, "shared")
    }

    /// `<root>/<version>.tar.gz` - the reassembled upload target.
    #[must_use]
    pub fn archive(&self, version: &str) -> String {
        posix_join(&self.root, &format!("{version}.tar.gz"))
    }
}

/// Release name from a `current` symlink target.
///
/// Accepts both `.../releases/<ver>/app` and `.../releases/<ver>`.
#[must_use]
pub fn release_name_from_target(target: &str) -> Option<String> {
    let trimmed = target.trim_end_matches('/');
    let mut segments = trimmed.rsplit('/');
    let last = segments.next()?;
    if last == "app" {
        segments.next().map(str::to_owned)
    } else if last.is_empty() {
        None
    } else {
        Some(last.to_owned())
    }
}

/// Normalise a configured shared/preserved path; `None` rejects escapes.
#[must_use]
pub fn sanitize_rel_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Which releases retention should delete.
///
/// Keeps the `keep` newest releases; when the active release is older than
/// all of them it replaces the oldest kept entry, so the kept count stays
/// `min(len, keep)` and always includes the active release.
#[must_use]
pub fn retention_plan(releases: &[String], active: Option<&str>, keep: usize) -> Vec<String> {
    if keep == 0 || releases.len() <= keep {
        return Vec::new();
    }

    let mut sorted = releases.to_vec();
    versa_state::release_sort(&mut sorted);

    let mut kept: Vec<&str> = sorted.iter().take(keep).map(String::as_str).collect();
    if let Some(active) = active {
        if sorted.iter().any(|r| r == active) && !kept.contains(&active) {
            kept.pop();
            kept.push(active);
        }
    }

    sorted
        .iter()
        .filter(|r| !kept.contains(&r.as_str()))
        .cloned()
        .collect()
}
