//! Change detection by content hash.
//!
//! The detector walks a snapshot, hashes every file that matters with a
//! pool of blocking workers, and diffs the result against the previous
//! deploy.lock to decide which build engines have work to do.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, instrument};

use versa_core::{DeployError, DeployResult};
use versa_state::DeployLock;

/// Directories that are never descended into, regardless of configuration.
const PRUNED_DIRS: &[&str] = &[".git", "node_modules", "vendor"];

/// Extensions that always participate in hashing, even under an ignored prefix.
const CRITICAL_EXTENSIONS: &[&str] = &[
    "php", "twig", "go", "mod", "sum", "js", "ts", "vue", "jsx", "tsx", "css", "scss", "sass",
    "less",
];

/// Dependency manifests that always participate in hashing.
const CRITICAL_BASENAMES: &[&str] = &[
    "composer.json",
    "composer.lock",
    "package.json",
    "package-lock.json",
    "pnpm-lock.yaml",
];

/// Extensions classified into the front-end bucket.
const FRONTEND_EXTENSIONS: &[&str] = &["js", "ts", "vue", "jsx", "tsx", "css", "scss", "less"];

/// Everything that differs between the snapshot and the previous deploy.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Changed `.php` sources.
    pub php_files: Vec<String>,
    /// Changed `.twig` templates.
    pub twig_files: Vec<String>,
    /// Changed `.go` sources.
    pub go_files: Vec<String>,
    /// Changed front-end sources.
    pub frontend_files: Vec<String>,
    /// Changed files outside every other bucket.
    pub other_files: Vec<String>,

    /// composer.json differs from the previous deploy.
    pub composer_changed: bool,
    /// package.json differs from the previous deploy.
    pub package_changed: bool,
    /// go.mod differs from the previous deploy.
    pub go_mod_changed: bool,
    /// A configured route file changed.
    pub routes_changed: bool,

    /// The complete fingerprint that becomes the next deploy.lock.
    pub all_file_hashes: BTreeMap<String, String>,
    /// Current composer.json hash, empty when the file is absent.
    pub composer_hash: String,
    /// Current package.json hash, empty when the file is absent.
    pub package_hash: String,
    /// Current go.mod hash, empty when the file is absent.
    pub go_mod_hash: String,

    /// Bypass the no-changes gate without fabricating file lists.
    pub force: bool,
}

impl ChangeSet {
    /// True when any bucket is non-empty or any manifest flag is set.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.php_files.is_empty()
            || !self.twig_files.is_empty()
            || !self.go_files.is_empty()
            || !self.frontend_files.is_empty()
            || !self.other_files.is_empty()
            || self.composer_changed
            || self.package_changed
            || self.go_mod_changed
    }

    /// Total number of changed files across all buckets.
    #[must_use]
    pub fn changed_file_count(&self) -> usize {
        self.php_files.len()
            + self.twig_files.len()
            + self.go_files.len()
            + self.frontend_files.len()
            + self.other_files.len()
    }
}

/// Change detector for one snapshot.
pub struct Detector {
    snapshot_root: PathBuf,
    ignored_paths: Vec<String>,
    route_files: Vec<String>,
    php_root: String,
    go_root: String,
    frontend_root: String,
    previous: Option<DeployLock>,
}

struct FileJob {
    abs_path: PathBuf,
    rel_path: String,
    ext: String,
}

impl Detector {
    /// Create a detector.
    ///
    /// `previous` is the last deploy.lock; `None` means first deploy and
    /// classifies every file as changed.
    #[must_use]
    pub fn new(
        snapshot_root: impl Into<PathBuf>,
        ignored_paths: Vec<String>,
        route_files: Vec<String>,
        php_root: impl Into<String>,
        go_root: impl Into<String>,
        frontend_root: impl Into<String>,
        previous: Option<DeployLock>,
    ) -> Self {
        Self {
            snapshot_root: snapshot_root.into(),
            ignored_paths,
            route_files,
            php_root: php_root.into(),
            go_root: go_root.into(),
            frontend_root: frontend_root.into(),
            previous,
        }
    }

    /// Walk, hash and classify the snapshot.
    #[instrument(skip(self), fields(root = %self.snapshot_root.display()))]
    pub async fn detect(&self) -> DeployResult<ChangeSet> {
        let jobs = self.collect_files()?;
        debug!(files = jobs.len(), "collected files for hashing");

        let mut cs = ChangeSet::default();

        let workers = worker_count(jobs.len());
        let queue = Arc::new(Mutex::new(jobs.into_iter().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(FileJob, std::io::Result<String>)>();

        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            task::spawn_blocking(move || loop {
                let job = match queue.lock() {
                    Ok(mut q) => q.pop_front(),
                    Err(_) => return,
                };
                let Some(job) = job else { return };
                let result = hash_file(&job.abs_path);
                if tx.send((job, result)).is_err() {
                    return;
                }
            });
        }
        drop(tx);

        while let Some((job, result)) = rx.recv().await {
            let hash = result.map_err(|source| DeployError::HashFailed {
                path: job.rel_path.clone(),
                source,
            })?;

            cs.all_file_hashes.insert(job.rel_path.clone(), hash.clone());

            if self.is_changed(&job.rel_path, &hash) {
                self.classify(&mut cs, job.rel_path, &job.ext);
            }
        }

        // Buckets filled in channel arrival order; make them deterministic.
        for bucket in [
            &mut cs.php_files,
            &mut cs.twig_files,
            &mut cs.go_files,
            &mut cs.frontend_files,
            &mut cs.other_files,
        ] {
            bucket.sort_unstable();
        }

        self.manifest_flags(&mut cs);

        Ok(cs)
    }

    /// Walk the snapshot and collect everything that needs a hash.
    fn collect_files(&self) -> DeployResult<Vec<FileJob>> {
        let mut jobs = Vec::new();

        let walker = walkdir::WalkDir::new(&self.snapshot_root)
            .into_iter()
            .filter_entry(|e| !is_pruned_dir(e));

        for entry in walker {
            let entry = entry.map_err(|e| {
                DeployError::SnapshotFailed(format!("failed to walk snapshot: {e}"))
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let rel_path = entry
                .path()
                .strip_prefix(&self.snapshot_root)
                .map_err(|e| DeployError::Internal(format!("walk escaped snapshot root: {e}")))?
                .to_string_lossy()
                .replace('\\', "/");

            let ext = extension_of(&rel_path);

            // Skip only when the path sits under an ignored prefix AND its
            // type cannot trigger a rebuild. A critical file inside an
            // ignored directory still participates.
            if self.is_ignored(&rel_path) && !is_critical(&rel_path, &ext) {
                continue;
            }

            jobs.push(FileJob {
                abs_path: entry.into_path(),
                rel_path,
                ext,
            });
        }

        Ok(jobs)
    }

    fn is_ignored(&self, rel_path: &str) -> bool {
        self.ignored_paths
            .iter()
            .any(|prefix| rel_path == prefix || rel_path.starts_with(prefix.as_str()))
    }

    fn is_changed(&self, rel_path: &str, hash: &str) -> bool {
        match &self.previous {
            None => true,
            Some(lock) => match lock.file_hash(rel_path) {
                None => true,
                Some(previous) => previous != hash,
            },
        }
    }

    fn classify(&self, cs: &mut ChangeSet, rel_path: String, ext: &str) {
        if self.route_files.iter().any(|rf| rf == &rel_path) {
            cs.routes_changed = true;
        }

        match ext {
            "php" => cs.php_files.push(rel_path),
            "twig" => cs.twig_files.push(rel_path),
            "go" => cs.go_files.push(rel_path),
            _ if FRONTEND_EXTENSIONS.contains(&ext) => cs.frontend_files.push(rel_path),
            _ => cs.other_files.push(rel_path),
        }
    }

    /// Compare the three dependency manifests against the previous lock.
    fn manifest_flags(&self, cs: &mut ChangeSet) {
        let composer_path = manifest_path(&self.php_root, "composer.json");
        cs.composer_hash = cs
            .all_file_hashes
            .get(&composer_path)
            .cloned()
            .unwrap_or_default();
        cs.composer_changed = manifest_changed(
            &cs.composer_hash,
            self.previous.as_ref().map(|l| l.last_deploy.composer_hash.as_str()),
        );

        let package_path = manifest_path(&self.frontend_root, "package.json");
        cs.package_hash = cs
            .all_file_hashes
            .get(&package_path)
            .cloned()
            .unwrap_or_default();
        cs.package_changed = manifest_changed(
            &cs.package_hash,
            self.previous
                .as_ref()
                .map(|l| l.last_deploy.package_json_hash.as_str()),
        );

        let go_mod_path = manifest_path(&self.go_root, "go.mod");
        cs.go_mod_hash = cs
            .all_file_hashes
            .get(&go_mod_path)
            .cloned()
            .unwrap_or_default();
        cs.go_mod_changed = manifest_changed(
            &cs.go_mod_hash,
            self.previous.as_ref().map(|l| l.last_deploy.go_mod_hash.as_str()),
        );
    }
}

/// A manifest counts as changed when it exists and the previous deploy
/// either did not exist or recorded a different hash.
fn manifest_changed(current: &str, previous: Option<&str>) -> bool {
    if current.is_empty() {
        return false;
    }
    match previous {
        None => true,
        Some(prev) => current != prev,
    }
}

/// Relative manifest location for a build root, normalised to POSIX form.
fn manifest_path(root: &str, name: &str) -> String {
    let joined = if root.is_empty() || root == "." {
        name.to_owned()
    } else {
        format!("{}/{name}", root.trim_end_matches('/'))
    };
    joined.strip_prefix("./").unwrap_or(&joined).to_owned()
}

fn is_pruned_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| PRUNED_DIRS.contains(&name))
        && entry.depth() > 0
}

fn extension_of(rel_path: &str) -> String {
    Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn is_critical(rel_path: &str, ext: &str) -> bool {
    if CRITICAL_EXTENSIONS.contains(&ext) {
        return true;
    }
    Path::new(rel_path)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|base| CRITICAL_BASENAMES.contains(&base))
}

/// Pool size: twice the logical core count, bounded by the queue length,
/// never below one.
fn worker_count(jobs: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (cores * 2).min(jobs).max(1)
}

/// `"sha256:" + hex(digest)` of the file contents, read sequentially.
fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn detector(root: &Path, previous: Option<DeployLock>) -> Detector {
        Detector::new(
            root,
            vec!["var/cache".to_owned()],
            vec!["config/routes.php".to_owned()],
            "",
            "backend",
            "assets",
            previous,
        )
    }

    #[tokio::test]
    async fn first_deploy_classifies_everything_as_changed() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "index.php", "<?php echo 1;");
        write(dir.path(), "templates/base.twig", "{% block body %}{% endblock %}");
        write(dir.path(), "backend/main.go", "package main");
        write(dir.path(), "assets/app.ts", "export {}");
        write(dir.path(), "README.md", "# readme");
        write(dir.path(), "composer.json", "{}");

        let cs = detector(dir.path(), None).detect().await.unwrap();

        assert_eq!(cs.php_files, vec!["index.php"]);
        assert_eq!(cs.twig_files, vec!["templates/base.twig"]);
        assert_eq!(cs.go_files, vec!["backend/main.go"]);
        assert_eq!(cs.frontend_files, vec!["assets/app.ts"]);
        assert!(cs.other_files.contains(&"README.md".to_owned()));
        assert!(cs.composer_changed, "composer.json exists on first deploy");
        assert!(!cs.package_changed, "no package.json present");
        assert!(cs.has_changes());
    }

    #[tokio::test]
    async fn unchanged_snapshot_yields_no_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "index.php", "<?php echo 1;");
        write(dir.path(), "composer.json", "{}");

        let first = detector(dir.path(), None).detect().await.unwrap();
        let lock = DeployLock::new(
            "commit",
            "20260101-000000",
            first.all_file_hashes.clone(),
            first.composer_hash.clone(),
            first.package_hash.clone(),
            first.go_mod_hash.clone(),
        );

        let second = detector(dir.path(), Some(lock)).detect().await.unwrap();
        assert!(!second.has_changes());
        assert_eq!(second.changed_file_count(), 0);
        assert_eq!(second.all_file_hashes, first.all_file_hashes);
    }

    #[tokio::test]
    async fn edited_file_lands_in_exactly_one_bucket() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "index.php", "<?php echo 1;");
        write(dir.path(), "app.php", "<?php echo 2;");

        let first = detector(dir.path(), None).detect().await.unwrap();
        let lock = DeployLock::new(
            "commit",
            "20260101-000000",
            first.all_file_hashes,
            "",
            "",
            "",
        );

        write(dir.path(), "app.php", "<?php echo 3;");
        let cs = detector(dir.path(), Some(lock)).detect().await.unwrap();

        assert_eq!(cs.php_files, vec!["app.php"]);
        assert!(cs.twig_files.is_empty());
        assert!(cs.other_files.is_empty());
    }

    #[tokio::test]
    async fn pruned_directories_are_never_walked() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "index.php", "<?php");
        write(dir.path(), "node_modules/lib/index.js", "x");
        write(dir.path(), "vendor/pkg/src.php", "<?php");
        write(dir.path(), "sub/.git/config", "[core]");

        let cs = detector(dir.path(), None).detect().await.unwrap();

        assert!(!cs.all_file_hashes.keys().any(|k| k.contains("node_modules")));
        assert!(!cs.all_file_hashes.keys().any(|k| k.contains("vendor")));
        assert!(!cs.all_file_hashes.keys().any(|k| k.contains(".git")));
        assert_eq!(cs.php_files, vec!["index.php"]);
    }

    #[tokio::test]
    async fn ignored_prefix_skips_only_non_critical_files() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "var/cache/state.bin", "binary");
        write(dir.path(), "var/cache/template.twig", "cached twig");

        let cs = detector(dir.path(), None).detect().await.unwrap();

        assert!(!cs.all_file_hashes.contains_key("var/cache/state.bin"));
        assert!(
            cs.all_file_hashes.contains_key("var/cache/template.twig"),
            "critical extensions are hashed even under ignored prefixes"
        );
        assert_eq!(cs.twig_files, vec!["var/cache/template.twig"]);
    }

    #[tokio::test]
    async fn route_file_change_sets_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "config/routes.php", "<?php return [];");

        let cs = detector(dir.path(), None).detect().await.unwrap();
        assert!(cs.routes_changed);

        let lock = DeployLock::new("c", "r", cs.all_file_hashes.clone(), "", "", "");
        let unchanged = detector(dir.path(), Some(lock)).detect().await.unwrap();
        assert!(!unchanged.routes_changed);
    }

    #[tokio::test]
    async fn manifest_only_change_sets_flag_without_file_buckets() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "backend/go.mod", "module example.com/app\n");
        write(dir.path(), "backend/main.go", "package main");

        let first = detector(dir.path(), None).detect().await.unwrap();
        let lock = DeployLock::new(
            "c",
            "r",
            first.all_file_hashes,
            first.composer_hash,
            first.package_hash,
            first.go_mod_hash,
        );

        write(dir.path(), "backend/go.mod", "module example.com/app\nrequire x v1\n");
        let cs = detector(dir.path(), Some(lock)).detect().await.unwrap();

        assert!(cs.go_mod_changed);
        assert!(cs.go_files.is_empty());
        // go.mod itself classifies into "other" via the .mod extension rule.
        assert_eq!(cs.other_files, vec!["backend/go.mod"]);
        assert!(cs.has_changes());
    }

    #[tokio::test]
    async fn hashes_match_recorded_fingerprint() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "a.php", "alpha");

        let cs = detector(dir.path(), None).detect().await.unwrap();
        let recorded = cs.all_file_hashes.get("a.php").unwrap();
        let direct = hash_file(&dir.path().join("a.php")).unwrap();
        assert_eq!(recorded, &direct);
        assert!(recorded.starts_with("sha256:"));
        assert_eq!(recorded.len(), "sha256:".len() + 64);
    }

    #[test]
    fn worker_count_bounds() {
        assert_eq!(worker_count(0), 1);
        assert_eq!(worker_count(1), 1);
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(worker_count(10_000), (cores * 2).min(10_000));
    }

    #[test]
    fn manifest_path_normalisation() {
        assert_eq!(manifest_path("", "composer.json"), "composer.json");
        assert_eq!(manifest_path(".", "composer.json"), "composer.json");
        assert_eq!(manifest_path("./api", "composer.json"), "api/composer.json");
        assert_eq!(manifest_path("api/", "composer.json"), "api/composer.json");
    }
}
