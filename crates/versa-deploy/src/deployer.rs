//! The release coordinator.
//!
//! Drives one deployment from preflight to retention:
//!
//! ```text
//! PREFLIGHT -> SNAPSHOT -> CONNECT -> LOCKED -> FETCH_STATE -> DETECT
//!   -> (DRY_RUN_EXIT | BUILD) -> PACK -> UPLOAD -> REASSEMBLE -> EXTRACT
//!   -> FINALIZE_DIR -> WIRE_PATHS -> ACTIVATE -> HOOKS -> WRITE_STATE
//!   -> RETENTION -> DONE
//! ```
//!
//! Nothing the remote web server can observe changes before ACTIVATE; the
//! `current` switch is the single atomic step. The distributed lock is
//! released on every exit path, success or failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use versa_build::{ChangeSet, Detector, Orchestrator, Snapshot, DEFAULT_CHUNK_SIZE};
use versa_core::shell::sh_quote;
use versa_core::{DeployError, DeployResult, Environment, HookEntry, ReleaseVersion};
use versa_remote::{posix_join, ProgressFn, RemoteSession, SshSettings};
use versa_state::DeployLock;

use crate::paths::{
    release_name_from_target, retention_plan, sanitize_rel_path, RemoteLayout, STAGING_SUFFIX,
};

/// How many releases retention keeps.
pub const RELEASES_TO_KEEP: usize = 5;

/// Upload concurrency for archive chunks.
const UPLOAD_CONCURRENCY: usize = 4;

/// Caller-controlled switches for one deployment run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Print the classification summary and stop before any side effect.
    pub dry_run: bool,
    /// Allow a missing deploy.lock on the remote.
    pub initial_deploy: bool,
    /// Bypass the no-changes gate.
    pub force: bool,
    /// Skip the working tree cleanliness check.
    pub skip_dirty_check: bool,
}

/// How a deployment run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Nothing changed and force was not set.
    NoChanges,
    /// Dry run: classification printed, no side effects.
    DryRun,
    /// A release went live.
    Deployed {
        /// The activated release version.
        release: String,
    },
}

/// Builds a progress reporter once the total byte count is known.
pub type ProgressFactory = Arc<dyn Fn(u64) -> ProgressFn + Send + Sync>;

/// Coordinates one deployment to one environment.
pub struct Deployer {
    env_name: String,
    env: Arc<Environment>,
    repo_path: PathBuf,
    options: DeployOptions,
    progress: Option<ProgressFactory>,
}

impl Deployer {
    /// Create a coordinator for the named environment.
    #[must_use]
    pub fn new(
        env_name: impl Into<String>,
        env: Environment,
        repo_path: impl Into<PathBuf>,
        options: DeployOptions,
    ) -> Self {
        Self {
            env_name: env_name.into(),
            env: Arc::new(env),
            repo_path: repo_path.into(),
            options,
            progress: None,
        }
    }

    /// Install an upload progress factory (the CLI wires a byte bar here).
    #[must_use]
    pub fn with_progress(mut self, factory: ProgressFactory) -> Self {
        self.progress = Some(factory);
        self
    }

    /// Run the full deployment state machine.
    #[instrument(skip(self), fields(environment = %self.env_name))]
    pub async fn deploy(&self) -> DeployResult<DeployOutcome> {
        info!("starting deployment");

        // PREFLIGHT
        self.validate_local_tools()?;

        // SNAPSHOT
        info!("snapshotting repository");
        let snapshot = Snapshot::create(&self.repo_path, self.options.skip_dirty_check).await?;
        let commit_hash = snapshot.commit_hash().to_owned();
        let short_commit = &commit_hash[..12.min(commit_hash.len())];
        info!(commit = short_commit, "snapshot ready");

        // CONNECT
        info!(host = %self.env.ssh.host, user = %self.env.ssh.user, "connecting");
        let session = RemoteSession::connect(SshSettings::from_config(&self.env.ssh)).await?;

        // LOCKED
        let layout = RemoteLayout::new(&self.env.remote_path);
        info!("acquiring deployment lock");
        session.acquire_lock(&layout.lock_dir()).await?;

        // The lock must be released on every non-panic exit path.
        let result = self
            .run_locked(&session, &layout, &snapshot, &commit_hash)
            .await;

        info!("releasing deployment lock");
        if let Err(e) = session.release_lock(&layout.lock_dir()).await {
            warn!(error = %e, "failed to release deployment lock");
        }

        result
    }

    async fn run_locked(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
        snapshot: &Snapshot,
        commit_hash: &str,
    ) -> DeployResult<DeployOutcome> {
        // FETCH_STATE
        let previous_lock = self.fetch_state(session, layout).await?;

        // DETECT
        info!("calculating changes");
        let detector = Detector::new(
            snapshot.path(),
            self.env.ignored_paths.clone(),
            self.env.route_files.clone(),
            self.env.builds.php.project_root.clone(),
            self.env.builds.go.project_root.clone(),
            self.env.builds.frontend.project_root.clone(),
            previous_lock.clone(),
        );
        let mut changes = detector.detect().await?;
        changes.force = self.options.force;

        if !changes.has_changes() && !changes.force {
            info!("no changes detected - skipping deployment");
            return Ok(DeployOutcome::NoChanges);
        }
        if changes.force {
            info!("force redeploy requested - bypassing change detection");
        }

        info!(
            php = changes.php_files.len(),
            twig = changes.twig_files.len(),
            go = changes.go_files.len(),
            frontend = changes.frontend_files.len(),
            other = changes.other_files.len(),
            composer = changes.composer_changed,
            package = changes.package_changed,
            go_mod = changes.go_mod_changed,
            routes = changes.routes_changed,
            "changes detected"
        );

        // DRY_RUN_EXIT
        if self.options.dry_run {
            info!("dry run - no side effects performed");
            return Ok(DeployOutcome::DryRun);
        }

        let release = ReleaseVersion::generate();
        info!(release = %release, "release version generated");

        // BUILD
        let artifact_dir = tempfile::Builder::new()
            .prefix(&format!("versa-artifact-{release}-"))
            .tempdir()?;
        let changes = Arc::new(changes);
        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact_dir.path(),
            Arc::clone(&self.env),
            Arc::clone(&changes),
        );
        info!("building artifacts");
        let report = orchestrator.build().await?;

        // PACK
        versa_build::write_manifest(artifact_dir.path(), release.as_str(), commit_hash, &report)?;
        let artifact_size = versa_build::directory_size(artifact_dir.path());
        info!(size_mb = artifact_size / (1024 * 1024), "artifact built");

        let chunk_dir = tempfile::Builder::new().prefix("versa-chunks-").tempdir()?;
        let archive_base = chunk_dir.path().join(format!("{release}.tar.gz"));
        info!("compressing release into chunks");
        let chunks =
            versa_build::pack_chunked(artifact_dir.path(), &archive_base, DEFAULT_CHUNK_SIZE)
                .await?;

        // UPLOAD
        session.mkdir_p(&layout.releases_dir()).await?;
        session
            .check_disk_space(&layout.releases_dir(), artifact_size)
            .await?;

        let upload_total: u64 = chunks
            .iter()
            .filter_map(|c| std::fs::metadata(c).ok())
            .map(|m| m.len())
            .sum();
        let progress = self.progress.as_ref().map(|factory| factory(upload_total));
        info!(chunks = chunks.len(), "uploading chunks in parallel");
        session
            .upload_parallel(chunks, layout.root(), UPLOAD_CONCURRENCY, progress)
            .await?;

        // REASSEMBLE
        let remote_archive = layout.archive(release.as_str());
        info!("reassembling artifact on server");
        let quoted = sh_quote(&remote_archive);
        session
            .exec(&format!("cat {quoted}.* > {quoted} && rm -f {quoted}.*"))
            .await
            .map_err(|e| DeployError::UploadFailed {
                message: "failed to reassemble artifact on server".to_owned(),
                source: Some(Box::new(e)),
            })?;

        // EXTRACT
        let staging_dir = layout.staging_dir(release.as_str());
        info!("extracting archive into staging");
        if let Err(e) = session.extract_archive(&remote_archive, &staging_dir).await {
            let _ = session
                .exec(&format!("rm -rf {}", sh_quote(&staging_dir)))
                .await;
            let _ = session
                .exec(&format!("rm -f {}", sh_quote(&remote_archive)))
                .await;
            return Err(e);
        }
        let _ = session
            .exec(&format!("rm -f {}", sh_quote(&remote_archive)))
            .await;

        // FINALIZE_DIR
        let final_dir = layout.release_dir(release.as_str());
        if let Err(e) = session
            .exec(&format!(
                "mv -T {} {}",
                sh_quote(&staging_dir),
                sh_quote(&final_dir)
            ))
            .await
        {
            let _ = session
                .exec(&format!("rm -rf {}", sh_quote(&staging_dir)))
                .await;
            return Err(e);
        }

        // WIRE_PATHS
        self.wire_shared_paths(session, layout, &final_dir).await?;
        if let Some(previous) = &previous_lock {
            self.reuse_dependencies(session, layout, &previous.last_deploy.release_dir, &final_dir, &changes)
                .await;
            self.restore_preserved_paths(session, layout, &previous.last_deploy.release_dir, &final_dir)
                .await?;
        }

        // ACTIVATE
        let target = layout.release_app_dir(release.as_str());
        info!(target = %target, "activating release");
        session
            .create_symlink(&target, &layout.current_link())
            .await?;

        // HOOKS
        self.run_hooks(session, layout, &final_dir, previous_lock.as_ref())
            .await?;

        // WRITE_STATE (non-fatal: the release is already active and correct;
        // the next run re-hashes and catches up)
        info!("updating deploy.lock");
        let new_lock = DeployLock::new(
            commit_hash,
            release.as_str(),
            changes.all_file_hashes.clone(),
            changes.composer_hash.clone(),
            changes.package_hash.clone(),
            changes.go_mod_hash.clone(),
        );
        match versa_state::serialize(&new_lock) {
            Ok(data) => {
                if let Err(e) = session.write_file(&layout.state_file(), data).await {
                    error!(error = %e, "failed to upload deploy.lock");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize deploy.lock"),
        }

        // RETENTION (non-fatal)
        self.cleanup_old_releases(session, layout).await;

        info!(release = %release, "deployment successful");
        Ok(DeployOutcome::Deployed {
            release: release.as_str().to_owned(),
        })
    }

    /// PREFLIGHT: every enabled engine's driver must resolve on PATH.
    fn validate_local_tools(&self) -> DeployResult<()> {
        let mut tools: Vec<(String, String)> = Vec::new();

        if self.env.builds.php.enabled {
            let tool = first_token(&self.env.builds.php.composer_command)
                .unwrap_or_else(|| "composer".to_owned());
            tools.push((tool.clone(), format!("Install {tool} or ensure it is in your PATH.")));
        }
        if self.env.builds.go.enabled {
            tools.push((
                "go".to_owned(),
                "Install Go (https://go.dev/dl/) and ensure it is in your PATH.".to_owned(),
            ));
        }
        if self.env.builds.frontend.enabled {
            for command in [
                &self.env.builds.frontend.npm_command,
                &self.env.builds.frontend.compile_command,
            ] {
                if let Some(tool) = first_token(command) {
                    // Project-local scripts are not expected on PATH.
                    if !tool.starts_with("./") {
                        tools.push((
                            tool.clone(),
                            format!("Install {tool} (npm, pnpm, yarn, ...) and ensure it is in your PATH."),
                        ));
                    }
                }
            }
        }

        for (tool, hint) in tools {
            if which::which(&tool).is_err() {
                return Err(DeployError::ToolMissing { name: tool, hint });
            }
        }
        Ok(())
    }

    /// FETCH_STATE: download and parse deploy.lock, or require the
    /// initial-deploy opt-in.
    async fn fetch_state(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
    ) -> DeployResult<Option<DeployLock>> {
        let state_file = layout.state_file();
        if session.file_exists(&state_file).await? {
            info!("fetching deploy.lock from remote");
            let data = session.read_file(&state_file).await?;
            return versa_state::parse(&data).map(Some);
        }

        if !self.options.initial_deploy {
            return Err(DeployError::StateMissing);
        }
        info!("first deployment detected (--initial-deploy)");
        Ok(None)
    }

    /// WIRE_PATHS step 1: expose persistent directories into the release.
    async fn wire_shared_paths(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
        release_dir: &str,
    ) -> DeployResult<()> {
        if self.env.shared_paths.is_empty() {
            return Ok(());
        }

        info!("linking shared directories");
        let shared_base = layout.shared_dir();
        session.mkdir_p(&shared_base).await?;

        for raw in &self.env.shared_paths {
            let Some(clean) = sanitize_rel_path(raw) else {
                debug!(path = %raw, "ignoring shared path that escapes the release");
                continue;
            };

            let release_path = posix_join(release_dir, &clean);
            let shared_path = posix_join(&shared_base, &clean);

            session.mkdir_p(&shared_path).await?;
            session
                .exec(&format!("rm -rf {}", sh_quote(&release_path)))
                .await?;
            if let Some(parent) = release_path.rsplit_once('/').map(|(p, _)| p) {
                session.mkdir_p(parent).await?;
            }
            session
                .exec(&format!(
                    "ln -sfn {} {}",
                    sh_quote(&shared_path),
                    sh_quote(&release_path)
                ))
                .await?;
            debug!(path = %clean, target = %shared_path, "shared path linked");
        }
        Ok(())
    }

    /// WIRE_PATHS step 2: hardlink unchanged dependency trees from the
    /// predecessor. Best effort; must never overwrite freshly built output.
    async fn reuse_dependencies(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
        previous_version: &str,
        release_dir: &str,
        changes: &ChangeSet,
    ) {
        if previous_version.is_empty() {
            return;
        }

        let mut jobs: Vec<(String, String)> = Vec::new();

        if self.env.builds.php.enabled && !changes.composer_changed {
            let mut paths = self.env.builds.php.reusable_paths.clone();
            if !paths.iter().any(|p| p == "vendor") {
                paths.push("vendor".to_owned());
            }
            for path in paths {
                jobs.push((self.env.builds.php.project_root.clone(), path));
            }
        }
        if self.env.builds.frontend.enabled && !changes.package_changed {
            let mut paths = self.env.builds.frontend.reusable_paths.clone();
            if !paths.iter().any(|p| p == "node_modules") {
                paths.push("node_modules".to_owned());
            }
            for path in paths {
                jobs.push((self.env.builds.frontend.project_root.clone(), path));
            }
        }

        for (project_root, rel_path) in jobs {
            let old_path = posix_join(
                &posix_join(&layout.release_dir(previous_version), "app"),
                &posix_join(&project_root, &rel_path),
            );
            let new_path = posix_join(
                &posix_join(release_dir, "app"),
                &posix_join(&project_root, &rel_path),
            );
            let Some(parent) = new_path.rsplit_once('/').map(|(p, _)| p.to_owned()) else {
                continue;
            };

            // Hardlink-copy only when absent in the new release and present
            // in the old one.
            let command = format!(
                "if [ ! -e {new} ] && [ -e {old} ]; then mkdir -p {parent} && cp -al {old} {new}; fi",
                new = sh_quote(&new_path),
                old = sh_quote(&old_path),
                parent = sh_quote(&parent),
            );
            if let Err(e) = session.exec(&command).await {
                debug!(path = %rel_path, error = %e, "dependency reuse skipped");
            } else {
                debug!(path = %rel_path, "dependency reuse attempted");
            }
        }
    }

    /// WIRE_PATHS step 3: carry preserved files forward from the
    /// predecessor instead of taking the artifact's copy.
    async fn restore_preserved_paths(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
        previous_version: &str,
        release_dir: &str,
    ) -> DeployResult<()> {
        if self.env.preserved_paths.is_empty() || previous_version.is_empty() {
            return Ok(());
        }

        info!("restoring preserved paths");
        for raw in &self.env.preserved_paths {
            let Some(clean) = sanitize_rel_path(raw) else {
                debug!(path = %raw, "ignoring preserved path that escapes the release");
                continue;
            };

            let old_path = posix_join(
                &posix_join(&layout.release_dir(previous_version), "app"),
                &clean,
            );
            let new_path = posix_join(&posix_join(release_dir, "app"), &clean);

            let exists = session
                .exec(&format!(
                    "if [ -e {} ]; then echo exists; fi",
                    sh_quote(&old_path)
                ))
                .await?;
            if exists.trim() != "exists" {
                warn!(path = %clean, "preserved path missing in previous release");
                continue;
            }

            session
                .exec(&format!("rm -rf {}", sh_quote(&new_path)))
                .await?;
            session
                .exec(&format!(
                    "cp -rfp {} {}",
                    sh_quote(&old_path),
                    sh_quote(&new_path)
                ))
                .await?;
            info!(path = %clean, "preserved from previous release");
        }
        Ok(())
    }

    /// HOOKS: sequential entries, parallel groups, rollback on failure.
    async fn run_hooks(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
        release_dir: &str,
        previous: Option<&DeployLock>,
    ) -> DeployResult<()> {
        if self.env.post_deploy.is_empty() {
            return Ok(());
        }

        info!("running post-deploy hooks");
        let app_dir = posix_join(release_dir, "app");

        for entry in &self.env.post_deploy {
            let result = match entry {
                HookEntry::Command(command) => {
                    self.run_hook(session, &app_dir, command).await
                }
                HookEntry::Group { parallel } => {
                    self.run_hook_group(session, &app_dir, parallel).await
                }
            };

            if let Err(hook_error) = result {
                return Err(self
                    .rollback_after_hook_failure(session, layout, previous, hook_error)
                    .await);
            }
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        session: &RemoteSession,
        app_dir: &str,
        command: &str,
    ) -> DeployResult<()> {
        let wrapped = format!("cd {} && {}", sh_quote(app_dir), command);
        info!(hook = %command, "executing hook");

        let timeout = Duration::from_secs(self.env.hook_timeout);
        match session.exec_timeout(&wrapped, timeout).await {
            Ok(output) => {
                let trimmed = output.trim();
                if !trimmed.is_empty() {
                    debug!(hook = %command, output = %trimmed, "hook output");
                }
                Ok(())
            }
            Err(e) => Err(hook_failure(command, e)),
        }
    }

    async fn run_hook_group(
        &self,
        session: &RemoteSession,
        app_dir: &str,
        commands: &[String],
    ) -> DeployResult<()> {
        info!(count = commands.len(), "executing parallel hook group");

        let cancel = CancellationToken::new();
        let mut set = JoinSet::new();
        for command in commands {
            let session = session.clone();
            let app_dir = app_dir.to_owned();
            let command = command.clone();
            let timeout = Duration::from_secs(self.env.hook_timeout);
            let cancel = cancel.clone();
            set.spawn(async move {
                let wrapped = format!("cd {} && {}", sh_quote(&app_dir), command);
                match session
                    .exec_timeout_cancellable(&wrapped, timeout, cancel.clone())
                    .await
                {
                    Ok(_) => Ok(()),
                    // A sibling failed first and tore this hook's channel
                    // down; its own failure is the one that surfaces.
                    Err(_) if cancel.is_cancelled() => Ok(()),
                    Err(e) => {
                        cancel.cancel();
                        Err(hook_failure(&command, e))
                    }
                }
            });
        }

        // The first failure cancels the rest of the group; cancelled
        // siblings drain quickly once their channels close.
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(DeployError::Internal(format!("hook task failed: {e}")));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A failed hook repoints `current` at the predecessor. Hooks are not
    /// re-run; the failed release stays on disk for forensics.
    async fn rollback_after_hook_failure(
        &self,
        session: &RemoteSession,
        layout: &RemoteLayout,
        previous: Option<&DeployLock>,
        hook_error: DeployError,
    ) -> DeployError {
        let Some(previous) = previous else {
            warn!("hook failed and no previous release exists for rollback");
            return hook_error;
        };
        let previous_release = previous.last_deploy.release_dir.clone();

        error!(release = %previous_release, "hook failed - rolling back");
        let target = layout.release_app_dir(&previous_release);
        match session.create_symlink(&target, &layout.current_link()).await {
            Ok(()) => match hook_error {
                DeployError::HookFailed {
                    command, output, ..
                } => DeployError::HookFailed {
                    command,
                    output,
                    rolled_back_to: Some(previous_release),
                },
                other => other,
            },
            Err(rollback_error) => DeployError::HookRollbackFailed {
                hook: Box::new(hook_error),
                rollback: Box::new(rollback_error),
            },
        }
    }

    /// RETENTION: drop stale staging directories and releases beyond the
    /// newest N. Never deletes the active release. Failures only log.
    async fn cleanup_old_releases(&self, session: &RemoteSession, layout: &RemoteLayout) {
        info!("cleaning up old releases");

        let entries = match session.read_dir(&layout.releases_dir()).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to list releases for retention");
                return;
            }
        };

        let mut releases = Vec::new();
        for (name, is_dir) in entries {
            if !is_dir {
                continue;
            }
            if name.ends_with(STAGING_SUFFIX) {
                // Leftover from an interrupted run.
                let path = posix_join(&layout.releases_dir(), &name);
                warn!(path = %path, "removing stale staging directory");
                if let Err(e) = session.exec(&format!("rm -rf {}", sh_quote(&path))).await {
                    warn!(error = %e, "failed to remove stale staging directory");
                }
                continue;
            }
            releases.push(name);
        }

        let active = match session.read_link(&layout.current_link()).await {
            Ok(target) => release_name_from_target(&target),
            Err(_) => None,
        };

        for release in retention_plan(&releases, active.as_deref(), RELEASES_TO_KEEP) {
            let path = layout.release_dir(&release);
            info!(release = %release, "deleting old release");
            if let Err(e) = session.exec(&format!("rm -rf {}", sh_quote(&path))).await {
                warn!(release = %release, error = %e, "failed to delete old release");
            }
        }
    }
}

/// Engine driver binary: the first whitespace-separated token of a command.
fn first_token(command: &str) -> Option<String> {
    command.split_whitespace().next().map(str::to_owned)
}

/// Map a hook's transport-level failure onto `hook_failed`. Timeouts count
/// as hook failures too; both trigger the automatic rollback.
fn hook_failure(command: &str, error: DeployError) -> DeployError {
    match error {
        DeployError::RemoteCommandFailed { output, .. } => DeployError::HookFailed {
            command: command.to_owned(),
            output,
            rolled_back_to: None,
        },
        DeployError::CommandTimeout { timeout_secs, .. } => DeployError::HookFailed {
            command: command.to_owned(),
            output: format!("timed out after {timeout_secs}s"),
            rolled_back_to: None,
        },
        other => other,
    }
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("env_name", &self.env_name)
            .field("repo_path", &self.repo_path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_extraction() {
        assert_eq!(first_token("composer install --no-dev"), Some("composer".to_owned()));
        assert_eq!(first_token("go"), Some("go".to_owned()));
        assert_eq!(first_token("  npm run prod "), Some("npm".to_owned()));
        assert_eq!(first_token(""), None);
    }
}
