//! Rollback and status operations.
//!
//! Degenerate entry points that only need the remote session and the
//! release listing; no snapshot, build or state write happens here.

use tracing::{info, instrument};

use versa_core::{DeployResult, Environment};
use versa_remote::{RemoteSession, SshSettings};

use crate::paths::{release_name_from_target, RemoteLayout, STAGING_SUFFIX};

/// What `status` observed on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Name of the active release, when `current` resolves.
    pub current: Option<String>,
    /// All release names, newest first.
    pub releases: Vec<String>,
}

/// Resolve `current` and list the releases.
#[instrument(skip(env))]
pub async fn status(env: &Environment) -> DeployResult<StatusReport> {
    let session = RemoteSession::connect(SshSettings::from_config(&env.ssh)).await?;
    let layout = RemoteLayout::new(&env.remote_path);

    let current = match session.read_link(&layout.current_link()).await {
        Ok(target) => release_name_from_target(&target),
        Err(_) => None,
    };

    let mut releases = list_releases(&session, &layout).await.unwrap_or_default();
    versa_state::release_sort(&mut releases);

    Ok(StatusReport { current, releases })
}

/// Repoint `current` at the predecessor release.
///
/// No hooks run; the abandoned release directory is left untouched.
/// Fails with `no_previous_release` when fewer than two releases exist.
#[instrument(skip(env))]
pub async fn rollback(env: &Environment) -> DeployResult<String> {
    let session = RemoteSession::connect(SshSettings::from_config(&env.ssh)).await?;
    let layout = RemoteLayout::new(&env.remote_path);

    let current_target = session
        .read_link(&layout.current_link())
        .await
        .map_err(|_| versa_core::DeployError::NoPreviousRelease)?;
    let current_release = release_name_from_target(&current_target)
        .ok_or(versa_core::DeployError::NoPreviousRelease)?;
    info!(current = %current_release, "current release resolved");

    let mut releases = list_releases(&session, &layout).await?;
    if releases.len() < 2 {
        return Err(versa_core::DeployError::NoPreviousRelease);
    }
    versa_state::release_sort(&mut releases);

    let previous = releases
        .iter()
        .find(|r| **r != current_release)
        .cloned()
        .ok_or(versa_core::DeployError::NoPreviousRelease)?;

    info!(release = %previous, "rolling back");
    session
        .create_symlink(
            &layout.release_app_dir(&previous),
            &layout.current_link(),
        )
        .await?;

    info!(release = %previous, "rollback successful");
    Ok(previous)
}

async fn list_releases(
    session: &RemoteSession,
    layout: &RemoteLayout,
) -> DeployResult<Vec<String>> {
    let entries = session.read_dir(&layout.releases_dir()).await?;
    Ok(entries
        .into_iter()
        .filter(|(name, is_dir)| *is_dir && !name.ends_with(STAGING_SUFFIX))
        .map(|(name, _)| name)
        .collect())
}
