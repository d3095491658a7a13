//! Error types for the deployment engine.
//!
//! Every error carries a stable [`code`](DeployError::code) so scripts can
//! match on failures, and a [`remediation`](DeployError::remediation) hint
//! that the CLI prints next to the message.

use std::path::PathBuf;

use thiserror::Error;

/// Source of a boxed transport or IO failure.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The build engine a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// PHP / composer.
    Php,
    /// Go cross-compile.
    Go,
    /// JavaScript / TypeScript front end.
    Frontend,
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Php => write!(f, "php"),
            Self::Go => write!(f, "go"),
            Self::Frontend => write!(f, "frontend"),
        }
    }
}

/// Errors that can occur anywhere in the deployment pipeline.
#[derive(Debug, Error)]
pub enum DeployError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Configuration file could not be read.
    #[error("failed to read configuration {path}: {source}")]
    ConfigRead {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    /// A configuration value failed validation.
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        hint: String,
    },

    /// The named environment does not exist in the configuration.
    #[error("environment '{0}' not found in configuration")]
    EnvironmentNotFound(String),

    /// A build driver could not be resolved on PATH.
    #[error("build tool '{name}' not found on PATH")]
    ToolMissing {
        /// Tool binary name.
        name: String,
        /// Installation hint.
        hint: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Source errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Snapshot root is not a version-controlled repository.
    #[error("{0} is not a git repository")]
    NotARepository(PathBuf),

    /// The working tree has uncommitted changes.
    #[error("working tree has uncommitted changes")]
    DirtyWorkingTree,

    /// Snapshot materialisation failed.
    #[error("failed to snapshot repository: {0}")]
    SnapshotFailed(String),

    /// Hashing a file during change detection failed.
    #[error("failed to hash {path}: {source}")]
    HashFailed {
        /// Repository-relative path.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Build errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A build engine command exited non-zero.
    #[error("{engine} build failed: {message}")]
    BuildFailed {
        /// Engine that failed.
        engine: Engine,
        /// Captured combined output plus context.
        message: String,
        /// Remediation hint for this engine.
        hint: String,
    },

    /// Packing the artifact into chunks failed.
    #[error("failed to pack artifact: {0}")]
    PackFailed(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Remote session errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Neither the agent nor a private key produced an authentication method.
    #[error("no SSH authentication methods available")]
    NoAuthMethods,

    /// TCP connect / handshake failed after all retries.
    #[error("failed to connect to {host} after {attempts} attempts: {source}")]
    SshConnectFailed {
        /// host:port string.
        host: String,
        /// Attempts made.
        attempts: u32,
        /// Last underlying error.
        source: BoxedCause,
    },

    /// The server rejected every authentication attempt.
    #[error("SSH authentication failed: {0}")]
    SshAuthFailed(String),

    /// Host key could not be verified against known_hosts.
    #[error("host key verification failed for {host}: {reason}")]
    HostKeyUnverified {
        /// Hostname that failed verification.
        host: String,
        /// NotFound / mismatch detail.
        reason: String,
    },

    /// A remote shell command exited non-zero.
    #[error("remote command failed (exit {status}): {command}")]
    RemoteCommandFailed {
        /// The command string that ran.
        command: String,
        /// Remote exit status.
        status: i32,
        /// Captured combined output.
        output: String,
    },

    /// A remote command exceeded its deadline.
    #[error("command timed out after {timeout_secs}s: {command}")]
    CommandTimeout {
        /// The command string that ran.
        command: String,
        /// Deadline in seconds.
        timeout_secs: u64,
    },

    /// SFTP or transport-level IO failed.
    #[error("remote IO failed while {context}: {source}")]
    RemoteIo {
        /// What was being attempted.
        context: String,
        /// Underlying transport error.
        source: BoxedCause,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Deployment errors
    // ─────────────────────────────────────────────────────────────────────────
    /// deploy.lock is absent and --initial-deploy was not given.
    #[error("deploy.lock not found on remote server")]
    StateMissing,

    /// deploy.lock exists but is zero bytes.
    #[error("deploy.lock is empty")]
    StateEmpty,

    /// deploy.lock is not valid JSON for the expected schema.
    #[error("failed to parse deploy.lock: {0}")]
    StateMalformed(String),

    /// deploy.lock schema version is not supported.
    #[error("unsupported deploy.lock version: {found} (expected {expected})")]
    StateUnsupportedVersion {
        /// Version string found in the file.
        found: String,
        /// Version this engine writes.
        expected: String,
    },

    /// Another coordinator holds the deployment lock.
    #[error("deployment lock already held at {lock_dir}")]
    DeployInProgress {
        /// Remote lock directory.
        lock_dir: String,
    },

    /// Remote disk space is below 1.2 x the artifact size.
    #[error("insufficient disk space: need {required} bytes (with buffer), have {available}")]
    DiskSpace {
        /// Required bytes including the 20% buffer.
        required: u64,
        /// Available bytes reported by df.
        available: u64,
    },

    /// A chunk transfer failed.
    #[error("upload failed: {message}")]
    UploadFailed {
        /// What failed.
        message: String,
        /// Underlying error, when one exists.
        source: Option<BoxedCause>,
    },

    /// Remote tar extraction exited non-zero.
    #[error("failed to extract archive: {0}")]
    ExtractFailed(String),

    /// A post-deploy hook exited non-zero or timed out.
    #[error("post-deploy hook failed: {command}")]
    HookFailed {
        /// Hook command.
        command: String,
        /// Captured output.
        output: String,
        /// Release rolled back to, when a rollback ran.
        rolled_back_to: Option<String>,
    },

    /// A hook failed and the automatic rollback failed too.
    #[error("post-deploy hook failed and rollback failed: hook: {hook}; rollback: {rollback}")]
    HookRollbackFailed {
        /// The original hook failure.
        hook: Box<DeployError>,
        /// The rollback failure on top of it.
        rollback: Box<DeployError>,
    },

    /// readlink after the atomic switch did not resolve to the expected target.
    #[error("symlink verification failed: expected {expected}, got {actual}")]
    SymlinkVerification {
        /// Target passed to the switch.
        expected: String,
        /// Target read back.
        actual: String,
    },

    /// Rollback requested but no predecessor release exists.
    #[error("no previous release to roll back to")]
    NoPreviousRelease,

    // ─────────────────────────────────────────────────────────────────────────
    // Internal errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Local IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invariant violation or task failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigRead { .. }
            | Self::ConfigParse(_)
            | Self::ConfigInvalid { .. }
            | Self::EnvironmentNotFound(_) => "CONFIG_INVALID",
            Self::ToolMissing { .. } => "TOOL_MISSING",
            Self::NotARepository(_) => "NOT_A_REPOSITORY",
            Self::DirtyWorkingTree => "DIRTY_WORKING_TREE",
            Self::SnapshotFailed(_) => "SNAPSHOT_FAILED",
            Self::HashFailed { .. } => "HASH_FAILED",
            Self::BuildFailed { .. } => "BUILD_FAILED",
            Self::PackFailed(_) => "PACK_FAILED",
            Self::NoAuthMethods => "NO_AUTH_METHODS",
            Self::SshConnectFailed { .. } => "SSH_CONNECT_FAILED",
            Self::SshAuthFailed(_) => "SSH_AUTH_FAILED",
            Self::HostKeyUnverified { .. } => "HOST_KEY_UNVERIFIED",
            Self::RemoteCommandFailed { .. } => "REMOTE_COMMAND_FAILED",
            Self::CommandTimeout { .. } => "COMMAND_TIMEOUT",
            Self::RemoteIo { .. } => "REMOTE_IO",
            Self::StateMissing => "STATE_MISSING",
            Self::StateEmpty | Self::StateMalformed(_) | Self::StateUnsupportedVersion { .. } => {
                "STATE_INVALID"
            }
            Self::DeployInProgress { .. } => "DEPLOY_IN_PROGRESS",
            Self::DiskSpace { .. } => "DISK_SPACE",
            Self::UploadFailed { .. } => "UPLOAD_FAILED",
            Self::ExtractFailed(_) => "EXTRACT_FAILED",
            Self::HookFailed { .. } | Self::HookRollbackFailed { .. } => "HOOK_FAILED",
            Self::SymlinkVerification { .. } => "SYMLINK_VERIFICATION",
            Self::NoPreviousRelease => "NO_PREVIOUS_RELEASE",
            Self::Io(_) => "IO",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Human remediation hint, when this error has a useful one.
    #[must_use]
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::ConfigInvalid { hint, .. } | Self::ToolMissing { hint, .. } => {
                Some(hint.clone())
            }
            Self::BuildFailed { hint, .. } => Some(hint.clone()),
            Self::ConfigRead { .. } | Self::ConfigParse(_) => Some(
                "Revise deploy.yml and ensure all required fields are present and correctly formatted.".to_owned(),
            ),
            Self::EnvironmentNotFound(_) => {
                Some("List the environments defined under 'environments:' in deploy.yml.".to_owned())
            }
            Self::DirtyWorkingTree => Some(
                "Commit or stash your changes before deploying, or pass --skip-dirty-check.".to_owned(),
            ),
            Self::NotARepository(_) => {
                Some("Run versa from the root of a git repository.".to_owned())
            }
            Self::NoAuthMethods => Some(
                "Set ssh.key_path to a private key or enable ssh.use_ssh_agent in deploy.yml.".to_owned(),
            ),
            Self::SshConnectFailed { .. } => Some(
                "Ensure the remote host is reachable and the SSH port is open in the firewall.".to_owned(),
            ),
            Self::SshAuthFailed(_) => Some(
                "Check the private key path and ensure the public key is in the server's authorized_keys.".to_owned(),
            ),
            Self::HostKeyUnverified { .. } => Some(
                "Connect once with plain ssh to record the host key, or point ssh.known_hosts_file at a file that contains it.".to_owned(),
            ),
            Self::StateMissing => Some(
                "This looks like the first deployment. Re-run with --initial-deploy.".to_owned(),
            ),
            Self::DeployInProgress { lock_dir } => Some(format!(
                "Another deployment is in progress. If you are sure nobody else is deploying, remove the directory: {lock_dir}"
            )),
            Self::DiskSpace { .. } => {
                Some("Free disk space on the remote host or lower the retention count.".to_owned())
            }
            Self::NoPreviousRelease => {
                Some("At least two releases must exist before a rollback is possible.".to_owned())
            }
            _ => None,
        }
    }
}

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DeployError::DirtyWorkingTree.code(), "DIRTY_WORKING_TREE");
        assert_eq!(DeployError::StateMissing.code(), "STATE_MISSING");
        assert_eq!(
            DeployError::DeployInProgress {
                lock_dir: "/var/www/app/.versa.lock".to_owned()
            }
            .code(),
            "DEPLOY_IN_PROGRESS"
        );
        assert_eq!(
            DeployError::StateUnsupportedVersion {
                found: "2.0".to_owned(),
                expected: "1.0".to_owned()
            }
            .code(),
            "STATE_INVALID"
        );
    }

    #[test]
    fn hook_rollback_failure_names_both_causes() {
        let err = DeployError::HookRollbackFailed {
            hook: Box::new(DeployError::HookFailed {
                command: "php artisan migrate".to_owned(),
                output: "boom".to_owned(),
                rolled_back_to: None,
            }),
            rollback: Box::new(DeployError::SymlinkVerification {
                expected: "/srv/releases/a/app".to_owned(),
                actual: "/srv/releases/b/app".to_owned(),
            }),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("php artisan migrate"));
        assert!(rendered.contains("symlink verification failed"));
        assert_eq!(err.code(), "HOOK_FAILED");
    }

    #[test]
    fn remediation_mentions_lock_dir() {
        let err = DeployError::DeployInProgress {
            lock_dir: "/srv/app/.versa.lock".to_owned(),
        };
        assert!(err.remediation().unwrap().contains("/srv/app/.versa.lock"));
    }
}
