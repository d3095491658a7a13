//! The SSH/SFTP remote session.
//!
//! libssh2 is a blocking library; every operation here runs inside
//! `spawn_blocking` over a shared session handle. The SFTP write path uses a
//! 32 KiB buffer so large uploads go out in full-size packets, and the
//! parallel chunk upload opens one SFTP channel per worker over the single
//! authenticated session.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use versa_core::config::SshConfig;
use versa_core::shell::sh_quote;
use versa_core::{DeployError, DeployResult};

/// SFTP write buffer; sized to the transfer packet we want on the wire.
const SFTP_BUF_SIZE: usize = 32 * 1024;

/// Handshake attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// TCP connect deadline per attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read poll granularity while a command deadline is armed.
const DEADLINE_POLL_MS: u32 = 500;

/// Byte-level progress callback shared by parallel uploads.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Resolved connection settings.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Remote hostname.
    pub host: String,
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key, when key authentication is configured.
    pub key_path: Option<PathBuf>,
    /// known_hosts override; the default location is probed when absent.
    pub known_hosts_file: Option<PathBuf>,
    /// Try agent-based authentication first.
    pub use_ssh_agent: bool,
}

impl SshSettings {
    /// Build settings from the validated environment configuration.
    #[must_use]
    pub fn from_config(config: &SshConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            key_path: (!config.key_path.is_empty()).then(|| PathBuf::from(&config.key_path)),
            known_hosts_file: (!config.known_hosts_file.is_empty())
                .then(|| PathBuf::from(&config.known_hosts_file)),
            use_ssh_agent: config.use_ssh_agent,
        }
    }
}

struct Inner {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
    host: String,
}

/// An authenticated SSH session with an open SFTP channel.
#[derive(Clone)]
pub struct RemoteSession {
    inner: Arc<Inner>,
}

impl RemoteSession {
    /// Connect, verify the host key, authenticate and open SFTP.
    #[instrument(skip_all, fields(host = %settings.host, port = settings.port))]
    pub async fn connect(settings: SshSettings) -> DeployResult<Self> {
        task::spawn_blocking(move || connect_blocking(&settings))
            .await
            .map_err(|e| DeployError::Internal(format!("connect task failed: {e}")))?
    }

    /// Hostname this session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Run a shell command, returning its merged stdout+stderr.
    pub async fn exec(&self, command: &str) -> DeployResult<String> {
        self.exec_inner(command.to_owned(), None, None).await
    }

    /// Run a shell command with a deadline; the channel is torn down and
    /// `command_timeout` raised when the deadline passes.
    pub async fn exec_timeout(&self, command: &str, timeout: Duration) -> DeployResult<String> {
        self.exec_inner(command.to_owned(), Some(timeout), None).await
    }

    /// Like [`exec_timeout`](Self::exec_timeout), but also tears the channel
    /// down as soon as `cancel` fires. Used by worker groups whose first
    /// failure must terminate the in-flight siblings.
    pub async fn exec_timeout_cancellable(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> DeployResult<String> {
        self.exec_inner(command.to_owned(), Some(timeout), Some(cancel))
            .await
    }

    async fn exec_inner(
        &self,
        command: String,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> DeployResult<String> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || exec_blocking(&inner, &command, timeout, cancel.as_ref()))
            .await
            .map_err(|e| DeployError::Internal(format!("exec task failed: {e}")))?
    }

    /// Upload one local file to an exact remote path.
    pub async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<ProgressFn>,
    ) -> DeployResult<()> {
        let inner = Arc::clone(&self.inner);
        let local = local.to_owned();
        let remote = remote.to_owned();
        task::spawn_blocking(move || upload_one(&inner.sftp, &local, &remote, progress.as_ref()))
            .await
            .map_err(|e| DeployError::Internal(format!("upload task failed: {e}")))?
    }

    /// Upload many files into `remote_dir` with a bounded worker group.
    ///
    /// Workers share one byte-level progress aggregator; the first failure
    /// cancels the group and surfaces as `upload_failed`.
    #[instrument(skip_all, fields(files = local_paths.len(), concurrency))]
    pub async fn upload_parallel(
        &self,
        local_paths: Vec<PathBuf>,
        remote_dir: &str,
        concurrency: usize,
        progress: Option<ProgressFn>,
    ) -> DeployResult<()> {
        let concurrency = concurrency.clamp(1, local_paths.len().max(1));
        self.mkdir_p(remote_dir).await?;

        let jobs: VecDeque<(PathBuf, String)> = local_paths
            .into_iter()
            .map(|local| {
                let name = local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let remote = posix_join(remote_dir, &name);
                (local, remote)
            })
            .collect();
        let queue = Arc::new(Mutex::new(jobs));
        let cancel = CancellationToken::new();

        let mut set = JoinSet::new();
        for _ in 0..concurrency {
            let inner = Arc::clone(&self.inner);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let progress = progress.clone();
            set.spawn_blocking(move || -> DeployResult<()> {
                // One SFTP channel per worker over the shared session.
                let sftp = inner
                    .session
                    .sftp()
                    .map_err(|e| remote_io("opening sftp channel", e))?;
                loop {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let job = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => return Ok(()),
                    };
                    let Some((local, remote)) = job else {
                        return Ok(());
                    };
                    if let Err(e) = upload_one(&sftp, &local, &remote, progress.as_ref()) {
                        cancel.cancel();
                        return Err(DeployError::UploadFailed {
                            message: format!("failed to upload {}", local.display()),
                            source: Some(Box::new(e)),
                        });
                    }
                    debug!(local = %local.display(), remote = %remote, "chunk uploaded");
                }
            });
        }

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
                    if first_error.is_none() {
                        first_error =
                            Some(DeployError::Internal(format!("upload worker failed: {e}")));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read a whole remote file into memory.
    pub async fn read_file(&self, remote: &str) -> DeployResult<Vec<u8>> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || {
            let mut file = inner
                .sftp
                .open(Path::new(&remote))
                .map_err(|e| remote_io(&format!("opening {remote}"), e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|e| DeployError::RemoteIo {
                    context: format!("reading {remote}"),
                    source: Box::new(e),
                })?;
            Ok(data)
        })
        .await
        .map_err(|e| DeployError::Internal(format!("read task failed: {e}")))?
    }

    /// Create or replace a remote file with the given bytes.
    pub async fn write_file(&self, remote: &str, data: Vec<u8>) -> DeployResult<()> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || {
            let file = inner
                .sftp
                .create(Path::new(&remote))
                .map_err(|e| remote_io(&format!("creating {remote}"), e))?;
            let mut writer = BufWriter::with_capacity(SFTP_BUF_SIZE, file);
            writer.write_all(&data).map_err(|e| DeployError::RemoteIo {
                context: format!("writing {remote}"),
                source: Box::new(e),
            })?;
            writer.flush().map_err(|e| DeployError::RemoteIo {
                context: format!("flushing {remote}"),
                source: Box::new(e),
            })?;
            Ok(())
        })
        .await
        .map_err(|e| DeployError::Internal(format!("write task failed: {e}")))?
    }

    /// Create a directory and any missing parents via SFTP.
    pub async fn mkdir_p(&self, remote: &str) -> DeployResult<()> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || {
            for prefix in path_prefixes(&remote) {
                if inner.sftp.stat(Path::new(&prefix)).is_ok() {
                    continue;
                }
                if let Err(e) = inner.sftp.mkdir(Path::new(&prefix), 0o755) {
                    // Lost a race with another component creator is fine.
                    if inner.sftp.stat(Path::new(&prefix)).is_err() {
                        return Err(remote_io(&format!("creating directory {prefix}"), e));
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| DeployError::Internal(format!("mkdir task failed: {e}")))?
    }

    /// Remove a remote file.
    pub async fn remove(&self, remote: &str) -> DeployResult<()> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || {
            inner
                .sftp
                .unlink(Path::new(&remote))
                .map_err(|e| remote_io(&format!("removing {remote}"), e))
        })
        .await
        .map_err(|e| DeployError::Internal(format!("remove task failed: {e}")))?
    }

    /// Whether a remote path exists.
    pub async fn file_exists(&self, remote: &str) -> DeployResult<bool> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || match inner.sftp.stat(Path::new(&remote)) {
            Ok(_) => Ok(true),
            Err(e) if is_no_such_file(&e) => Ok(false),
            Err(e) => Err(remote_io(&format!("checking {remote}"), e)),
        })
        .await
        .map_err(|e| DeployError::Internal(format!("stat task failed: {e}")))?
    }

    /// List a remote directory as (name, is_dir) pairs.
    pub async fn read_dir(&self, remote: &str) -> DeployResult<Vec<(String, bool)>> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || {
            let entries = inner
                .sftp
                .readdir(Path::new(&remote))
                .map_err(|e| remote_io(&format!("listing {remote}"), e))?;
            Ok(entries
                .into_iter()
                .filter_map(|(path, stat)| {
                    path.file_name()
                        .map(|n| (n.to_string_lossy().into_owned(), stat.is_dir()))
                })
                .collect())
        })
        .await
        .map_err(|e| DeployError::Internal(format!("readdir task failed: {e}")))?
    }

    /// Read a symlink's target.
    pub async fn read_link(&self, remote: &str) -> DeployResult<String> {
        let inner = Arc::clone(&self.inner);
        let remote = remote.to_owned();
        task::spawn_blocking(move || {
            inner
                .sftp
                .readlink(Path::new(&remote))
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(|e| remote_io(&format!("reading link {remote}"), e))
        })
        .await
        .map_err(|e| DeployError::Internal(format!("readlink task failed: {e}")))?
    }

    /// Atomically point `link` at `target`.
    ///
    /// Two-step protocol: `ln -sfn` onto a temporary name, `mv -Tf` over the
    /// real one, then a readlink verification. `mv -Tf` is the atomic step;
    /// observers see either the old target or the new one, never neither.
    pub async fn create_symlink(&self, target: &str, link: &str) -> DeployResult<()> {
        let tmp_link = format!("{link}.tmp");

        // A leftover temporary from a crashed run would make ln fail.
        let _ = self.remove(&tmp_link).await;

        self.exec(&format!("ln -sfn {} {}", sh_quote(target), sh_quote(&tmp_link)))
            .await?;
        self.exec(&format!("mv -Tf {} {}", sh_quote(&tmp_link), sh_quote(link)))
            .await?;

        let actual = self.read_link(link).await?;
        if !link_target_matches(target, &actual) {
            return Err(DeployError::SymlinkVerification {
                expected: target.to_owned(),
                actual,
            });
        }
        info!(link = %link, target = %target, "symlink switched");
        Ok(())
    }

    /// Acquire the distributed deployment lock.
    ///
    /// A single SFTP mkdir, never `mkdir -p`: the second creator must fail
    /// for mutual exclusion to hold.
    pub async fn acquire_lock(&self, lock_dir: &str) -> DeployResult<()> {
        let inner = Arc::clone(&self.inner);
        let lock_dir = lock_dir.to_owned();
        task::spawn_blocking(move || {
            inner
                .sftp
                .mkdir(Path::new(&lock_dir), 0o755)
                .map_err(|_| DeployError::DeployInProgress {
                    lock_dir: lock_dir.clone(),
                })
        })
        .await
        .map_err(|e| DeployError::Internal(format!("lock task failed: {e}")))?
    }

    /// Release the distributed deployment lock.
    pub async fn release_lock(&self, lock_dir: &str) -> DeployResult<()> {
        let inner = Arc::clone(&self.inner);
        let lock_dir = lock_dir.to_owned();
        task::spawn_blocking(move || {
            inner
                .sftp
                .rmdir(Path::new(&lock_dir))
                .map_err(|e| remote_io(&format!("releasing lock {lock_dir}"), e))
        })
        .await
        .map_err(|e| DeployError::Internal(format!("unlock task failed: {e}")))?
    }

    /// Verify the filesystem holding `path` has room for `required_bytes`
    /// plus a 20% buffer. Unparseable df output only warns.
    pub async fn check_disk_space(&self, path: &str, required_bytes: u64) -> DeployResult<()> {
        let command = format!("df -B1 {} | tail -1 | awk '{{print $4}}'", sh_quote(path));
        let output = match self.exec(&command).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "failed to check disk space");
                return Ok(());
            }
        };

        let Some(available) = parse_df_output(&output) else {
            warn!(output = %output.trim(), "could not parse disk space output");
            return Ok(());
        };

        let required = required_with_buffer(required_bytes);
        if available < required {
            return Err(DeployError::DiskSpace {
                required,
                available,
            });
        }
        debug!(available, required, "disk space check passed");
        Ok(())
    }

    /// Extract a remote tar.gz archive into `target_dir`.
    pub async fn extract_archive(&self, archive: &str, target_dir: &str) -> DeployResult<()> {
        self.mkdir_p(target_dir).await?;
        let command = format!("tar -xzf {} -C {}", sh_quote(archive), sh_quote(target_dir));
        self.exec(&command).await.map_err(|e| match e {
            DeployError::RemoteCommandFailed { output, .. } => DeployError::ExtractFailed(output),
            other => other,
        })?;
        Ok(())
    }
}

fn connect_blocking(settings: &SshSettings) -> DeployResult<RemoteSession> {
    let addr = format!("{}:{}", settings.host, settings.port);

    let mut last_error: Option<Box<dyn std::error::Error + Send + Sync>> = None;
    let mut session = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_secs(1 << (attempt - 1));
            debug!(attempt, backoff_secs = backoff.as_secs(), "retrying connection");
            std::thread::sleep(backoff);
        }
        match try_handshake(&addr) {
            Ok(s) => {
                session = Some(s);
                break;
            }
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "connection attempt failed");
                last_error = Some(e);
            }
        }
    }
    let session = match session {
        Some(s) => s,
        None => {
            return Err(DeployError::SshConnectFailed {
                host: addr,
                attempts: CONNECT_ATTEMPTS,
                source: last_error
                    .unwrap_or_else(|| Box::new(std::io::Error::other("no attempt made"))),
            })
        }
    };

    verify_host_key(&session, settings)?;
    authenticate(&session, settings)?;

    let sftp = session
        .sftp()
        .map_err(|e| remote_io("opening sftp channel", e))?;

    info!(host = %settings.host, "remote session established");
    Ok(RemoteSession {
        inner: Arc::new(Inner {
            session,
            sftp,
            host: settings.host.clone(),
        }),
    })
}

fn try_handshake(addr: &str) -> Result<ssh2::Session, Box<dyn std::error::Error + Send + Sync>> {
    let sock_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other(format!("could not resolve {addr}")))?;
    let tcp = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT)?;
    let mut session = ssh2::Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    Ok(session)
}

/// Host-key policy: verify against known_hosts when a file exists; warn and
/// continue when none does. A mismatch, or a host missing from an existing
/// file, is a hard error.
fn verify_host_key(session: &ssh2::Session, settings: &SshSettings) -> DeployResult<()> {
    let path = settings
        .known_hosts_file
        .clone()
        .or_else(default_known_hosts);

    let Some(path) = path.filter(|p| p.exists()) else {
        warn!(
            code = "HOST_KEY_UNVERIFIED",
            "no known_hosts file found; proceeding WITHOUT host key verification"
        );
        return Ok(());
    };

    let unverified = |reason: String| DeployError::HostKeyUnverified {
        host: settings.host.clone(),
        reason,
    };

    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| unverified("server offered no host key".to_owned()))?;

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| unverified(format!("failed to initialise known_hosts: {e}")))?;
    known_hosts
        .read_file(&path, ssh2::KnownHostFileKind::OpenSSH)
        .map_err(|e| unverified(format!("failed to read {}: {e}", path.display())))?;

    match known_hosts.check_port(&settings.host, settings.port, key) {
        ssh2::CheckResult::Match => Ok(()),
        ssh2::CheckResult::NotFound => Err(unverified(format!(
            "host not present in {}",
            path.display()
        ))),
        ssh2::CheckResult::Mismatch => Err(unverified(
            "host key MISMATCH - the server identity changed".to_owned(),
        )),
        ssh2::CheckResult::Failure => Err(unverified("known_hosts check failed".to_owned())),
    }
}

fn default_known_hosts() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".ssh").join("known_hosts"))
}

/// Authentication methods in priority order: agent signers first when
/// enabled and reachable, then the configured private key.
fn authenticate(session: &ssh2::Session, settings: &SshSettings) -> DeployResult<()> {
    let mut attempted = false;

    if settings.use_ssh_agent {
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                attempted = true;
                if agent.list_identities().is_ok() {
                    if let Ok(identities) = agent.identities() {
                        for identity in identities {
                            if agent.userauth(&settings.user, &identity).is_ok()
                                && session.authenticated()
                            {
                                debug!(comment = %identity.comment(), "authenticated via agent");
                                break;
                            }
                        }
                    }
                }
            } else {
                warn!("ssh agent requested but its socket is unreachable");
            }
        }
    }

    if !session.authenticated() {
        if let Some(key_path) = &settings.key_path {
            attempted = true;
            session
                .userauth_pubkey_file(&settings.user, None, key_path, None)
                .map_err(|e| DeployError::SshAuthFailed(e.to_string()))?;
        }
    }

    if !attempted {
        return Err(DeployError::NoAuthMethods);
    }
    if !session.authenticated() {
        return Err(DeployError::SshAuthFailed(
            "server rejected all configured authentication methods".to_owned(),
        ));
    }
    Ok(())
}

fn exec_blocking(
    inner: &Inner,
    command: &str,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> DeployResult<String> {
    let mut channel = inner
        .session
        .channel_session()
        .map_err(|e| remote_io("opening exec channel", e))?;
    channel
        .handle_extended_data(ssh2::ExtendedData::Merge)
        .map_err(|e| remote_io("merging stderr", e))?;
    channel
        .exec(command)
        .map_err(|e| remote_io(&format!("starting '{command}'"), e))?;

    let deadline = timeout.map(|t| (Instant::now() + t, t));
    let polling = deadline.is_some() || cancel.is_some();
    if polling {
        inner.session.set_timeout(DEADLINE_POLL_MS);
    }

    let mut output = Vec::new();
    let mut buf = [0u8; 8192];
    let read_result = loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                let _ = channel.close();
                inner.session.set_timeout(0);
                return Err(DeployError::Internal(format!(
                    "command cancelled: {command}"
                )));
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => break Err(e),
        }

        if let Some((at, duration)) = deadline {
            if Instant::now() >= at {
                let _ = channel.close();
                inner.session.set_timeout(0);
                return Err(DeployError::CommandTimeout {
                    command: command.to_owned(),
                    timeout_secs: duration.as_secs(),
                });
            }
        }
    };
    if polling {
        inner.session.set_timeout(0);
    }
    read_result.map_err(|e| DeployError::RemoteIo {
        context: format!("reading output of '{command}'"),
        source: Box::new(e),
    })?;

    let _ = channel.wait_close();
    let status = channel
        .exit_status()
        .map_err(|e| remote_io("reading exit status", e))?;

    let text = String::from_utf8_lossy(&output).into_owned();
    if status != 0 {
        return Err(DeployError::RemoteCommandFailed {
            command: command.to_owned(),
            status,
            output: text,
        });
    }
    Ok(text)
}

fn upload_one(
    sftp: &ssh2::Sftp,
    local: &Path,
    remote: &str,
    progress: Option<&ProgressFn>,
) -> DeployResult<()> {
    let mut local_file = File::open(local).map_err(|e| DeployError::UploadFailed {
        message: format!("failed to open {}", local.display()),
        source: Some(Box::new(e)),
    })?;
    let remote_file = sftp
        .create(Path::new(remote))
        .map_err(|e| remote_io(&format!("creating {remote}"), e))?;
    let mut writer = BufWriter::with_capacity(SFTP_BUF_SIZE, remote_file);

    let mut buf = [0u8; SFTP_BUF_SIZE];
    loop {
        let n = local_file.read(&mut buf).map_err(|e| DeployError::UploadFailed {
            message: format!("failed to read {}", local.display()),
            source: Some(Box::new(e)),
        })?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| DeployError::RemoteIo {
            context: format!("writing {remote}"),
            source: Box::new(e),
        })?;
        if let Some(report) = progress {
            report(n as u64);
        }
    }
    writer.flush().map_err(|e| DeployError::RemoteIo {
        context: format!("flushing {remote}"),
        source: Box::new(e),
    })?;
    Ok(())
}

fn remote_io(context: &str, error: ssh2::Error) -> DeployError {
    DeployError::RemoteIo {
        context: context.to_owned(),
        source: Box::new(error),
    }
}

fn is_no_such_file(error: &ssh2::Error) -> bool {
    // SSH_FX_NO_SUCH_FILE
    matches!(error.code(), ssh2::ErrorCode::SFTP(2))
}

/// Join POSIX path segments without doubling separators.
#[must_use]
pub fn posix_join(base: &str, rest: &str) -> String {
    if base.is_empty() {
        return rest.to_owned();
    }
    if rest.is_empty() {
        return base.to_owned();
    }
    format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'))
}

/// Every cumulative prefix of an absolute POSIX path, shallowest first.
fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    if !path.starts_with('/') {
        // Relative input: strip the leading slash the loop added.
        for prefix in &mut prefixes {
            prefix.remove(0);
        }
    }
    prefixes
}

/// Post-switch verification accepts the exact target or any resolution that
/// ends with it, so relative and absolute inputs both verify.
fn link_target_matches(expected: &str, actual: &str) -> bool {
    actual == expected || actual.ends_with(expected)
}

/// Required space including the 20% safety buffer.
fn required_with_buffer(required_bytes: u64) -> u64 {
    (required_bytes as f64 * 1.2) as u64
}

/// Parse the awk-extracted available-bytes column of `df -B1`.
fn parse_df_output(output: &str) -> Option<u64> {
    output.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_join_handles_slashes() {
        assert_eq!(posix_join("/srv/app", "releases"), "/srv/app/releases");
        assert_eq!(posix_join("/srv/app/", "/releases"), "/srv/app/releases");
        assert_eq!(posix_join("", "releases"), "releases");
        assert_eq!(posix_join("/srv/app", ""), "/srv/app");
    }

    #[test]
    fn path_prefixes_walk_down_from_the_root() {
        assert_eq!(
            path_prefixes("/srv/app/releases"),
            vec!["/srv", "/srv/app", "/srv/app/releases"]
        );
        assert_eq!(path_prefixes("a/b"), vec!["a", "a/b"]);
        assert!(path_prefixes("/").is_empty());
    }

    #[test]
    fn link_verification_accepts_suffix_matches() {
        assert!(link_target_matches(
            "/srv/app/releases/20260131-120000/app",
            "/srv/app/releases/20260131-120000/app"
        ));
        assert!(link_target_matches(
            "releases/20260131-120000/app",
            "/srv/app/releases/20260131-120000/app"
        ));
        assert!(!link_target_matches(
            "/srv/app/releases/20260131-120000/app",
            "/srv/app/releases/20260130-100000/app"
        ));
    }

    #[test]
    fn df_parsing_tolerates_garbage() {
        assert_eq!(parse_df_output(" 52428800\n"), Some(52_428_800));
        assert_eq!(parse_df_output(""), None);
        assert_eq!(parse_df_output("df: not supported"), None);
    }

    #[test]
    fn buffer_is_twenty_percent() {
        assert_eq!(required_with_buffer(100), 120);
        assert_eq!(required_with_buffer(0), 0);
        assert_eq!(required_with_buffer(10 * 1024 * 1024), 12_582_912);
    }

    #[test]
    fn settings_map_empty_strings_to_none() {
        let config = SshConfig {
            host: "h".to_owned(),
            user: "u".to_owned(),
            key_path: String::new(),
            port: 2222,
            known_hosts_file: String::new(),
            use_ssh_agent: true,
        };
        let settings = SshSettings::from_config(&config);
        assert!(settings.key_path.is_none());
        assert!(settings.known_hosts_file.is_none());
        assert_eq!(settings.port, 2222);
    }
}
