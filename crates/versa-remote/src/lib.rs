//! SSH/SFTP remote session for the versa deployment engine.
//!
//! One authenticated session per deployment run. Shell commands constructed
//! here always pass user-derived paths through POSIX quoting; see
//! `versa_core::shell`.

mod session;

pub use session::{posix_join, ProgressFn, RemoteSession, SshSettings};
