//! Shared types for the versa deployment engine.
//!
//! This crate carries the pieces every other crate needs: the error
//! taxonomy, the deploy.yml configuration model and the release version
//! type. It has no knowledge of git, SSH or the build engines.

pub mod config;
pub mod error;
pub mod release;
pub mod shell;

pub use config::{
    BuildsConfig, Config, Environment, FrontendBuildConfig, GoBuildConfig, HookEntry,
    PhpBuildConfig, SshConfig, DEFAULT_HOOK_TIMEOUT_SECS,
};
pub use error::{DeployError, DeployResult, Engine};
pub use release::ReleaseVersion;
