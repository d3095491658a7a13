//! CLI command implementations.

pub mod deploy;
pub mod init;
pub mod rollback;
pub mod ssh_test;
pub mod status;
pub mod version;

use std::path::Path;

use versa_core::{Config, DeployResult, Environment};

/// Load the configuration and clone out one environment.
pub fn load_environment(config_path: &Path, name: &str) -> DeployResult<(Config, Environment)> {
    let config = Config::load(config_path)?;
    let environment = config.environment(name)?.clone();
    Ok((config, environment))
}
