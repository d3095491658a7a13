//! Implementation of `versa rollback`.

use std::path::Path;

use tracing::info;

use versa_core::DeployResult;

use super::load_environment;

pub async fn run(config_path: &Path, environment: &str) -> DeployResult<()> {
    let (_, env) = load_environment(config_path, environment)?;
    info!(environment = %environment, "rolling back");

    let release = versa_deploy::rollback(&env).await?;
    println!("Rolled back to {release}");
    Ok(())
}
