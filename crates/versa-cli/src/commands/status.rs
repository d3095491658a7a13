//! Implementation of `versa status`.

use std::path::Path;

use versa_core::DeployResult;

use super::load_environment;

pub async fn run(config_path: &Path, environment: &str) -> DeployResult<()> {
    let (_, env) = load_environment(config_path, environment)?;

    let report = versa_deploy::status(&env).await?;

    match &report.current {
        Some(current) => println!("Current release: {current}"),
        None => {
            println!("No active deployment");
            return Ok(());
        }
    }

    println!("Available releases: {}", report.releases.len());
    for release in &report.releases {
        let marker = if Some(release) == report.current.as_ref() {
            "→"
        } else {
            " "
        };
        println!("  {marker} {release}");
    }
    Ok(())
}
