//! Implementation of `versa deploy`.

use std::path::Path;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use versa_core::DeployResult;
use versa_deploy::{DeployOptions, DeployOutcome, Deployer, ProgressFactory};
use versa_remote::ProgressFn;

use super::load_environment;

pub async fn run(config_path: &Path, environment: &str, options: DeployOptions) -> DeployResult<()> {
    let (config, env) = load_environment(config_path, environment)?;
    info!(project = %config.project, environment = %environment, "deploying");

    let repo_path = std::env::current_dir()?;

    let progress: ProgressFactory = Arc::new(|total_bytes: u64| -> ProgressFn {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(ProgressStyle::default_bar());
        bar.set_message("uploading");
        Arc::new(move |bytes| {
            bar.inc(bytes);
            if bar.position() >= bar.length().unwrap_or(u64::MAX) {
                bar.finish_with_message("uploaded");
            }
        })
    });

    let deployer = Deployer::new(environment, env, repo_path, options).with_progress(progress);

    match deployer.deploy().await? {
        DeployOutcome::NoChanges => println!("No changes detected - nothing to deploy."),
        DeployOutcome::DryRun => println!("Dry run complete - no changes were made."),
        DeployOutcome::Deployed { release } => println!("Deployment successful: {release}"),
    }
    Ok(())
}
