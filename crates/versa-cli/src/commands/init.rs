//! Implementation of `versa init`.

use std::path::Path;

use versa_core::{DeployError, DeployResult};

const CONFIG_FILE: &str = "deploy.yml";

const TEMPLATE: &str = r#"project: "my-versa-project"

environments:
  production:
    ssh:
      host: "server.example.com"
      user: "deploy"
      key_path: "~/.ssh/id_rsa"
      port: 22
      known_hosts_file: "~/.ssh/known_hosts"
      use_ssh_agent: false

    remote_path: "/var/www/app"

    # Timeout for each post_deploy hook in seconds (optional, default: 300)
    hook_timeout: 300

    # Files that trigger route cache regeneration
    route_files:
      - "app/routes.php"

    # Prefixes excluded from change tracking (critical extensions are
    # still hashed even under these)
    ignored_paths:
      - ".git"
      - "tests"
      - "var/cache"
      - "node_modules/.cache"

    # Directories persisted across releases via symlinks into shared/
    shared_paths:
      - "app/storage"

    # Files restored from the previous release instead of the artifact
    preserved_paths:
      - "app/.env"

    builds:
      php:
        enabled: true
        composer_command: "composer install --no-dev --optimize-autoloader"

      go:
        enabled: false
        target_os: "linux"
        target_arch: "amd64"
        binary_name: "app"

      frontend:
        enabled: true
        npm_command: "npm ci" # or "pnpm install", "yarn install"
        compile_command: "npm run prod" # use {file} to compile changed files individually

    # Hooks run on the remote after the symlink switch
    post_deploy:
      - "php bin/console cache:clear"
      - parallel:
          - "php bin/console routes:dump"
          - "php bin/console twig:clear-cache"
"#;

pub fn run() -> DeployResult<()> {
    if Path::new(CONFIG_FILE).exists() {
        return Err(DeployError::ConfigInvalid {
            message: format!("{CONFIG_FILE} already exists"),
            hint: "Remove or rename the existing file before running init.".to_owned(),
        });
    }

    std::fs::write(CONFIG_FILE, TEMPLATE)?;

    println!("Initialised versa. Created {CONFIG_FILE}.");
    println!("Edit it to match your server, then run: versa deploy production --initial-deploy");
    Ok(())
}
