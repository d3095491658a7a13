//! Build orchestration.
//!
//! The orchestrator mirrors the snapshot into `artifact/app/`, runs each
//! enabled build engine in parallel against that mirror, then strips the
//! configured ignored paths so the release payload stays lean. No engine
//! ever runs on the target host.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use versa_core::shell::sh_quote;
use versa_core::{DeployError, DeployResult, Engine, Environment};

use crate::changeset::ChangeSet;

/// What the build stage actually did; becomes `changes_applied` in the
/// artifact manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Number of changed PHP files carried by this release.
    pub php_files_changed: usize,
    /// The Go binary was recompiled.
    pub go_binary_rebuilt: bool,
    /// Number of front-end compile runs.
    pub frontend_compiled: usize,
    /// composer install ran.
    pub composer_updated: bool,
    /// npm install ran.
    pub npm_updated: bool,
    /// Changed templates require a cache cleanup hook.
    pub twig_cache_cleanup: bool,
    /// A route file changed; caches must be regenerated.
    pub route_cache_regenerate: bool,
}

enum EngineOutcome {
    Php { composer_updated: bool },
    Go { rebuilt: bool },
    Frontend { compiled: usize, npm_updated: bool },
}

/// Runs the build engines for one release.
pub struct Orchestrator {
    snapshot_root: PathBuf,
    artifact_dir: PathBuf,
    env: Arc<Environment>,
    changes: Arc<ChangeSet>,
}

impl Orchestrator {
    /// Create an orchestrator over a snapshot and an empty artifact directory.
    #[must_use]
    pub fn new(
        snapshot_root: impl Into<PathBuf>,
        artifact_dir: impl Into<PathBuf>,
        env: Arc<Environment>,
        changes: Arc<ChangeSet>,
    ) -> Self {
        Self {
            snapshot_root: snapshot_root.into(),
            artifact_dir: artifact_dir.into(),
            env,
            changes,
        }
    }

    /// Mirror, build, clean up. Any engine failure aborts the run; engines
    /// already in flight finish but their results are discarded.
    #[instrument(skip(self), fields(artifact = %self.artifact_dir.display()))]
    pub async fn build(&self) -> DeployResult<BuildReport> {
        info!("mirroring snapshot into artifact");
        self.mirror_snapshot().await?;

        let mut report = BuildReport {
            php_files_changed: self.changes.php_files.len(),
            twig_cache_cleanup: !self.changes.twig_files.is_empty(),
            route_cache_regenerate: self.changes.routes_changed,
            ..BuildReport::default()
        };

        let mut set = JoinSet::new();

        if self.env.builds.php.enabled {
            let env = Arc::clone(&self.env);
            let changes = Arc::clone(&self.changes);
            let artifact_dir = self.artifact_dir.clone();
            set.spawn(async move { build_php(&artifact_dir, &env, &changes).await });
        }

        if self.env.builds.go.enabled {
            let env = Arc::clone(&self.env);
            let changes = Arc::clone(&self.changes);
            let artifact_dir = self.artifact_dir.clone();
            set.spawn(async move { build_go(&artifact_dir, &env, &changes).await });
        }

        if self.env.builds.frontend.enabled {
            let env = Arc::clone(&self.env);
            let changes = Arc::clone(&self.changes);
            let artifact_dir = self.artifact_dir.clone();
            set.spawn(async move { build_frontend(&artifact_dir, &env, &changes).await });
        }

        // Drain every engine before surfacing the first failure so no task
        // is left mutating the artifact tree.
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(DeployError::Internal(format!("engine task failed: {e}"))),
            };
            match outcome {
                Ok(EngineOutcome::Php { composer_updated }) => {
                    report.composer_updated = composer_updated;
                }
                Ok(EngineOutcome::Go { rebuilt }) => report.go_binary_rebuilt = rebuilt,
                Ok(EngineOutcome::Frontend {
                    compiled,
                    npm_updated,
                }) => {
                    report.frontend_compiled = compiled;
                    report.npm_updated = npm_updated;
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!("removing ignored paths from artifact");
        self.cleanup_ignored_paths().await?;

        Ok(report)
    }

    /// Stage 0: copy the snapshot to `artifact/app/`, following symlinks by
    /// value and skipping irregular entries. `.git` is never copied.
    async fn mirror_snapshot(&self) -> DeployResult<()> {
        let src = self.snapshot_root.clone();
        let app_dir = self.artifact_dir.join("app");
        tokio::task::spawn_blocking(move || mirror_tree(&src, &app_dir))
            .await
            .map_err(|e| DeployError::Internal(format!("mirror task failed: {e}")))?
    }

    /// Stage 2: drop every configured ignored path from `artifact/app/`.
    /// Build outputs produced inside the artifact (vendor, node_modules)
    /// are left alone unless explicitly listed.
    async fn cleanup_ignored_paths(&self) -> DeployResult<()> {
        let app_dir = self.artifact_dir.join("app");
        for ignored in &self.env.ignored_paths {
            if ignored == ".git" {
                continue;
            }
            let path = app_dir.join(ignored);
            let Ok(metadata) = tokio::fs::symlink_metadata(&path).await else {
                continue;
            };
            debug!(path = %path.display(), "removing ignored path");
            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

fn mirror_tree(src: &Path, dest: &Path) -> DeployResult<()> {
    std::fs::create_dir_all(dest)?;

    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == ".git"));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Dangling symlinks and loops cannot be mirrored by value.
                warn!(error = %e, "skipping unreadable entry during mirror");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DeployError::Internal(format!("mirror escaped source root: {e}")))?;
        let target = dest.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            if let Ok(metadata) = entry.metadata() {
                let _ = std::fs::set_permissions(&target, metadata.permissions());
            }
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            warn!(path = %entry.path().display(), "skipping irregular entry during mirror");
        }
    }

    Ok(())
}

async fn build_php(
    artifact_dir: &Path,
    env: &Environment,
    changes: &ChangeSet,
) -> DeployResult<EngineOutcome> {
    let mut composer_updated = false;

    if changes.composer_changed {
        let work_dir = artifact_dir.join("app").join(&env.builds.php.project_root);
        info!(dir = %work_dir.display(), "running composer install");

        let output = run_shell(&env.builds.php.composer_command, &work_dir, &[]).await?;
        if !output.status.success() {
            return Err(build_failed(
                Engine::Php,
                "composer command failed",
                &output,
                "Check composer.json and ensure the install is reproducible locally.",
            ));
        }
        composer_updated = true;
    }

    Ok(EngineOutcome::Php { composer_updated })
}

async fn build_go(
    artifact_dir: &Path,
    env: &Environment,
    changes: &ChangeSet,
) -> DeployResult<EngineOutcome> {
    let go = &env.builds.go;
    if !changes.go_mod_changed && changes.go_files.is_empty() {
        return Ok(EngineOutcome::Go { rebuilt: false });
    }

    let binary_path = artifact_dir.join("bin").join(&go.binary_name);
    if let Some(parent) = binary_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut command = String::from("go build");
    if !go.build_flags.is_empty() {
        command.push(' ');
        command.push_str(&go.build_flags);
    }
    command.push_str(" -o ");
    command.push_str(&sh_quote(&binary_path.to_string_lossy()));

    let work_dir = artifact_dir.join("app").join(&go.project_root);
    info!(dir = %work_dir.display(), goos = %go.target_os, goarch = %go.target_arch, "cross-compiling go binary");

    let envs = [
        ("GOOS".to_owned(), go.target_os.clone()),
        ("GOARCH".to_owned(), go.target_arch.clone()),
    ];
    let output = run_shell(&command, &work_dir, &envs).await?;
    if !output.status.success() {
        return Err(build_failed(
            Engine::Go,
            "go build failed",
            &output,
            "Check the Go sources for compilation errors and ensure all dependencies resolve.",
        ));
    }

    if !binary_path.exists() {
        return Err(DeployError::BuildFailed {
            engine: Engine::Go,
            message: format!("go build produced no binary at {}", binary_path.display()),
            hint: "Verify builds.go.binary_name and the build flags.".to_owned(),
        });
    }

    Ok(EngineOutcome::Go { rebuilt: true })
}

async fn build_frontend(
    artifact_dir: &Path,
    env: &Environment,
    changes: &ChangeSet,
) -> DeployResult<EngineOutcome> {
    let fe = &env.builds.frontend;
    let work_dir = artifact_dir.join("app").join(&fe.project_root);
    let node_modules = work_dir.join("node_modules");

    let needs_install = changes.package_changed
        || (!changes.frontend_files.is_empty() && !node_modules.exists());

    let mut npm_updated = false;
    if needs_install {
        info!(dir = %work_dir.display(), "running front-end install");
        let output = run_shell(&fe.npm_command, &work_dir, &[]).await?;
        if !output.status.success() {
            return Err(build_failed(
                Engine::Frontend,
                "front-end install failed",
                &output,
                "Check package.json and ensure the package manager is installed.",
            ));
        }
        npm_updated = true;
    }

    let mut compiled = 0;
    if fe.compile_command.contains("{file}") {
        // Per-file mode: one run per changed source.
        for file in &changes.frontend_files {
            let command = fe.compile_command.replace("{file}", file);
            debug!(file = %file, "compiling front-end file");
            let output = run_shell(&command, &work_dir, &[]).await?;
            if !output.status.success() {
                return Err(build_failed(
                    Engine::Frontend,
                    &format!("compile failed for {file}"),
                    &output,
                    "Check builds.frontend.compile_command against this file type.",
                ));
            }
            compiled += 1;
        }
    } else if !changes.frontend_files.is_empty() {
        info!(dir = %work_dir.display(), "compiling front end");
        let output = run_shell(&fe.compile_command, &work_dir, &[]).await?;
        if !output.status.success() {
            return Err(build_failed(
                Engine::Frontend,
                "front-end compile failed",
                &output,
                "Check builds.frontend.compile_command.",
            ));
        }
        compiled = changes.frontend_files.len();
    }

    if fe.cleanup_dev_deps && changes.package_changed {
        info!("replacing node_modules with a production-only install");
        if node_modules.exists() {
            tokio::fs::remove_dir_all(&node_modules).await?;
        }
        let output = run_shell(&fe.production_command, &work_dir, &[]).await?;
        if !output.status.success() {
            return Err(build_failed(
                Engine::Frontend,
                "production install failed",
                &output,
                "Check builds.frontend.production_command.",
            ));
        }
    }

    Ok(EngineOutcome::Frontend {
        compiled,
        npm_updated,
    })
}

/// Run a command line through `sh -c` in `dir`, capturing all output.
async fn run_shell(
    command: &str,
    dir: &Path,
    envs: &[(String, String)],
) -> DeployResult<Output> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(dir);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.output()
        .await
        .map_err(|e| DeployError::Internal(format!("failed to spawn '{command}': {e}")))
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    text
}

fn build_failed(engine: Engine, context: &str, output: &Output, hint: &str) -> DeployError {
    DeployError::BuildFailed {
        engine,
        message: format!("{context}: {}", combined_output(output).trim()),
        hint: hint.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versa_core::Config;

    fn test_env(yaml: &str) -> Environment {
        let mut config: Config = parse_yaml(yaml);
        config.validate().unwrap();
        config.environments.remove("test").unwrap()
    }

    fn parse_yaml(yaml: &str) -> Config {
        use figment::providers::{Format, Yaml};
        figment::Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap()
    }

    fn base_yaml(extra_builds: &str) -> String {
        format!(
            r#"
project: "demo"
environments:
  test:
    ssh:
      host: "h"
      user: "u"
      use_ssh_agent: true
    remote_path: "/srv/app"
    builds:
{extra_builds}
"#
        )
    }

    fn changes_with_php(files: &[&str]) -> ChangeSet {
        ChangeSet {
            php_files: files.iter().map(|s| (*s).to_owned()).collect(),
            ..ChangeSet::default()
        }
    }

    #[tokio::test]
    async fn mirror_copies_tree_and_skips_git() {
        let snapshot = tempfile::TempDir::new().unwrap();
        let artifact = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(snapshot.path().join("src")).unwrap();
        std::fs::write(snapshot.path().join("src/app.php"), "<?php").unwrap();
        std::fs::create_dir_all(snapshot.path().join(".git")).unwrap();
        std::fs::write(snapshot.path().join(".git/HEAD"), "ref").unwrap();

        let env = test_env(&base_yaml("      php:\n        enabled: true\n"));
        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact.path(),
            Arc::new(env),
            Arc::new(changes_with_php(&["src/app.php"])),
        );
        let report = orchestrator.build().await.unwrap();

        assert!(artifact.path().join("app/src/app.php").exists());
        assert!(!artifact.path().join("app/.git").exists());
        assert_eq!(report.php_files_changed, 1);
        assert!(!report.composer_updated, "composer.json did not change");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mirror_follows_symlinks_by_value() {
        let snapshot = tempfile::TempDir::new().unwrap();
        let artifact = tempfile::TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("real.txt"), "contents").unwrap();
        std::os::unix::fs::symlink("real.txt", snapshot.path().join("alias.txt")).unwrap();
        std::os::unix::fs::symlink("missing.txt", snapshot.path().join("dangling.txt")).unwrap();

        let env = test_env(&base_yaml("      php:\n        enabled: true\n"));
        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact.path(),
            Arc::new(env),
            Arc::new(ChangeSet::default()),
        );
        orchestrator.build().await.unwrap();

        let alias = artifact.path().join("app/alias.txt");
        assert!(alias.is_file());
        assert!(!alias.is_symlink(), "symlinks are flattened by value");
        assert_eq!(std::fs::read_to_string(alias).unwrap(), "contents");
        assert!(!artifact.path().join("app/dangling.txt").exists());
    }

    #[tokio::test]
    async fn ignored_paths_are_removed_after_build() {
        let snapshot = tempfile::TempDir::new().unwrap();
        let artifact = tempfile::TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("index.php"), "<?php").unwrap();
        std::fs::create_dir_all(snapshot.path().join("tests")).unwrap();
        std::fs::write(snapshot.path().join("tests/a_test.php"), "<?php").unwrap();

        let env = test_env(&base_yaml("      php:\n        enabled: true\n"));
        assert!(env.ignored_paths.contains(&"tests".to_owned()));

        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact.path(),
            Arc::new(env),
            Arc::new(ChangeSet::default()),
        );
        orchestrator.build().await.unwrap();

        assert!(artifact.path().join("app/index.php").exists());
        assert!(!artifact.path().join("app/tests").exists());
    }

    #[tokio::test]
    async fn failing_engine_surfaces_output() {
        let snapshot = tempfile::TempDir::new().unwrap();
        let artifact = tempfile::TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("composer.json"), "{}").unwrap();

        let yaml = base_yaml(
            "      php:\n        enabled: true\n        composer_command: \"echo dependency hell >&2; exit 3\"\n",
        );
        let env = test_env(&yaml);

        let changes = ChangeSet {
            composer_changed: true,
            ..ChangeSet::default()
        };
        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact.path(),
            Arc::new(env),
            Arc::new(changes),
        );
        let err = orchestrator.build().await.unwrap_err();

        assert_eq!(err.code(), "BUILD_FAILED");
        assert!(err.to_string().contains("dependency hell"));
    }

    #[tokio::test]
    async fn frontend_per_file_mode_substitutes_each_path() {
        let snapshot = tempfile::TempDir::new().unwrap();
        let artifact = tempfile::TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("a.ts"), "x").unwrap();
        std::fs::write(snapshot.path().join("b.ts"), "y").unwrap();

        let yaml = base_yaml(
            "      frontend:\n        enabled: true\n        compile_command: \"echo {file} >> compiled.log\"\n        npm_command: \"true\"\n",
        );
        let env = test_env(&yaml);

        let changes = ChangeSet {
            frontend_files: vec!["a.ts".to_owned(), "b.ts".to_owned()],
            ..ChangeSet::default()
        };
        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact.path(),
            Arc::new(env),
            Arc::new(changes),
        );
        let report = orchestrator.build().await.unwrap();

        assert_eq!(report.frontend_compiled, 2);
        assert!(report.npm_updated, "node_modules was absent, install ran");
        let log = std::fs::read_to_string(artifact.path().join("app/compiled.log")).unwrap();
        assert_eq!(log, "a.ts\nb.ts\n");
    }

    #[tokio::test]
    async fn go_engine_skips_when_nothing_changed() {
        let snapshot = tempfile::TempDir::new().unwrap();
        let artifact = tempfile::TempDir::new().unwrap();

        let yaml = base_yaml(
            "      go:\n        enabled: true\n        target_os: \"linux\"\n        target_arch: \"amd64\"\n        binary_name: \"app\"\n",
        );
        let env = test_env(&yaml);

        let orchestrator = Orchestrator::new(
            snapshot.path(),
            artifact.path(),
            Arc::new(env),
            Arc::new(ChangeSet::default()),
        );
        let report = orchestrator.build().await.unwrap();
        assert!(!report.go_binary_rebuilt);
        assert!(!artifact.path().join("bin").exists());
    }
}
