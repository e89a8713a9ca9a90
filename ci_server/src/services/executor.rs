//! Local shell agent: checks out the resolved tree and runs each step of the
//! builder's factory as a shell command.
//!
//! Steps run in order; the first non-zero exit fails the build and skips
//! the rest. An abort signal kills the running step.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use ci_engine::models::builder::StepDef;
use ci_engine::{Agent, AgentOutcome, BuildSpec, BuildStatus, Revision};
use serde_json::json;
use tokio::process::Command;
use tokio::sync::watch;

pub struct LocalShellAgent {
    name: String,
    workspace_dir: PathBuf,
    repository: Option<String>,
    step_timeout: Duration,
}

enum StepResult {
    Passed,
    Failed(i32),
    TimedOut,
    Aborted,
    SpawnError(String),
}

impl LocalShellAgent {
    pub fn new(
        name: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
        repository: Option<String>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            workspace_dir: workspace_dir.into(),
            repository,
            step_timeout,
        }
    }

    fn work_dir(&self, spec: &BuildSpec) -> PathBuf {
        self.workspace_dir
            .join(&self.name)
            .join(format!("{}-{}", spec.builder, spec.number))
    }

    fn repository<'a>(&'a self, spec: &'a BuildSpec) -> Option<&'a str> {
        spec.source
            .last_change()
            .map(|c| c.repository.as_str())
            .filter(|r| !r.is_empty())
            .or(self.repository.as_deref())
    }

    /// Clone, move to the resolved revision and apply any patch. Returns
    /// whether a fresh clone was made.
    async fn checkout(&self, spec: &BuildSpec, dir: &Path) -> anyhow::Result<bool> {
        let Some(repository) = self.repository(spec) else {
            tokio::fs::create_dir_all(dir).await?;
            return Ok(false);
        };

        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dir).await?;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = dir.to_string_lossy();
        let mut clone = vec!["clone", "--quiet"];
        if let Some(ref branch) = spec.tree.branch {
            clone.extend(["--branch", branch.as_str()]);
        }
        clone.extend([repository, &*target]);
        git(None, &clone).await.context("git clone failed")?;

        let revision = match spec.tree.revision {
            Revision::Hash(ref hash) => hash.clone(),
            Revision::Timestamp(at) => {
                let before = format!("--before={}", at.to_rfc3339());
                let found = git(Some(dir), &["rev-list", "-n", "1", &before, "HEAD"])
                    .await
                    .context("git rev-list failed")?;
                if found.is_empty() {
                    anyhow::bail!("no commit before {at}");
                }
                found
            }
            Revision::Number(n) => anyhow::bail!("git has no numbered revision {n}"),
        };
        git(Some(dir), &["checkout", "--quiet", &revision])
            .await
            .with_context(|| format!("git checkout {revision} failed"))?;

        if let Some(ref patch) = spec.source.patch {
            let file = dir.join(".ci-try.patch");
            tokio::fs::write(&file, &patch.diff).await?;
            let level = format!("-p{}", patch.level);
            let file = file.to_string_lossy();
            let mut apply = vec!["apply", level.as_str()];
            let directory = patch.subdir.as_ref().map(|s| format!("--directory={s}"));
            if let Some(ref directory) = directory {
                apply.push(directory.as_str());
            }
            apply.push(&*file);
            git(Some(dir), &apply).await.context("git apply failed")?;
        }
        Ok(true)
    }

    async fn run_step(
        &self,
        step: &StepDef,
        spec: &BuildSpec,
        dir: &Path,
        timeout: Duration,
        abort: &mut watch::Receiver<bool>,
    ) -> StepResult {
        let mut command = Command::new("bash");
        command
            .args(["-c", &step.command])
            .current_dir(dir)
            .env("CI", "true")
            .env("CI_BUILD_ID", spec.build_id.to_string())
            .env("CI_BUILD_NUMBER", spec.number.to_string())
            .env("CI_BUILDER", &spec.builder)
            .env("CI_BRANCH", spec.tree.branch.as_deref().unwrap_or_default())
            .env("CI_COMMIT", spec.tree.revision.to_string())
            .kill_on_drop(true);
        for (key, value) in &spec.properties {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            command.env(format!("CI_PROP_{}", env_key(key)), value);
        }

        tracing::info!(
            build_id = %spec.build_id,
            step = %step.name,
            command = %step.command,
            "Running step"
        );

        tokio::select! {
            output = tokio::time::timeout(timeout, command.output()) => match output {
                Ok(Ok(output)) if output.status.success() => StepResult::Passed,
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::debug!(build_id = %spec.build_id, step = %step.name, "{}", tail(&stderr));
                    StepResult::Failed(output.status.code().unwrap_or(-1))
                }
                Ok(Err(e)) => StepResult::SpawnError(format!("Failed to execute command: {e}")),
                Err(_) => StepResult::TimedOut,
            },
            _ = aborted(abort) => StepResult::Aborted,
        }
    }
}

#[async_trait]
impl Agent for LocalShellAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_build(&self, spec: BuildSpec, mut abort: watch::Receiver<bool>) -> AgentOutcome {
        let dir = self.work_dir(&spec);
        let build_start = Instant::now();
        tracing::info!(
            build_id = %spec.build_id,
            builder = %spec.builder,
            agent = %self.name,
            revision = %spec.tree.revision,
            "Executing build"
        );

        let cloned = match self.checkout(&spec, &dir).await {
            Ok(cloned) => cloned,
            Err(e) => {
                tracing::error!(build_id = %spec.build_id, "Checkout failed: {e:#}");
                let mut outcome = AgentOutcome::new(BuildStatus::InfraError);
                outcome
                    .properties
                    .insert("checkout_error".into(), json!(format!("{e:#}")));
                return outcome;
            }
        };

        let timeout = spec
            .factory
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.step_timeout);
        let mut outcome = AgentOutcome::new(BuildStatus::Success);
        let mut steps_run = 0u32;

        for step in &spec.factory.steps {
            if *abort.borrow() {
                outcome.status = BuildStatus::Failure;
                outcome.properties.insert("aborted".into(), json!(true));
                break;
            }
            steps_run += 1;
            let step_start = Instant::now();
            let result = self.run_step(step, &spec, &dir, timeout, &mut abort).await;
            let step_ms = step_start.elapsed().as_millis() as u64;
            crate::metrics::step_duration(&step.name, step_ms);

            let status = match result {
                StepResult::Passed => {
                    tracing::info!(
                        build_id = %spec.build_id,
                        step = %step.name,
                        duration_ms = step_ms,
                        "Step passed"
                    );
                    continue;
                }
                StepResult::Failed(exit_code) => {
                    tracing::warn!(build_id = %spec.build_id, step = %step.name, exit_code, "Step failed");
                    BuildStatus::Failure
                }
                StepResult::TimedOut => {
                    tracing::warn!(
                        build_id = %spec.build_id,
                        step = %step.name,
                        "Step timed out after {}s",
                        timeout.as_secs()
                    );
                    BuildStatus::Failure
                }
                // Operator aborts count as failures.
                StepResult::Aborted => {
                    tracing::info!(build_id = %spec.build_id, step = %step.name, "Step aborted");
                    outcome.properties.insert("aborted".into(), json!(true));
                    BuildStatus::Failure
                }
                StepResult::SpawnError(msg) => {
                    tracing::error!(build_id = %spec.build_id, step = %step.name, "{msg}");
                    BuildStatus::InfraError
                }
            };
            outcome.status = status;
            outcome
                .properties
                .insert("failed_step".into(), json!(step.name));
            break;
        }

        outcome.properties.insert("steps_run".into(), json!(steps_run));
        outcome.properties.insert(
            "agent_duration_ms".into(),
            json!(build_start.elapsed().as_millis() as u64),
        );

        if cloned {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
        outcome
    }
}

async fn git(dir: Option<&Path>, args: &[&str]) -> anyhow::Result<String> {
    let mut command = Command::new("git");
    command.args(args).kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    let output = command.output().await?;
    if !output.status.success() {
        anyhow::bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolves once the abort flag is raised. Never resolves if the sender is
/// gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Last 4KB of step output, for logs.
fn tail(text: &str) -> &str {
    const LIMIT: usize = 4096;
    if text.len() <= LIMIT {
        return text;
    }
    let mut start = text.len() - LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
