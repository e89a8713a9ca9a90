//! Engine config loading, shared by startup and SIGHUP reloads.
//!
//! A reload that fails to read, parse or validate leaves the running
//! configuration untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ci_engine::{BuildMaster, MasterConfig, MasterSetup};

use crate::config::CiConfig;
use crate::services::executor::LocalShellAgent;

/// Read the engine config and apply the environment's overrides.
pub fn load_setup(path: Option<&Path>, ci_config: &CiConfig) -> anyhow::Result<MasterSetup> {
    let mut engine_config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading engine config {}", path.display()))?;
            MasterConfig::from_json(&text)
                .with_context(|| format!("parsing engine config {}", path.display()))?
        }
        None => {
            tracing::warn!("No engine config given -- starting with no builders");
            MasterConfig::default()
        }
    };
    engine_config
        .extra_recipients
        .extend(ci_config.extra_recipients.iter().cloned());
    if let Some(horizon) = ci_config.build_set_horizon {
        engine_config.build_set_horizon = Some(horizon);
    }
    engine_config
        .into_setup()
        .context("validating engine config")
}

/// Attach a local shell agent to every declared agent that has none.
pub fn attach_local_agents(master: &BuildMaster, ci_config: &CiConfig) -> anyhow::Result<()> {
    let step_timeout = Duration::from_secs(ci_config.step_timeout_secs);
    for status in master.agents().into_iter().filter(|a| !a.attached) {
        let agent = LocalShellAgent::new(
            status.name.clone(),
            &ci_config.workspace_dir,
            ci_config.repository_url.clone(),
            step_timeout,
        );
        master
            .attach_agent(Arc::new(agent))
            .with_context(|| format!("attaching agent {}", status.name))?;
    }
    Ok(())
}

/// Re-read the config file and hand it to the build master.
pub async fn reload(
    master: &BuildMaster,
    path: Option<&Path>,
    ci_config: &CiConfig,
) -> anyhow::Result<()> {
    let Some(path) = path else {
        anyhow::bail!("no engine config file to reload");
    };
    let setup = load_setup(Some(path), ci_config)?;
    master
        .reconfigure(setup)
        .await
        .context("applying engine config")?;
    attach_local_agents(master, ci_config)?;
    tracing::info!(path = %path.display(), "Engine config reloaded");
    Ok(())
}

/// Reload the engine config on every SIGHUP.
#[cfg(unix)]
pub fn spawn_reload_on_hangup(
    master: Arc<BuildMaster>,
    path: Option<PathBuf>,
    ci_config: CiConfig,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(hangups) => hangups,
            Err(e) => {
                tracing::error!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };
        while hangups.recv().await.is_some() {
            tracing::info!("Received SIGHUP, reloading engine config...");
            if let Err(e) = reload(&master, path.as_deref(), &ci_config).await {
                tracing::error!("Config reload failed, keeping the running config: {e:#}");
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_on_hangup(
    _master: Arc<BuildMaster>,
    _path: Option<PathBuf>,
    _ci_config: CiConfig,
) {
}
