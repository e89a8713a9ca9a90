//! Server configuration: loaded from environment variables.

use std::collections::BTreeSet;

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// GitHub personal access token for commit status updates.
    pub github_token: String,
    /// Endpoint that receives build set notices as JSON.
    pub notify_url: Option<String>,
    /// Added to the interested users of every build set notice.
    pub extra_recipients: BTreeSet<String>,
    /// Repository used when a change does not name one.
    pub repository_url: Option<String>,
    /// Root directory for agent checkouts.
    pub workspace_dir: String,
    /// Default per-step timeout in seconds.
    pub step_timeout_secs: u64,
    /// Overrides the engine config's build set horizon.
    pub build_set_horizon: Option<usize>,
    /// Dashboard base URL for GitHub status links.
    pub dashboard_url: String,
}

impl CiConfig {
    pub fn from_env() -> Self {
        let github_webhook_secret = std::env::var("CI_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = std::env::var("CI_GITHUB_TOKEN").unwrap_or_default();
        let notify_url = std::env::var("CI_NOTIFY_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let extra_recipients = std::env::var("CI_EXTRA_RECIPIENTS")
            .map(|s| parse_recipients(&s))
            .unwrap_or_default();
        let repository_url = std::env::var("CI_REPOSITORY_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let workspace_dir =
            std::env::var("CI_WORKSPACE_DIR").unwrap_or_else(|_| "/tmp/ci-workspace".to_string());
        let step_timeout_secs = std::env::var("CI_STEP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);
        let build_set_horizon = std::env::var("CI_BUILD_SET_HORIZON")
            .ok()
            .and_then(|s| s.parse().ok());
        let dashboard_url = std::env::var("CI_DASHBOARD_URL")
            .unwrap_or_else(|_| "http://localhost:9090/ci".to_string());

        if github_webhook_secret.is_empty() {
            tracing::warn!("CI_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github_token.is_empty() {
            tracing::warn!("CI_GITHUB_TOKEN not set -- GitHub status updates disabled");
        }
        if repository_url.is_none() {
            tracing::warn!("CI_REPOSITORY_URL not set -- changes must name their repository");
        }

        Self {
            github_webhook_secret,
            github_token,
            notify_url,
            extra_recipients,
            repository_url,
            workspace_dir,
            step_timeout_secs,
            build_set_horizon,
            dashboard_url,
        }
    }
}

fn parse_recipients(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
impl CiConfig {
    /// Config for route tests: no secret, no outbound hooks.
    pub fn for_tests() -> Self {
        Self {
            github_webhook_secret: String::new(),
            github_token: String::new(),
            notify_url: None,
            extra_recipients: BTreeSet::new(),
            repository_url: None,
            workspace_dir: "/tmp/ci-test".to_string(),
            step_timeout_secs: 5,
            build_set_horizon: None,
            dashboard_url: "http://localhost:9090/ci".to_string(),
        }
    }
}
