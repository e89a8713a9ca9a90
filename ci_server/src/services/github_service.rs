//! GitHub integration: webhook validation and commit status updates.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// A commit status as accepted by the GitHub statuses API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

/// Post a commit status to GitHub.
pub async fn post_status(
    client: &reqwest::Client,
    token: &str,
    repo: &str,
    sha: &str,
    state: CommitState,
    description: &str,
    target_url: &str,
) -> anyhow::Result<()> {
    if token.is_empty() {
        tracing::debug!("GitHub token not set, skipping status update");
        return Ok(());
    }

    let url = format!("https://api.github.com/repos/{repo}/statuses/{sha}");
    let body = serde_json::json!({
        "state": state.as_str(),
        "description": description,
        "target_url": target_url,
        "context": "centrix-ci",
    });

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "centrix-ci")
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!("GitHub status update failed: {} {}", status, text);
    }

    Ok(())
}

/// `owner/name` from a GitHub clone or web URL.
pub fn repo_full_name(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("git@github.com:"))?;
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    (rest.split('/').count() == 2).then_some(rest)
}
