//! Notification collaborators: structured log lines, a JSON webhook, and
//! GitHub commit statuses.

use async_trait::async_trait;
use ci_engine::events::build_set::BuildSetNotice;
use ci_engine::{BuildSetStatus, Notifier, Revision};
use serde::Serialize;

use super::github_service::{self, CommitState};

/// Logs every notice; always installed.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn first_failure(&self, notice: &BuildSetNotice) {
        tracing::warn!(
            build_set_id = %notice.build_set_id,
            builder = notice.failed_builder.as_deref().unwrap_or_default(),
            blamelist = ?notice.blamelist,
            "Build set failing"
        );
    }

    async fn finished(&self, notice: &BuildSetNotice) {
        tracing::info!(
            build_set_id = %notice.build_set_id,
            status = notice.status.as_str(),
            interested_users = ?notice.interested_users,
            "Build set complete"
        );
    }
}

#[derive(Serialize)]
struct HookPayload<'a> {
    event: &'static str,
    notice: &'a BuildSetNotice,
}

/// POSTs each notice as JSON to `CI_NOTIFY_URL`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn post(&self, event: &'static str, notice: &BuildSetNotice) {
        let payload = HookPayload { event, notice };
        let result = self
            .client
            .post(&self.url)
            .header("User-Agent", "centrix-ci")
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = result {
            crate::metrics::notification_failed("webhook");
            tracing::warn!(build_set_id = %notice.build_set_id, event, "Notification hook failed: {e}");
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn first_failure(&self, notice: &BuildSetNotice) {
        self.post("first_failure", notice).await;
    }

    async fn finished(&self, notice: &BuildSetNotice) {
        self.post("finished", notice).await;
    }
}

/// Posts the build set verdict as a commit status on the newest change.
pub struct GitHubStatusNotifier {
    client: reqwest::Client,
    token: String,
    dashboard_url: String,
    default_repository: Option<String>,
}

impl GitHubStatusNotifier {
    pub fn new(
        client: reqwest::Client,
        token: impl Into<String>,
        dashboard_url: impl Into<String>,
        default_repository: Option<String>,
    ) -> Self {
        Self {
            client,
            token: token.into(),
            dashboard_url: dashboard_url.into(),
            default_repository,
        }
    }

    /// Repository and commit the notice is about, when both are known.
    fn target<'a>(&'a self, notice: &'a BuildSetNotice) -> Option<(&'a str, &'a str)> {
        let source = &notice.source;
        let last = source.last_change();
        let sha = match (&source.revision, last.and_then(|c| c.revision.as_ref())) {
            (Some(Revision::Hash(sha)), _) | (None, Some(Revision::Hash(sha))) => sha.as_str(),
            _ => return None,
        };
        let url = last
            .map(|c| c.repository.as_str())
            .filter(|r| !r.is_empty())
            .or(self.default_repository.as_deref())?;
        Some((github_service::repo_full_name(url)?, sha))
    }

    async fn post(&self, notice: &BuildSetNotice, state: CommitState, description: &str) {
        let Some((repo, sha)) = self.target(notice) else {
            tracing::debug!(build_set_id = %notice.build_set_id, "No GitHub commit to report on");
            return;
        };
        let target_url = format!("{}/api/buildsets/{}", self.dashboard_url, notice.build_set_id);
        if let Err(e) = github_service::post_status(
            &self.client,
            &self.token,
            repo,
            sha,
            state,
            description,
            &target_url,
        )
        .await
        {
            crate::metrics::notification_failed("github");
            tracing::warn!(build_set_id = %notice.build_set_id, "GitHub status update failed: {e}");
        }
    }
}

#[async_trait]
impl Notifier for GitHubStatusNotifier {
    async fn first_failure(&self, notice: &BuildSetNotice) {
        let builder = notice.failed_builder.as_deref().unwrap_or("a builder");
        self.post(notice, CommitState::Failure, &format!("{builder} failed"))
            .await;
    }

    async fn finished(&self, notice: &BuildSetNotice) {
        let (state, description) = match notice.status {
            BuildSetStatus::Success => (CommitState::Success, "All builds passed"),
            BuildSetStatus::Failure => (CommitState::Failure, "Some builds failed"),
            BuildSetStatus::Pending => (CommitState::Pending, "Build queued"),
        };
        self.post(notice, state, description).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use ci_engine::services::change_ingress::ChangeIngress;
    use ci_engine::{BuildSetId, NewChange, SourceStamp};

    fn notice(source: SourceStamp) -> BuildSetNotice {
        BuildSetNotice {
            build_set_id: BuildSetId(4),
            status: BuildSetStatus::Success,
            reason: "test".into(),
            source: Arc::new(source),
            blamelist: BTreeSet::new(),
            interested_users: BTreeSet::new(),
            failed_builder: None,
            results: BTreeMap::new(),
        }
    }

    fn notifier(default_repository: Option<&str>) -> GitHubStatusNotifier {
        GitHubStatusNotifier::new(
            reqwest::Client::new(),
            "token",
            "http://ci.local/ci",
            default_repository.map(str::to_string),
        )
    }

    #[test]
    fn status_goes_to_the_newest_change() {
        let ingress = ChangeIngress::new();
        let change = ingress.add_change(NewChange {
            repository: "https://github.com/centrixsystems/ci.git".into(),
            revision: Some(Revision::Hash("abc123".into())),
            ..NewChange::new("ann")
        });
        let n = notice(SourceStamp::from_changes(vec![change]));
        assert_eq!(
            notifier(None).target(&n),
            Some(("centrixsystems/ci", "abc123"))
        );
    }

    #[test]
    fn latest_stamps_have_no_commit() {
        let n = notice(SourceStamp::latest(Some("main".into())));
        assert_eq!(notifier(Some("https://github.com/centrixsystems/ci")).target(&n), None);
    }

    #[test]
    fn explicit_revision_uses_default_repository() {
        let n = notice(SourceStamp::at_revision(None, Revision::Hash("f00d".into())));
        assert_eq!(
            notifier(Some("https://github.com/centrixsystems/ci")).target(&n),
            Some(("centrixsystems/ci", "f00d"))
        );
    }
}
