//! Git-backed source resolution.
//!
//! Stamps with an explicit revision resolve to that revision without
//! touching the network. "Latest" stamps ask the remote for the branch head
//! with `git ls-remote`.

use std::time::Duration;

use async_trait::async_trait;
use ci_engine::{Revision, Source, SourceResolutionFailure, SourceStamp, TreeHandle};
use tokio::process::Command;

pub struct GitSource {
    default_repository: Option<String>,
    timeout: Duration,
}

impl GitSource {
    pub fn new(default_repository: Option<String>) -> Self {
        Self {
            default_repository,
            timeout: Duration::from_secs(60),
        }
    }

    /// The newest change's repository, else the configured default.
    pub fn repository_for<'a>(&'a self, stamp: &'a SourceStamp) -> Option<&'a str> {
        stamp
            .changes
            .iter()
            .rev()
            .map(|c| c.repository.as_str())
            .find(|r| !r.is_empty())
            .or(self.default_repository.as_deref())
    }

    async fn branch_head(
        &self,
        repository: &str,
        refname: &str,
    ) -> Result<String, SourceResolutionFailure> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(["ls-remote", repository, refname])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            SourceResolutionFailure::new(format!("git ls-remote timed out for {repository}"))
        })?
        .map_err(|e| SourceResolutionFailure::new(format!("git ls-remote error: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceResolutionFailure::new(format!(
                "git ls-remote failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ls_remote(&stdout, refname)
            .map(str::to_string)
            .ok_or_else(|| {
                SourceResolutionFailure::new(format!("{refname} not found in {repository}"))
            })
    }
}

#[async_trait]
impl Source for GitSource {
    async fn resolve(&self, stamp: &SourceStamp) -> Result<TreeHandle, SourceResolutionFailure> {
        let tree = |revision| TreeHandle {
            revision,
            branch: stamp.branch.clone(),
            patched: stamp.patch.is_some(),
        };

        if let Some(ref revision) = stamp.revision {
            return Ok(tree(revision.clone()));
        }

        let repository = self
            .repository_for(stamp)
            .ok_or_else(|| SourceResolutionFailure::new("no repository configured"))?;
        let refname = match stamp.branch.as_deref() {
            Some(branch) => format!("refs/heads/{branch}"),
            None => "HEAD".to_string(),
        };
        let head = self.branch_head(repository, &refname).await?;
        tracing::debug!(repository, refname = %refname, head = %head, "Resolved branch head");
        Ok(tree(Revision::Hash(head)))
    }
}

/// The hash advertised for exactly `refname`.
fn parse_ls_remote<'a>(output: &'a str, refname: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (hash, name) = line.split_once('\t')?;
        (name.trim() == refname).then_some(hash.trim())
    })
}
