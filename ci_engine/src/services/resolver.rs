//! Turns stable sets and external triggers into source stamps.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SourceResolutionFailure;
use crate::models::change::Change;
use crate::models::source_stamp::{Patch, Revision, SourceStamp};

/// What kind of revision marker the backing repository exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryKind {
    /// Monotonic numbers or hashes; "latest including these changes" is
    /// resolved at checkout time.
    #[default]
    Monotonic,
    /// Only timestamps, which may be skewed against the change source.
    TimestampOnly,
}

#[derive(Debug, Clone)]
pub struct SourceStampResolver {
    kind: RepositoryKind,
    checkout_delay: Duration,
}

impl SourceStampResolver {
    pub fn new(kind: RepositoryKind, checkout_delay: Duration) -> Self {
        Self {
            kind,
            checkout_delay,
        }
    }

    /// Resolver for a change-triggered scheduler; the checkout delay
    /// defaults to half the stable window.
    pub fn for_window(
        kind: RepositoryKind,
        stable_window: Duration,
        checkout_delay: Option<Duration>,
    ) -> Self {
        Self::new(kind, checkout_delay.unwrap_or(stable_window / 2))
    }

    pub fn kind(&self) -> RepositoryKind {
        self.kind
    }

    pub fn checkout_delay(&self) -> Duration {
        self.checkout_delay
    }

    pub fn from_stable_set(
        &self,
        changes: Vec<Arc<Change>>,
    ) -> Result<SourceStamp, SourceResolutionFailure> {
        let last_when = changes
            .last()
            .map(|c| c.when)
            .ok_or_else(|| SourceResolutionFailure::new("stable set is empty"))?;

        let mut stamp = SourceStamp::from_changes(changes);
        if self.kind == RepositoryKind::TimestampOnly {
            let delay = chrono::Duration::from_std(self.checkout_delay)
                .map_err(|e| SourceResolutionFailure::new(format!("checkout delay: {e}")))?;
            let at = last_when
                .checked_add_signed(delay)
                .ok_or_else(|| SourceResolutionFailure::new("checkout timestamp out of range"))?;
            stamp.revision = Some(Revision::Timestamp(at));
        }
        Ok(stamp)
    }

    /// Periodic or forced trigger without an explicit revision.
    pub fn latest(&self, branch: Option<String>) -> SourceStamp {
        SourceStamp::latest(branch)
    }

    pub fn forced(&self, branch: Option<String>, revision: Option<Revision>) -> SourceStamp {
        match revision {
            Some(revision) => SourceStamp::at_revision(branch, revision),
            None => SourceStamp::latest(branch),
        }
    }

    /// Try build: the patch is applied later by the Source collaborator.
    pub fn try_patch(
        &self,
        branch: Option<String>,
        revision: Revision,
        patch: Patch,
    ) -> SourceStamp {
        SourceStamp::at_revision(branch, revision).with_patch(patch)
    }
}
