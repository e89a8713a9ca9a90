//! SourceStamp: an exact (or "latest") source tree specification.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::Change;
use super::ChangeId;

/// Opaque, comparable revision marker. A stamp never mixes kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Revision {
    /// Monotonic revision number (svn-style).
    Number(u64),
    /// Content hash (git-style).
    Hash(String),
    /// Point in time, for repositories that only expose timestamps.
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Number(n) => write!(f, "{n}"),
            Revision::Hash(h) => f.write_str(h),
            Revision::Timestamp(t) => f.write_str(&t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Strip level, as in `patch -pN`.
    pub level: u32,
    pub diff: String,
    #[serde(default)]
    pub subdir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub branch: Option<String>,
    pub revision: Option<Revision>,
    #[serde(default)]
    pub changes: Vec<Arc<Change>>,
    pub patch: Option<Patch>,
}

impl SourceStamp {
    /// Most recent tree on `branch`.
    pub fn latest(branch: Option<String>) -> Self {
        Self {
            branch,
            ..Self::default()
        }
    }

    /// Latest tree including `changes`; revision resolved at checkout.
    pub fn from_changes(changes: Vec<Arc<Change>>) -> Self {
        let branch = changes.last().and_then(|c| c.branch.clone());
        Self {
            branch,
            changes,
            ..Self::default()
        }
    }

    pub fn at_revision(branch: Option<String>, revision: Revision) -> Self {
        Self {
            branch,
            revision: Some(revision),
            ..Self::default()
        }
    }

    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.patch = Some(patch);
        self
    }

    /// "Latest on branch": no changes, no revision, no patch.
    pub fn is_latest(&self) -> bool {
        self.changes.is_empty() && self.revision.is_none() && self.patch.is_none()
    }

    pub fn last_change(&self) -> Option<&Arc<Change>> {
        self.changes.last()
    }

    pub fn change_ids(&self) -> impl Iterator<Item = ChangeId> + '_ {
        self.changes.iter().map(|c| c.id)
    }

    /// Pinned to an exact revision rather than "latest including changes".
    /// A checkout timestamp does not pin: a later one covers an earlier one.
    pub fn is_pinned(&self) -> bool {
        matches!(self.revision, Some(Revision::Number(_) | Revision::Hash(_)))
    }

    /// Whether one build can stand in for both stamps. Unpinned stamps on a
    /// branch are ordered by the repository, so the later tree contains the
    /// earlier one; pinned stamps only match themselves.
    pub fn can_merge_with(&self, other: &SourceStamp) -> bool {
        if self.patch.is_some() || other.patch.is_some() || self.branch != other.branch {
            return false;
        }
        if self.is_pinned() || other.is_pinned() {
            return self.revision == other.revision && self.change_ids().eq(other.change_ids());
        }
        true
    }

    /// The stamp covering both: the union of changes in id order and the
    /// later checkout time. "Latest" absorbs any checkout time.
    pub fn merged_with(&self, other: &SourceStamp) -> SourceStamp {
        let mut changes: Vec<Arc<Change>> =
            self.changes.iter().chain(&other.changes).cloned().collect();
        changes.sort_by_key(|c| c.id);
        changes.dedup_by_key(|c| c.id);

        let revision = match (&self.revision, &other.revision) {
            (Some(Revision::Timestamp(a)), Some(Revision::Timestamp(b))) => {
                Some(Revision::Timestamp(*a.max(b)))
            }
            (Some(pinned), _) if self.is_pinned() => Some(pinned.clone()),
            _ => None,
        };

        SourceStamp {
            branch: self.branch.clone(),
            revision,
            changes,
            patch: None,
        }
    }

    /// Union of `who` across the constituent changes.
    pub fn blamelist(&self) -> BTreeSet<String> {
        self.changes
            .iter()
            .filter(|c| !c.who.is_empty())
            .map(|c| c.who.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::change::NewChange;

    fn change(id: u64, who: &str) -> Arc<Change> {
        Arc::new(
            NewChange::new(who)
                .on_branch("main")
                .into_change(ChangeId(id), Utc::now()),
        )
    }

    #[test]
    fn unpinned_stamps_on_a_branch_merge_into_the_union() {
        let a = SourceStamp::from_changes(vec![change(1, "ann")]);
        let b = SourceStamp::from_changes(vec![change(3, "cid"), change(2, "bob")]);
        assert!(a.can_merge_with(&b));
        assert!(b.can_merge_with(&a));

        let merged = b.merged_with(&a);
        let ids: Vec<_> = merged.change_ids().map(|c| c.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(merged.branch.as_deref(), Some("main"));
        assert!(merged.revision.is_none());
        assert!(SourceStamp::latest(Some("main".into())).can_merge_with(&a));
        assert!(!SourceStamp::latest(Some("dev".into())).can_merge_with(&a));
    }

    #[test]
    fn checkout_times_merge_to_the_later_one() {
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(120);
        let mut a = SourceStamp::from_changes(vec![change(1, "ann")]);
        a.revision = Some(Revision::Timestamp(late));
        let mut b = SourceStamp::from_changes(vec![change(2, "bob")]);
        b.revision = Some(Revision::Timestamp(early));

        assert!(a.can_merge_with(&b));
        assert_eq!(a.merged_with(&b).revision, Some(Revision::Timestamp(late)));
    }

    #[test]
    fn pinned_stamps_only_merge_with_themselves() {
        let pinned = SourceStamp::at_revision(None, Revision::Number(7));
        assert!(pinned.can_merge_with(&pinned.clone()));
        assert!(!pinned.can_merge_with(&SourceStamp::at_revision(None, Revision::Number(8))));
        assert!(!pinned.can_merge_with(&SourceStamp::latest(None)));
        assert_eq!(pinned.merged_with(&pinned).revision, Some(Revision::Number(7)));
    }

    #[test]
    fn blamelist_is_union_of_authors() {
        let stamp = SourceStamp::from_changes(vec![
            change(1, "ann"),
            change(2, "bob"),
            change(3, "ann"),
            change(4, ""),
        ]);
        let blame: Vec<_> = stamp.blamelist().into_iter().collect();
        assert_eq!(blame, vec!["ann".to_string(), "bob".to_string()]);
        assert_eq!(stamp.branch.as_deref(), Some("main"));
    }

    #[test]
    fn latest_excludes_revision_and_patch() {
        assert!(SourceStamp::latest(Some("main".into())).is_latest());
        assert!(!SourceStamp::at_revision(None, Revision::Number(7)).is_latest());
        let patched = SourceStamp::latest(None).with_patch(Patch {
            level: 1,
            diff: String::new(),
            subdir: None,
        });
        assert!(!patched.is_latest());
    }
}
