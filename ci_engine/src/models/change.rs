//! Change: one committed modification reported by a change source.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::source_stamp::Revision;
use super::{ChangeId, PropertyMap};

/// Immutable once ingress has numbered it; shared between schedulers as
/// `Arc<Change>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub who: String,
    pub files: BTreeSet<String>,
    pub comments: String,
    pub project: String,
    pub repository: String,
    pub revision: Option<Revision>,
    pub branch: Option<String>,
    pub properties: PropertyMap,
    /// Time reported by the change source, or the arrival time at ingress.
    pub when: DateTime<Utc>,
}

/// A change event as reported upstream, before ingress numbers it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewChange {
    pub who: String,
    pub files: Vec<String>,
    pub comments: String,
    pub project: String,
    pub repository: String,
    pub revision: Option<Revision>,
    pub branch: Option<String>,
    pub properties: PropertyMap,
    pub when: Option<DateTime<Utc>>,
}

impl NewChange {
    pub fn new(who: impl Into<String>) -> Self {
        Self {
            who: who.into(),
            ..Self::default()
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.when = Some(when);
        self
    }

    pub(crate) fn into_change(self, id: ChangeId, arrived: DateTime<Utc>) -> Change {
        Change {
            id,
            who: self.who,
            files: self.files.into_iter().collect(),
            comments: self.comments,
            project: self.project,
            repository: self.repository,
            revision: self.revision,
            branch: self.branch,
            properties: self.properties,
            when: self.when.unwrap_or(arrived),
        }
    }
}
