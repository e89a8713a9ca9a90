//! BuildRequest: one builder's pending obligation to build a source stamp.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::source_stamp::SourceStamp;
use super::{BuildSetId, PropertyMap, RequestId};

/// A request identity together with the build set waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constituent {
    pub request_id: RequestId,
    pub build_set_id: BuildSetId,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    pub id: RequestId,
    pub build_set_id: BuildSetId,
    pub builder: String,
    pub source: Arc<SourceStamp>,
    /// Priority key; the earliest constituent's timestamp after a merge.
    pub submitted_at: DateTime<Utc>,
    pub mergeable: bool,
    pub reason: String,
    pub scheduler: Option<String>,
    pub properties: Arc<PropertyMap>,
    /// Requests absorbed into this one.
    pub merged: Vec<Constituent>,
}

impl BuildRequest {
    pub fn priority_key(&self) -> (DateTime<Utc>, RequestId) {
        (self.submitted_at, self.id)
    }

    pub fn as_constituent(&self) -> Constituent {
        Constituent {
            request_id: self.id,
            build_set_id: self.build_set_id,
        }
    }

    /// This request followed by everything merged into it.
    pub fn constituents(&self) -> Vec<Constituent> {
        std::iter::once(self.as_constituent())
            .chain(self.merged.iter().copied())
            .collect()
    }
}
