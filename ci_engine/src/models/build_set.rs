//! BuildSet: tracks every build of one source stamp across its builders.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::BuildStatus;
use super::source_stamp::SourceStamp;
use super::{BuildSetId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSetStatus {
    Pending,
    Success,
    Failure,
}

impl BuildSetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildSetStatus::Pending => "pending",
            BuildSetStatus::Success => "success",
            BuildSetStatus::Failure => "failure",
        }
    }
}

/// Notifications owed after recording one result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transition {
    pub first_failure: bool,
    pub finished: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSet {
    pub id: BuildSetId,
    pub source: Arc<SourceStamp>,
    pub reason: String,
    pub scheduler: Option<String>,
    /// Builder name to the request created for it.
    pub requests: BTreeMap<String, RequestId>,
    pub results: BTreeMap<String, BuildStatus>,
    pub status: BuildSetStatus,
    /// Builder whose failure fired `first_failure`.
    pub first_failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildSet {
    pub fn new(
        id: BuildSetId,
        source: Arc<SourceStamp>,
        reason: String,
        scheduler: Option<String>,
        requests: BTreeMap<String, RequestId>,
    ) -> Self {
        Self {
            id,
            source,
            reason,
            scheduler,
            requests,
            results: BTreeMap::new(),
            status: BuildSetStatus::Pending,
            first_failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn builders(&self) -> impl Iterator<Item = &str> {
        self.requests.keys().map(String::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.status != BuildSetStatus::Pending
    }

    /// Record the terminal result of one child. Results for unknown
    /// builders, repeated results and anything after `finished` are ignored.
    pub fn record_result(&mut self, builder: &str, status: BuildStatus) -> Transition {
        let mut transition = Transition::default();
        if self.is_finished()
            || !status.is_terminal()
            || !self.requests.contains_key(builder)
            || self.results.contains_key(builder)
        {
            return transition;
        }

        self.results.insert(builder.to_string(), status);

        if status.is_failure() && status != BuildStatus::Cancelled && self.first_failure.is_none()
        {
            self.first_failure = Some(builder.to_string());
            transition.first_failure = true;
        }

        if self.results.len() == self.requests.len() {
            self.status = if self.results.values().any(|s| s.is_failure()) {
                BuildSetStatus::Failure
            } else {
                BuildSetStatus::Success
            };
            self.finished_at = Some(Utc::now());
            transition.finished = true;
        }

        transition
    }
}
