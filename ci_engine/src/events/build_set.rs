//! Build set events and the notice handed to notification collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::models::build::BuildStatus;
use crate::models::build_set::{BuildSet, BuildSetStatus};
use crate::models::source_stamp::SourceStamp;
use crate::models::BuildSetId;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BuildSetEvent {
    BuildSetCreated {
        build_set_id: BuildSetId,
        builders: Vec<String>,
        reason: String,
    },
    FirstFailure(BuildSetNotice),
    Finished(BuildSetNotice),
}

impl BuildSetEvent {
    pub fn build_set_id(&self) -> BuildSetId {
        match self {
            BuildSetEvent::BuildSetCreated { build_set_id, .. } => *build_set_id,
            BuildSetEvent::FirstFailure(n) | BuildSetEvent::Finished(n) => n.build_set_id,
        }
    }
}

/// Everything a human needs to act on a build set verdict.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSetNotice {
    pub build_set_id: BuildSetId,
    pub status: BuildSetStatus,
    pub reason: String,
    pub source: Arc<SourceStamp>,
    pub blamelist: BTreeSet<String>,
    /// Blamelist plus configured extra recipients.
    pub interested_users: BTreeSet<String>,
    /// First builder to fail, if any.
    pub failed_builder: Option<String>,
    pub results: BTreeMap<String, BuildStatus>,
}

impl BuildSetNotice {
    pub fn new(build_set: &BuildSet, extra_recipients: &BTreeSet<String>) -> Self {
        let blamelist = build_set.source.blamelist();
        let interested_users = blamelist.union(extra_recipients).cloned().collect();
        Self {
            build_set_id: build_set.id,
            status: build_set.status,
            reason: build_set.reason.clone(),
            source: Arc::clone(&build_set.source),
            blamelist,
            interested_users,
            failed_builder: build_set.first_failure.clone(),
            results: build_set.results.clone(),
        }
    }
}
