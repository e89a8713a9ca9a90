//! Build: one concrete execution of a build request on an agent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build_request::Constituent;
use super::source_stamp::SourceStamp;
use super::BuildId;
use crate::services::properties::Property;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Success,
    Failure,
    InfraError,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BuildStatus::Running)
    }

    /// Counts against the owning build set.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            BuildStatus::Failure | BuildStatus::InfraError | BuildStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::InfraError => "infra_error",
            BuildStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a build. Refers to its builder by name only.
#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub id: BuildId,
    /// Per-builder sequence number.
    pub number: u64,
    pub builder: String,
    pub agent: String,
    /// The dispatched request followed by any requests merged into it.
    pub constituents: Vec<Constituent>,
    pub source: Arc<SourceStamp>,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, Property>,
}

impl Build {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
