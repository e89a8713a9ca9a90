//! Per-scheduler change filters.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::change::Change;

/// Decides whether a change is relevant to one scheduler. Must be pure.
pub trait FilterPredicate: Send + Sync {
    fn matches(&self, change: &Change) -> bool;
}

impl<F> FilterPredicate for F
where
    F: Fn(&Change) -> bool + Send + Sync,
{
    fn matches(&self, change: &Change) -> bool {
        self(change)
    }
}

/// Declarative filter as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    /// Exact branch match. `None` only accepts changes without a branch.
    pub branch: Option<String>,
    pub project: Option<String>,
    pub repository: Option<String>,
    /// At least one touched file must match.
    pub file_pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChangeFilter {
    branch: Option<String>,
    project: Option<String>,
    repository: Option<String>,
    file_pattern: Option<Regex>,
}

impl ChangeFilter {
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        let file_pattern = spec
            .file_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidConfig(format!("file_pattern: {e}")))?;

        Ok(Self {
            branch: spec.branch.clone(),
            project: spec.project.clone(),
            repository: spec.repository.clone(),
            file_pattern,
        })
    }

    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            project: None,
            repository: None,
            file_pattern: None,
        }
    }
}

impl FilterPredicate for ChangeFilter {
    fn matches(&self, change: &Change) -> bool {
        if self.branch != change.branch {
            return false;
        }
        if let Some(ref project) = self.project {
            if *project != change.project {
                return false;
            }
        }
        if let Some(ref repository) = self.repository {
            if *repository != change.repository {
                return false;
            }
        }
        match self.file_pattern {
            Some(ref re) => change.files.iter().any(|f| re.is_match(f)),
            None => true,
        }
    }
}
