//! Engine error types.

use thiserror::Error;

use crate::models::{BuildId, BuildSetId, RequestId};

/// A source specification could not be turned into a concrete tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source resolution failed: {reason}")]
pub struct SourceResolutionFailure {
    pub reason: String,
}

impl SourceResolutionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a build set needs at least one builder")]
    NoBuilders,

    #[error(transparent)]
    SourceResolution(#[from] SourceResolutionFailure),

    #[error("build request {0} is not pending")]
    RequestNotFound(RequestId),

    #[error("build {0} is not running")]
    BuildNotFound(BuildId),

    #[error("build set {0} not found")]
    BuildSetNotFound(BuildSetId),

    #[error("build master is shutting down")]
    ShuttingDown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
