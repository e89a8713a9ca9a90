//! Source collaborator interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceResolutionFailure;
use crate::models::source_stamp::{Revision, SourceStamp};

/// A concrete tree a build can check out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHandle {
    pub revision: Revision,
    pub branch: Option<String>,
    /// Whether the stamp's patch has been applied on top of `revision`.
    pub patched: bool,
}

/// Resolves a source stamp into a tree. Must be deterministic for stamps
/// with an explicit revision; "latest" stamps are best effort.
#[async_trait]
pub trait Source: Send + Sync {
    async fn resolve(&self, stamp: &SourceStamp) -> Result<TreeHandle, SourceResolutionFailure>;
}
