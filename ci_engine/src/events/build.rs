//! Build lifecycle events.

use serde::Serialize;

use crate::models::build::Build;
use crate::models::build_request::Constituent;
use crate::models::BuildId;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    /// A request was claimed and handed to an agent.
    BuildStarted {
        build_id: BuildId,
        number: u64,
        builder: String,
        agent: String,
        constituents: Vec<Constituent>,
    },
    /// The build reached a terminal status.
    BuildFinished { build: Build },
}
