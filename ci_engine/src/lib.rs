//! Change coalescing and build distribution engine.
//!
//! Changes flow from [`ChangeIngress`](services::change_ingress::ChangeIngress)
//! to every scheduler; a scheduler's stable set becomes a source stamp, the
//! source stamp a build set with one request per builder, and requests are
//! queued, merged and handed to free agents. Results roll back up into the
//! build set and out through notifiers.

pub mod config;
pub mod error;
pub mod events;
pub mod master;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::{MasterConfig, MasterSetup};
pub use error::{Error, Result, SourceResolutionFailure};
pub use master::{BuildMaster, ForceBuild, TryBuild};
pub use models::build::{Build, BuildStatus};
pub use models::build_set::{BuildSet, BuildSetStatus};
pub use models::change::{Change, NewChange};
pub use models::source_stamp::{Patch, Revision, SourceStamp};
pub use models::{BuildId, BuildSetId, ChangeId, PropertyMap, RequestId};
pub use services::agent::{Agent, AgentOutcome, BuildSpec};
pub use services::notifier::Notifier;
pub use services::source::{Source, TreeHandle};
