//! Events published by the engine to subscribers and notifiers.

pub mod build;
pub mod build_set;
