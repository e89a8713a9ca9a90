//! Concrete collaborators for the engine: git-backed source resolution,
//! local shell execution, GitHub and HTTP notification.

pub mod executor;
pub mod git_source;
pub mod github_service;
pub mod notifier;
