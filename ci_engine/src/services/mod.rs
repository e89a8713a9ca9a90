//! Engine services, leaf first: ingress and filtering, the stable-set timer,
//! source resolution, build set coordination, queues and dispatch, result
//! aggregation, and the collaborator interfaces.

pub mod agent;
pub mod aggregator;
pub mod builder_queue;
pub mod change_ingress;
pub mod coordinator;
pub mod dispatcher;
pub mod filter;
pub mod merger;
pub mod notifier;
pub mod properties;
pub mod resolver;
pub mod scheduler;
pub mod source;
pub mod stable_timer;
