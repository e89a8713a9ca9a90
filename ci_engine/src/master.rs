//! The build master: one context object owning every engine component.
//!
//! Constructed once from a validated [`MasterSetup`]; reconfiguration swaps
//! builders and schedulers in place and `shutdown` drains running builds.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};

use crate::config::MasterSetup;
use crate::error::{Error, Result};
use crate::events::build::BuildEvent;
use crate::events::build_set::BuildSetEvent;
use crate::models::build::BuildStatus;
use crate::models::build_set::BuildSet;
use crate::models::change::{Change, NewChange};
use crate::models::source_stamp::{Patch, Revision};
use crate::models::{BuildId, BuildSetId, PropertyMap, RequestId};
use crate::services::agent::{Agent, AgentPool, AgentStatus};
use crate::services::aggregator::ResultAggregator;
use crate::services::change_ingress::ChangeIngress;
use crate::services::coordinator::{BuildSetRequest, Coordinator};
use crate::services::dispatcher::{BuilderStatus, Dispatcher};
use crate::services::notifier::Notifier;
use crate::services::resolver::{RepositoryKind, SourceStampResolver};
use crate::services::scheduler::{SchedulerEngine, SchedulerHandle};
use crate::services::source::Source;

/// A user-forced build. Without a revision it builds the latest source on
/// `branch` and may merge with other pending requests.
#[derive(Debug, Clone, Default)]
pub struct ForceBuild {
    pub builders: Vec<String>,
    pub branch: Option<String>,
    pub revision: Option<Revision>,
    pub reason: String,
    pub properties: PropertyMap,
}

/// A try build: a patch applied on top of an explicit revision.
#[derive(Debug, Clone)]
pub struct TryBuild {
    pub builders: Vec<String>,
    pub branch: Option<String>,
    pub revision: Revision,
    pub patch: Patch,
    pub reason: String,
    pub properties: PropertyMap,
}

pub struct BuildMaster {
    ingress: Arc<ChangeIngress>,
    agents: Arc<AgentPool>,
    aggregator: Arc<ResultAggregator>,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
    user_resolver: SourceStampResolver,
    schedulers: Mutex<Vec<SchedulerHandle>>,
    accepting: AtomicBool,
}

impl BuildMaster {
    /// Validate `setup` and start every scheduler. Must run inside a tokio
    /// runtime.
    pub fn start(setup: MasterSetup, source: Arc<dyn Source>) -> Result<Self> {
        setup.validate()?;

        let ingress = Arc::new(ChangeIngress::new());
        let agents = Arc::new(AgentPool::new());
        for agent in &setup.agents {
            agents.declare(agent);
        }
        let aggregator = Arc::new(ResultAggregator::new(
            setup.build_set_horizon,
            setup.extra_recipients.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&agents),
            source,
            Arc::clone(&aggregator),
        ));
        dispatcher.set_global_properties(setup.properties.clone());
        for builder in &setup.builders {
            dispatcher.upsert_builder(builder.clone());
        }
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&dispatcher),
            Arc::clone(&aggregator),
        ));

        let schedulers = setup
            .schedulers
            .into_iter()
            .map(|def| SchedulerEngine::spawn(def, &ingress, Arc::clone(&coordinator)))
            .collect();

        tracing::info!(
            builders = setup.builders.len(),
            agents = setup.agents.len(),
            "Build master started"
        );

        Ok(Self {
            ingress,
            agents,
            aggregator,
            dispatcher,
            coordinator,
            user_resolver: SourceStampResolver::new(RepositoryKind::Monotonic, Duration::ZERO),
            schedulers: Mutex::new(schedulers),
            accepting: AtomicBool::new(true),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    pub fn add_change(&self, change: NewChange) -> Result<Arc<Change>> {
        self.ensure_running()?;
        Ok(self.ingress.add_change(change))
    }

    pub fn force_build(&self, force: ForceBuild) -> Result<BuildSetId> {
        self.ensure_running()?;
        let explicit = force.revision.is_some();
        let stamp = self.user_resolver.forced(force.branch, force.revision);
        let reason = reason_or(force.reason, "forced build");
        let mut request =
            BuildSetRequest::new(stamp, force.builders, reason).with_properties(force.properties);
        if explicit {
            request = request.unmergeable();
        }
        self.coordinator.submit(request)
    }

    pub fn try_build(&self, try_build: TryBuild) -> Result<BuildSetId> {
        self.ensure_running()?;
        let stamp = self
            .user_resolver
            .try_patch(try_build.branch, try_build.revision, try_build.patch);
        let reason = reason_or(try_build.reason, "try build");
        let request = BuildSetRequest::new(stamp, try_build.builders, reason)
            .with_properties(try_build.properties)
            .unmergeable();
        self.coordinator.submit(request)
    }

    pub fn attach_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        self.agents.attach(agent)?;
        self.dispatcher.wake_all();
        Ok(())
    }

    /// A running build on the agent keeps going; no new builds go to it.
    pub fn detach_agent(&self, name: &str) -> Result<()> {
        self.agents.detach(name)
    }

    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.aggregator.add_notifier(notifier);
    }

    /// Remove an unclaimed request. Every build set it stands for records
    /// the builder as cancelled.
    pub fn cancel_request(&self, builder: &str, id: RequestId) -> Result<()> {
        let request = self.dispatcher.cancel(builder, id)?;
        for constituent in request.constituents() {
            self.aggregator
                .request_finished(constituent.build_set_id, builder, BuildStatus::Cancelled);
        }
        Ok(())
    }

    pub fn abort_build(&self, id: BuildId) -> Result<()> {
        self.dispatcher.abort(id)
    }

    pub fn build_set(&self, id: BuildSetId) -> Result<BuildSet> {
        self.aggregator.get(id).ok_or(Error::BuildSetNotFound(id))
    }

    pub fn builders(&self) -> Vec<BuilderStatus> {
        self.dispatcher.status()
    }

    pub fn agents(&self) -> Vec<AgentStatus> {
        self.agents.status()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<Arc<Change>> {
        self.ingress.subscribe()
    }

    pub fn subscribe_build_sets(&self) -> broadcast::Receiver<BuildSetEvent> {
        self.aggregator.subscribe()
    }

    pub fn subscribe_builds(&self) -> broadcast::Receiver<BuildEvent> {
        self.dispatcher.subscribe()
    }

    /// Apply a new configuration. Unchanged builders keep their queues;
    /// removed builders have their unclaimed requests cancelled; the
    /// scheduler set is replaced and pending stable sets are discarded.
    pub async fn reconfigure(&self, setup: MasterSetup) -> Result<()> {
        self.ensure_running()?;
        setup.validate()?;

        let mut schedulers = self.schedulers.lock().await;
        for handle in schedulers.drain(..) {
            self.ingress.detach(handle.name());
            handle.stop().await;
        }

        for agent in &setup.agents {
            self.agents.declare(agent);
        }
        self.agents.retain(&setup.agents);
        self.dispatcher.set_global_properties(setup.properties.clone());
        self.aggregator
            .configure(setup.build_set_horizon, setup.extra_recipients.clone());

        let keep: BTreeSet<&str> = setup.builders.iter().map(|b| b.name.as_str()).collect();
        for name in self.dispatcher.builder_names() {
            if keep.contains(name.as_str()) {
                continue;
            }
            for request in self.dispatcher.remove_builder(&name) {
                for constituent in request.constituents() {
                    self.aggregator.request_finished(
                        constituent.build_set_id,
                        &name,
                        BuildStatus::Cancelled,
                    );
                }
            }
        }
        for builder in &setup.builders {
            self.dispatcher.upsert_builder(builder.clone());
        }

        for definition in setup.schedulers {
            schedulers.push(SchedulerEngine::spawn(
                definition,
                &self.ingress,
                Arc::clone(&self.coordinator),
            ));
        }
        self.dispatcher.wake_all();
        tracing::info!(
            builders = keep.len(),
            schedulers = schedulers.len(),
            "Reconfiguration complete"
        );
        Ok(())
    }

    /// Stop schedulers and dispatching, then wait for running builds.
    /// Requests still queued stay pending.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Build master shutting down");
        let mut schedulers = self.schedulers.lock().await;
        for handle in schedulers.drain(..) {
            self.ingress.detach(handle.name());
            handle.stop().await;
        }
        drop(schedulers);
        self.dispatcher.shutdown().await;
        tracing::info!(pending_build_sets = self.aggregator.pending(), "Build master stopped");
    }
}

fn reason_or(reason: String, default: &str) -> String {
    if reason.trim().is_empty() {
        default.to_string()
    } else {
        reason
    }
}
