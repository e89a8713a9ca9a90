//! Assignment dispatcher: pairs free agents with the oldest queued requests.
//!
//! Dispatch for a builder runs whenever a request is queued for it or one of
//! its agents is released. Reserving an agent and claiming a request are
//! each atomic, so concurrent passes for the same builder never double
//! dispatch. Builds run on spawned tasks; the queue never waits on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::error::{Error, Result};
use crate::events::build::BuildEvent;
use crate::models::build::{Build, BuildStatus};
use crate::models::build_request::BuildRequest;
use crate::models::builder::BuilderConfig;
use crate::models::{BuildId, PropertyMap, RequestId};
use crate::services::agent::{AcquiredAgent, AgentPool, BuildSpec};
use crate::services::aggregator::ResultAggregator;
use crate::services::builder_queue::{BuilderQueue, Enqueued, QueuedRequest};
use crate::services::properties::{PropertyLayer, PropertyStore};
use crate::services::source::Source;

/// A configured builder together with its queue.
pub struct BuilderRuntime {
    config: RwLock<BuilderConfig>,
    queue: BuilderQueue,
    next_number: AtomicU64,
}

impl BuilderRuntime {
    fn new(config: BuilderConfig) -> Self {
        Self {
            queue: BuilderQueue::new(config.name.clone()),
            config: RwLock::new(config),
            next_number: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> BuilderConfig {
        self.config.read().clone()
    }

    pub fn queue(&self) -> &BuilderQueue {
        &self.queue
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuilderStatus {
    pub name: String,
    pub agents: Vec<String>,
    pub pending: Vec<QueuedRequest>,
    pub running: Vec<BuildId>,
}

struct RunningBuild {
    builder: String,
    abort: watch::Sender<bool>,
}

pub struct Dispatcher {
    builders: RwLock<BTreeMap<String, Arc<BuilderRuntime>>>,
    agents: Arc<AgentPool>,
    source: Arc<dyn Source>,
    aggregator: Arc<ResultAggregator>,
    global_properties: RwLock<PropertyMap>,
    running: Mutex<HashMap<BuildId, RunningBuild>>,
    in_flight: watch::Sender<usize>,
    accepting: AtomicBool,
    next_build_id: AtomicU64,
    events: broadcast::Sender<BuildEvent>,
}

impl Dispatcher {
    pub fn new(
        agents: Arc<AgentPool>,
        source: Arc<dyn Source>,
        aggregator: Arc<ResultAggregator>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        let (events, _) = broadcast::channel(256);
        Self {
            builders: RwLock::new(BTreeMap::new()),
            agents,
            source,
            aggregator,
            global_properties: RwLock::new(PropertyMap::new()),
            running: Mutex::new(HashMap::new()),
            in_flight,
            accepting: AtomicBool::new(true),
            next_build_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn set_global_properties(&self, properties: PropertyMap) {
        *self.global_properties.write() = properties;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    pub fn has_builder(&self, name: &str) -> bool {
        self.builders.read().contains_key(name)
    }

    pub fn builder_names(&self) -> Vec<String> {
        self.builders.read().keys().cloned().collect()
    }

    /// Add a builder, or replace the configuration of an existing one while
    /// keeping its queue.
    pub fn upsert_builder(self: &Arc<Self>, config: BuilderConfig) {
        let name = config.name.clone();
        let runtime = {
            let mut builders = self.builders.write();
            match builders.get(&name) {
                Some(existing) => {
                    if *existing.config.read() == config {
                        tracing::debug!(builder = %name, "Builder is unchanged");
                        return;
                    }
                    *existing.config.write() = config;
                    tracing::info!(builder = %name, "Builder updated");
                    Arc::clone(existing)
                }
                None => {
                    let runtime = Arc::new(BuilderRuntime::new(config));
                    builders.insert(name.clone(), Arc::clone(&runtime));
                    tracing::info!(builder = %name, "Builder added");
                    runtime
                }
            }
        };
        self.dispatch(&runtime);
    }

    /// Remove a builder. Its unclaimed requests are returned for
    /// cancellation; running builds finish normally.
    pub fn remove_builder(&self, name: &str) -> Vec<BuildRequest> {
        let Some(runtime) = self.builders.write().remove(name) else {
            return Vec::new();
        };
        tracing::info!(builder = %name, "Builder removed");
        runtime.queue.drain()
    }

    pub fn submit(self: &Arc<Self>, request: BuildRequest) -> Result<Enqueued> {
        let runtime = self
            .builders
            .read()
            .get(&request.builder)
            .cloned()
            .ok_or_else(|| Error::UnknownBuilder(request.builder.clone()))?;
        let allow_merge = runtime.config.read().merge_requests;
        let outcome = runtime.queue.enqueue(request, allow_merge);
        self.dispatch(&runtime);
        Ok(outcome)
    }

    pub fn cancel(&self, builder: &str, id: RequestId) -> Result<BuildRequest> {
        let runtime = self
            .builders
            .read()
            .get(builder)
            .cloned()
            .ok_or_else(|| Error::UnknownBuilder(builder.to_string()))?;
        let request = runtime.queue.cancel(id).ok_or(Error::RequestNotFound(id))?;
        tracing::info!(builder, request_id = %id, "Build request cancelled");
        Ok(request)
    }

    /// Ask the agent running `id` to stop.
    pub fn abort(&self, id: BuildId) -> Result<()> {
        let running = self.running.lock();
        let build = running.get(&id).ok_or(Error::BuildNotFound(id))?;
        tracing::info!(build_id = %id, builder = %build.builder, "Abort requested");
        let _ = build.abort.send(true);
        Ok(())
    }

    /// Re-run dispatch for every builder; used when an agent appears.
    pub fn wake_all(self: &Arc<Self>) {
        let runtimes: Vec<_> = self.builders.read().values().cloned().collect();
        for runtime in &runtimes {
            self.dispatch(runtime);
        }
    }

    pub fn status(&self) -> Vec<BuilderStatus> {
        let running = self.running.lock();
        self.builders
            .read()
            .values()
            .map(|runtime| {
                let config = runtime.config.read();
                BuilderStatus {
                    name: config.name.clone(),
                    agents: config.agents.clone(),
                    pending: runtime.queue.snapshot(),
                    running: running
                        .iter()
                        .filter(|(_, b)| b.builder == config.name)
                        .map(|(id, _)| *id)
                        .collect(),
                }
            })
            .collect()
    }

    /// Stop dispatching and wait for every running build to end.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let mut in_flight = self.in_flight.subscribe();
        let waiting = *in_flight.borrow();
        if waiting > 0 {
            tracing::info!(builds = waiting, "Waiting for running builds to finish");
        }
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }

    fn dispatch(self: &Arc<Self>, runtime: &Arc<BuilderRuntime>) {
        loop {
            if !self.accepting.load(Ordering::SeqCst) || runtime.queue.is_empty() {
                return;
            }
            let agents = runtime.config.read().agents.clone();
            let Some(agent) = self.agents.acquire(&agents) else {
                return;
            };
            let Some(request) = runtime.queue.claim_oldest() else {
                self.agents.release(&agent.name);
                return;
            };
            self.start_build(Arc::clone(runtime), agent, request);
        }
    }

    fn start_build(
        self: &Arc<Self>,
        runtime: Arc<BuilderRuntime>,
        agent: AcquiredAgent,
        request: BuildRequest,
    ) {
        let build_id = BuildId(self.next_build_id.fetch_add(1, Ordering::SeqCst));
        let number = runtime.next_number.fetch_add(1, Ordering::SeqCst);
        let (abort_tx, abort_rx) = watch::channel(false);

        self.running.lock().insert(
            build_id,
            RunningBuild {
                builder: request.builder.clone(),
                abort: abort_tx,
            },
        );
        self.in_flight.send_modify(|n| *n += 1);

        crate::metrics::build_status_changed(BuildStatus::Running.as_str());
        tracing::info!(
            build_id = %build_id,
            builder = %request.builder,
            agent = %agent.name,
            request_id = %request.id,
            merged = request.merged.len(),
            "Build dispatched"
        );
        let _ = self.events.send(BuildEvent::BuildStarted {
            build_id,
            number,
            builder: request.builder.clone(),
            agent: agent.name.clone(),
            constituents: request.constituents(),
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let build = this
                .execute(&runtime, &agent, request, build_id, number, abort_rx)
                .await;
            this.finish(build, &agent.name);
        });
    }

    async fn execute(
        &self,
        runtime: &BuilderRuntime,
        agent: &AcquiredAgent,
        request: BuildRequest,
        build_id: BuildId,
        number: u64,
        abort: watch::Receiver<bool>,
    ) -> Build {
        let started = Instant::now();
        let started_at = Utc::now();
        let config = runtime.config();
        let source = Arc::clone(&request.source);

        let mut props = PropertyStore::new();
        props.update(
            PropertyLayer::Global,
            &self.global_properties.read(),
            "global config",
        );
        let scheduler = request.scheduler.clone().unwrap_or_default();
        props.update(PropertyLayer::Scheduler, &request.properties, &scheduler);
        if !scheduler.is_empty() {
            props.set(PropertyLayer::Scheduler, "scheduler", scheduler.clone(), "scheduler");
        }
        for change in &source.changes {
            props.update(
                PropertyLayer::Change,
                &change.properties,
                &format!("change {}", change.id),
            );
        }
        props.update(PropertyLayer::Agent, &agent.properties, &agent.name);
        props.set(PropertyLayer::Agent, "agentname", agent.name.clone(), "agent");
        props.update(PropertyLayer::Builder, &config.properties, &config.name);
        props.set(PropertyLayer::Builder, "buildername", config.name.clone(), "builder");
        props.set(PropertyLayer::BuildAutomatic, "buildnumber", number, "build");
        if let Some(ref branch) = source.branch {
            props.set(PropertyLayer::BuildAutomatic, "branch", branch.clone(), "build");
        }
        if let Some(ref revision) = source.revision {
            props.set(PropertyLayer::BuildAutomatic, "revision", revision.to_string(), "build");
        }

        let status = match self.source.resolve(&source).await {
            Err(failure) => {
                tracing::warn!(
                    build_id = %build_id,
                    builder = %config.name,
                    "Source resolution failed: {failure}"
                );
                BuildStatus::InfraError
            }
            Ok(tree) => {
                props.set(
                    PropertyLayer::BuildAutomatic,
                    "got_revision",
                    tree.revision.to_string(),
                    "source",
                );
                let spec = BuildSpec {
                    build_id,
                    number,
                    builder: config.name.clone(),
                    source: Arc::clone(&source),
                    tree,
                    properties: props.values(),
                    factory: config.factory.clone(),
                };
                // A panicking agent must still release its slot and report.
                let runner = Arc::clone(&agent.agent);
                let run = tokio::spawn(async move { runner.run_build(spec, abort).await });
                match run.await {
                    Ok(outcome) => {
                        props.update(PropertyLayer::Step, &outcome.properties, &agent.name);
                        if outcome.status.is_terminal() {
                            outcome.status
                        } else {
                            tracing::error!(
                                build_id = %build_id,
                                agent = %agent.name,
                                "Agent returned a non-terminal status"
                            );
                            BuildStatus::InfraError
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            build_id = %build_id,
                            agent = %agent.name,
                            "Agent failed to complete the build: {e}"
                        );
                        BuildStatus::InfraError
                    }
                }
            }
        };

        crate::metrics::build_duration(started.elapsed().as_millis() as u64);
        Build {
            id: build_id,
            number,
            builder: config.name,
            agent: agent.name.clone(),
            constituents: request.constituents(),
            source,
            status,
            started_at,
            finished_at: Some(Utc::now()),
            properties: props.snapshot(),
        }
    }

    fn finish(self: &Arc<Self>, build: Build, agent: &str) {
        self.running.lock().remove(&build.id);
        self.agents.release(agent);

        crate::metrics::build_status_changed(build.status.as_str());
        tracing::info!(
            build_id = %build.id,
            builder = %build.builder,
            status = %build.status,
            duration_ms = build.duration().map(|d| d.num_milliseconds()).unwrap_or_default(),
            "Build finished"
        );

        self.aggregator.build_finished(&build);
        let _ = self.events.send(BuildEvent::BuildFinished { build });
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));

        // The freed agent may serve any builder that lists it.
        let runtimes: Vec<_> = self
            .builders
            .read()
            .values()
            .filter(|r| r.config.read().agents.iter().any(|a| a == agent))
            .cloned()
            .collect();
        for runtime in &runtimes {
            self.dispatch(runtime);
        }
    }
}
