//! Scheduler engines: one task per configured scheduler.
//!
//! A change-triggered scheduler filters the change stream and feeds matches
//! into its stable-set timer; a periodic scheduler fires "latest on branch"
//! on a fixed interval. Each engine owns its own state and shares nothing
//! mutable with other schedulers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::SourceResolutionFailure;
use crate::models::change::Change;
use crate::models::source_stamp::SourceStamp;
use crate::models::PropertyMap;
use crate::services::change_ingress::ChangeIngress;
use crate::services::coordinator::{BuildSetRequest, Coordinator};
use crate::services::filter::FilterPredicate;
use crate::services::resolver::{RepositoryKind, SourceStampResolver};
use crate::services::stable_timer::StableSetAssembler;

#[derive(Clone)]
pub enum Trigger {
    ChangeTriggered {
        filter: Arc<dyn FilterPredicate>,
        window: Duration,
    },
    Periodic {
        interval: Duration,
        branch: Option<String>,
    },
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ChangeTriggered { window, .. } => f
                .debug_struct("ChangeTriggered")
                .field("window", window)
                .finish_non_exhaustive(),
            Trigger::Periodic { interval, branch } => f
                .debug_struct("Periodic")
                .field("interval", interval)
                .field("branch", branch)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerDefinition {
    pub name: String,
    pub builders: Vec<String>,
    pub trigger: Trigger,
    pub resolver: SourceStampResolver,
    /// Scheduler-layer properties for every build this scheduler starts.
    pub properties: PropertyMap,
}

impl SchedulerDefinition {
    /// Change-triggered scheduler over a monotonic repository.
    pub fn change_triggered(
        name: impl Into<String>,
        builders: &[&str],
        filter: impl FilterPredicate + 'static,
        window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            builders: builders.iter().map(|b| b.to_string()).collect(),
            trigger: Trigger::ChangeTriggered {
                filter: Arc::new(filter),
                window,
            },
            resolver: SourceStampResolver::for_window(RepositoryKind::Monotonic, window, None),
            properties: PropertyMap::new(),
        }
    }

    pub fn periodic(
        name: impl Into<String>,
        builders: &[&str],
        interval: Duration,
        branch: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            builders: builders.iter().map(|b| b.to_string()).collect(),
            trigger: Trigger::Periodic { interval, branch },
            resolver: SourceStampResolver::new(RepositoryKind::Monotonic, Duration::ZERO),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: SourceStampResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_properties(mut self, properties: PropertyMap) -> Self {
        self.properties = properties;
        self
    }
}

/// A running scheduler task.
pub struct SchedulerHandle {
    name: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the task. A stable set still accumulating is discarded.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(scheduler = %self.name, "Scheduler task failed: {err}");
        }
    }
}

pub struct SchedulerEngine {
    definition: SchedulerDefinition,
    coordinator: Arc<Coordinator>,
}

impl SchedulerEngine {
    pub fn spawn(
        definition: SchedulerDefinition,
        ingress: &ChangeIngress,
        coordinator: Arc<Coordinator>,
    ) -> SchedulerHandle {
        let name = definition.name.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let trigger = definition.trigger.clone();
        let engine = Self {
            definition,
            coordinator,
        };

        let task = match trigger {
            Trigger::ChangeTriggered { filter, window } => {
                let changes = ingress.attach(&name);
                tokio::spawn(engine.run_change_triggered(filter, window, changes, stop_rx))
            }
            Trigger::Periodic { interval, branch } => {
                tokio::spawn(engine.run_periodic(interval, branch, stop_rx))
            }
        };
        tracing::info!(scheduler = %name, "Scheduler started");

        SchedulerHandle {
            name,
            stop: stop_tx,
            task,
        }
    }

    async fn run_change_triggered(
        self,
        filter: Arc<dyn FilterPredicate>,
        window: Duration,
        mut changes: mpsc::UnboundedReceiver<Arc<Change>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let name = self.definition.name.as_str();
        let mut assembler = StableSetAssembler::new(window);

        loop {
            let deadline = assembler.deadline();
            tokio::select! {
                _ = stop.changed() => break,
                change = changes.recv() => {
                    let Some(change) = change else { break };
                    if filter.matches(&change) {
                        tracing::debug!(scheduler = name, change_id = %change.id, "Change joined pending set");
                        assembler.add_change(change, Instant::now());
                    } else {
                        crate::metrics::change_filtered(name);
                        tracing::debug!(scheduler = name, change_id = %change.id, "Change filtered out");
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Some(set) = assembler.poll(Instant::now()) {
                        self.emit(set);
                    }
                }
            }
        }

        let discarded = assembler.reset();
        if discarded > 0 {
            tracing::info!(scheduler = name, changes = discarded, "Pending stable set discarded");
        }
        tracing::info!(scheduler = name, "Scheduler stopped");
    }

    async fn run_periodic(
        self,
        interval: Duration,
        branch: Option<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let stamp = self.definition.resolver.latest(branch.clone());
                    let reason = format!("scheduler {}: periodic", self.definition.name);
                    self.fire(Ok(stamp), SourceStamp::latest(branch.clone()), reason);
                }
            }
        }
        tracing::info!(scheduler = %self.definition.name, "Scheduler stopped");
    }

    fn emit(&self, set: Vec<Arc<Change>>) {
        let name = &self.definition.name;
        crate::metrics::stable_set_emitted(name, set.len());
        tracing::info!(
            scheduler = %name,
            changes = set.len(),
            last_change = ?set.last().map(|c| c.id),
            "Stable set emitted"
        );
        let reason = format!("scheduler {name}: {} change(s)", set.len());
        let fallback = SourceStamp::from_changes(set.clone());
        let stamp = self.definition.resolver.from_stable_set(set);
        self.fire(stamp, fallback, reason);
    }

    fn fire(
        &self,
        stamp: Result<SourceStamp, SourceResolutionFailure>,
        fallback: SourceStamp,
        reason: String,
    ) {
        let name = &self.definition.name;
        let request = |source| {
            BuildSetRequest::new(source, self.definition.builders.clone(), reason.clone())
                .from_scheduler(name.clone())
                .with_properties(self.definition.properties.clone())
        };
        let submitted = match stamp {
            Ok(stamp) => self.coordinator.submit(request(stamp)),
            Err(failure) => {
                tracing::warn!(scheduler = %name, "{failure}");
                self.coordinator.submit_unresolved(request(fallback))
            }
        };
        if let Err(err) = submitted {
            tracing::error!(scheduler = %name, "Failed to submit build set: {err}");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
