//! Result aggregation: rolls build outcomes up into build set verdicts.
//!
//! Each active build set has its own lock, so tallies for different build
//! sets never contend. Every notifier drains its own queue on a long-lived
//! task so a slow notifier never holds up the dispatcher. Events are queued
//! under the build set's lock, so `first_failure` always reaches a notifier
//! before `finished` for the same build set.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};

use crate::events::build_set::{BuildSetEvent, BuildSetNotice};
use crate::models::build::{Build, BuildStatus};
use crate::models::build_set::BuildSet;
use crate::models::BuildSetId;
use crate::services::notifier::Notifier;

pub const DEFAULT_HORIZON: usize = 100;

pub struct ResultAggregator {
    active: RwLock<HashMap<BuildSetId, Arc<Mutex<BuildSet>>>>,
    archive: Mutex<VecDeque<BuildSet>>,
    horizon: RwLock<usize>,
    extra_recipients: RwLock<BTreeSet<String>>,
    notifiers: RwLock<Vec<mpsc::UnboundedSender<BuildSetEvent>>>,
    events: broadcast::Sender<BuildSetEvent>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON, BTreeSet::new())
    }
}

impl ResultAggregator {
    pub fn new(horizon: usize, extra_recipients: BTreeSet<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            active: RwLock::new(HashMap::new()),
            archive: Mutex::new(VecDeque::new()),
            horizon: RwLock::new(horizon),
            extra_recipients: RwLock::new(extra_recipients),
            notifiers: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn configure(&self, horizon: usize, extra_recipients: BTreeSet<String>) {
        *self.horizon.write() = horizon;
        *self.extra_recipients.write() = extra_recipients;
        self.trim_archive();
    }

    /// Install a notifier with its own delivery queue. Needs a running
    /// tokio runtime.
    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BuildSetEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BuildSetEvent::FirstFailure(notice) => notifier.first_failure(&notice).await,
                    BuildSetEvent::Finished(notice) => notifier.finished(&notice).await,
                    BuildSetEvent::BuildSetCreated { .. } => {}
                }
            }
        });
        self.notifiers.write().push(tx);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildSetEvent> {
        self.events.subscribe()
    }

    /// Start tracking a build set. Must happen before any of its requests
    /// can be dispatched.
    pub fn register(&self, build_set: BuildSet) {
        let event = BuildSetEvent::BuildSetCreated {
            build_set_id: build_set.id,
            builders: build_set.builders().map(str::to_string).collect(),
            reason: build_set.reason.clone(),
        };
        self.active
            .write()
            .insert(build_set.id, Arc::new(Mutex::new(build_set)));
        crate::metrics::build_set_created();
        let _ = self.events.send(event);
    }

    /// Fan a terminal build out to every build set it satisfies.
    pub fn build_finished(&self, build: &Build) {
        for constituent in &build.constituents {
            self.record(constituent.build_set_id, &build.builder, build.status);
        }
    }

    /// Record a terminal result for a request that never produced a build
    /// (unresolvable source, cancellation).
    pub fn request_finished(&self, build_set_id: BuildSetId, builder: &str, status: BuildStatus) {
        self.record(build_set_id, builder, status);
    }

    pub fn get(&self, id: BuildSetId) -> Option<BuildSet> {
        let entry = self.active.read().get(&id).cloned();
        if let Some(entry) = entry {
            return Some(entry.lock().clone());
        }
        self.archive.lock().iter().find(|bs| bs.id == id).cloned()
    }

    pub fn pending(&self) -> usize {
        self.active.read().len()
    }

    fn record(&self, id: BuildSetId, builder: &str, status: BuildStatus) {
        let Some(entry) = self.active.read().get(&id).cloned() else {
            tracing::debug!(build_set_id = %id, builder, "Result for inactive build set ignored");
            return;
        };

        // Held until the events are queued; lock order is build set, then
        // the active map and archive.
        let mut build_set = entry.lock();
        let transition = build_set.record_result(builder, status);
        if !transition.first_failure && !transition.finished {
            return;
        }
        let snapshot = build_set.clone();

        let notice = BuildSetNotice::new(&snapshot, &self.extra_recipients.read());
        let mut batch = Vec::new();

        if transition.first_failure {
            tracing::warn!(
                build_set_id = %id,
                builder,
                status = %status,
                blamelist = ?notice.blamelist,
                "Build set has its first failure"
            );
            batch.push(BuildSetEvent::FirstFailure(notice.clone()));
        }

        if transition.finished {
            self.active.write().remove(&id);
            crate::metrics::build_set_finished(snapshot.status.as_str());
            tracing::info!(
                build_set_id = %id,
                status = snapshot.status.as_str(),
                "Build set finished"
            );
            self.archive.lock().push_back(snapshot);
            self.trim_archive();
            batch.push(BuildSetEvent::Finished(notice));
        }

        let notifiers = self.notifiers.read();
        for event in batch {
            for tx in notifiers.iter() {
                let _ = tx.send(event.clone());
            }
            let _ = self.events.send(event);
        }
    }

    fn trim_archive(&self) {
        let horizon = *self.horizon.read();
        let mut archive = self.archive.lock();
        while archive.len() > horizon {
            archive.pop_front();
        }
    }
}
