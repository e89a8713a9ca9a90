//! Change ingress: numbers incoming changes and fans them out.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::models::change::{Change, NewChange};
use crate::models::ChangeId;

struct Subscriber {
    name: String,
    tx: mpsc::UnboundedSender<Arc<Change>>,
}

struct IngressState {
    next_id: u64,
    schedulers: Vec<Subscriber>,
}

/// Broadcast order equals arrival order: numbering and delivery to every
/// scheduler happen under one lock.
pub struct ChangeIngress {
    state: Mutex<IngressState>,
    feed: broadcast::Sender<Arc<Change>>,
}

impl Default for ChangeIngress {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeIngress {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(IngressState {
                next_id: 1,
                schedulers: Vec::new(),
            }),
            feed,
        }
    }

    /// Register a scheduler; it receives every change accepted from now on.
    pub fn attach(&self, name: &str) -> mpsc::UnboundedReceiver<Arc<Change>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.schedulers.retain(|s| s.name != name);
        state.schedulers.push(Subscriber {
            name: name.to_string(),
            tx,
        });
        rx
    }

    pub fn detach(&self, name: &str) {
        self.state.lock().schedulers.retain(|s| s.name != name);
    }

    /// Observe accepted changes without taking part in scheduling.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Change>> {
        self.feed.subscribe()
    }

    pub fn add_change(&self, new: NewChange) -> Arc<Change> {
        let mut state = self.state.lock();
        let id = ChangeId(state.next_id);
        state.next_id += 1;

        let change = Arc::new(new.into_change(id, Utc::now()));
        state
            .schedulers
            .retain(|s| s.tx.send(Arc::clone(&change)).is_ok());
        let _ = self.feed.send(Arc::clone(&change));
        drop(state);

        crate::metrics::change_received();
        tracing::info!(
            change_id = %change.id,
            who = %change.who,
            branch = ?change.branch,
            files = change.files.len(),
            "Change accepted"
        );
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_every_scheduler_sees_arrival_order() {
        let ingress = ChangeIngress::new();
        let mut a = ingress.attach("a");
        let mut b = ingress.attach("b");

        let first = ingress.add_change(NewChange::new("ann"));
        let second = ingress.add_change(NewChange::new("bob"));
        assert!(first.id < second.id);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().map(|c| c.id).ok(), Some(first.id));
            assert_eq!(rx.try_recv().map(|c| c.id).ok(), Some(second.id));
        }
    }

    #[test]
    fn detached_and_dropped_schedulers_stop_receiving() {
        let ingress = ChangeIngress::new();
        let mut kept = ingress.attach("kept");
        let gone = ingress.attach("gone");
        drop(gone);
        let _detached = ingress.attach("detached");
        ingress.detach("detached");

        ingress.add_change(NewChange::new("ann"));
        assert!(kept.try_recv().is_ok());
        assert_eq!(ingress.state.lock().schedulers.len(), 1);
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let ingress = ChangeIngress::new();
        let when = Utc::now() - chrono::Duration::hours(1);
        let change = ingress.add_change(NewChange::new("ann").at(when));
        assert_eq!(change.when, when);
    }
}
