//! Per-builder queue of unclaimed build requests, oldest first.
//!
//! Every mutation happens under the queue's own lock; claiming the oldest
//! request removes it in the same critical section, so two agents can never
//! be handed the same request.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::build_request::BuildRequest;
use crate::models::{BuildSetId, RequestId};
use crate::services::merger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued(RequestId),
    /// The incoming request was folded into this surviving request.
    Merged { into: RequestId },
}

/// Read-only view of a queued request.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub build_set_id: BuildSetId,
    pub submitted_at: DateTime<Utc>,
    pub branch: Option<String>,
    pub changes: usize,
    pub merged: usize,
    pub mergeable: bool,
}

pub struct BuilderQueue {
    builder: String,
    requests: Mutex<Vec<BuildRequest>>,
}

impl BuilderQueue {
    pub fn new(builder: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn builder(&self) -> &str {
        &self.builder
    }

    /// Insert a request, first folding it together with every compatible
    /// unclaimed request when `allow_merge` is set.
    pub fn enqueue(&self, request: BuildRequest, allow_merge: bool) -> Enqueued {
        let incoming_id = request.id;
        let mut requests = self.requests.lock();
        let mut current = request;
        let mut merged = false;

        if allow_merge {
            while let Some(pos) = requests
                .iter()
                .position(|existing| merger::can_merge(existing, &current))
            {
                let existing = requests.remove(pos);
                current = merger::merge(existing, current);
                merged = true;
            }
        }

        let key = current.priority_key();
        let id = current.id;
        let at = requests.partition_point(|r| r.priority_key() <= key);
        requests.insert(at, current);
        let depth = requests.len();
        drop(requests);

        crate::metrics::queue_depth(&self.builder, depth);
        if merged {
            crate::metrics::request_merged(&self.builder);
            tracing::info!(
                builder = %self.builder,
                request_id = %incoming_id,
                into = %id,
                "Build request merged"
            );
            Enqueued::Merged { into: id }
        } else {
            tracing::info!(builder = %self.builder, request_id = %id, depth, "Build request queued");
            Enqueued::Queued(id)
        }
    }

    /// Atomically claim and remove the oldest unclaimed request.
    pub fn claim_oldest(&self) -> Option<BuildRequest> {
        let mut requests = self.requests.lock();
        if requests.is_empty() {
            return None;
        }
        let request = requests.remove(0);
        let depth = requests.len();
        drop(requests);
        crate::metrics::queue_depth(&self.builder, depth);
        Some(request)
    }

    /// Remove an unclaimed request.
    pub fn cancel(&self, id: RequestId) -> Option<BuildRequest> {
        let mut requests = self.requests.lock();
        let pos = requests.iter().position(|r| r.id == id)?;
        let request = requests.remove(pos);
        let depth = requests.len();
        drop(requests);
        crate::metrics::queue_depth(&self.builder, depth);
        Some(request)
    }

    /// Remove everything, e.g. when the builder is unconfigured.
    pub fn drain(&self) -> Vec<BuildRequest> {
        let drained = std::mem::take(&mut *self.requests.lock());
        crate::metrics::queue_depth(&self.builder, 0);
        drained
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueuedRequest> {
        self.requests
            .lock()
            .iter()
            .map(|r| QueuedRequest {
                id: r.id,
                build_set_id: r.build_set_id,
                submitted_at: r.submitted_at,
                branch: r.source.branch.clone(),
                changes: r.source.changes.len(),
                merged: r.merged.len(),
                mergeable: r.mergeable,
            })
            .collect()
    }
}
