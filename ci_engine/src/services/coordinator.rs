//! Build set coordinator: turns a resolved source stamp plus a builder list
//! into a build set with one request per builder.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::models::build::BuildStatus;
use crate::models::build_request::BuildRequest;
use crate::models::build_set::BuildSet;
use crate::models::source_stamp::SourceStamp;
use crate::models::{BuildSetId, PropertyMap, RequestId};
use crate::services::aggregator::ResultAggregator;
use crate::services::dispatcher::Dispatcher;

#[derive(Debug, Clone)]
pub struct BuildSetRequest {
    pub source: Arc<SourceStamp>,
    pub builders: Vec<String>,
    pub reason: String,
    pub scheduler: Option<String>,
    pub properties: PropertyMap,
    /// Forced builds of an explicit revision opt out of merging.
    pub mergeable: bool,
}

impl BuildSetRequest {
    pub fn new(source: SourceStamp, builders: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            source: Arc::new(source),
            builders,
            reason: reason.into(),
            scheduler: None,
            properties: PropertyMap::new(),
            mergeable: true,
        }
    }

    pub fn from_scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = Some(scheduler.into());
        self
    }

    pub fn with_properties(mut self, properties: PropertyMap) -> Self {
        self.properties = properties;
        self
    }

    pub fn unmergeable(mut self) -> Self {
        self.mergeable = false;
        self
    }
}

pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<ResultAggregator>,
    next_build_set: AtomicU64,
    next_request: AtomicU64,
}

impl Coordinator {
    pub fn new(dispatcher: Arc<Dispatcher>, aggregator: Arc<ResultAggregator>) -> Self {
        Self {
            dispatcher,
            aggregator,
            next_build_set: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    /// Create a build set and queue one request per builder. Every builder
    /// is checked before anything is created.
    pub fn submit(&self, request: BuildSetRequest) -> Result<BuildSetId> {
        let (build_set, builders) = self.create(&request)?;
        let build_set_id = build_set.id;
        let requests = build_set.requests.clone();
        self.aggregator.register(build_set);

        // Patched stamps never merge.
        let mergeable = request.mergeable && request.source.patch.is_none();
        let properties = Arc::new(request.properties);
        let submitted_at = Utc::now();

        for builder in builders {
            let Some(&id) = requests.get(&builder) else {
                continue;
            };
            let build_request = BuildRequest {
                id,
                build_set_id,
                builder: builder.clone(),
                source: Arc::clone(&request.source),
                submitted_at,
                mergeable,
                reason: request.reason.clone(),
                scheduler: request.scheduler.clone(),
                properties: Arc::clone(&properties),
                merged: Vec::new(),
            };
            if let Err(err) = self.dispatcher.submit(build_request) {
                // Builder vanished between validation and enqueue.
                tracing::warn!(build_set_id = %build_set_id, builder = %builder, "{err}");
                self.aggregator
                    .request_finished(build_set_id, &builder, BuildStatus::Cancelled);
            }
        }

        tracing::info!(
            build_set_id = %build_set_id,
            reason = %request.reason,
            builders = requests.len(),
            "Build set submitted"
        );
        Ok(build_set_id)
    }

    /// Record a build set whose source could not be resolved. Every builder
    /// reports an infrastructure error without queueing anything.
    pub fn submit_unresolved(&self, request: BuildSetRequest) -> Result<BuildSetId> {
        let (build_set, builders) = self.create(&request)?;
        let build_set_id = build_set.id;
        self.aggregator.register(build_set);
        for builder in &builders {
            self.aggregator
                .request_finished(build_set_id, builder, BuildStatus::InfraError);
        }
        tracing::warn!(
            build_set_id = %build_set_id,
            reason = %request.reason,
            "Build set has no resolvable source"
        );
        Ok(build_set_id)
    }

    fn create(&self, request: &BuildSetRequest) -> Result<(BuildSet, Vec<String>)> {
        if request.builders.is_empty() {
            return Err(Error::NoBuilders);
        }
        let mut seen = BTreeSet::new();
        let builders: Vec<String> = request
            .builders
            .iter()
            .filter(|b| seen.insert(b.as_str()))
            .cloned()
            .collect();
        if let Some(unknown) = builders.iter().find(|b| !self.dispatcher.has_builder(b)) {
            return Err(Error::UnknownBuilder(unknown.clone()));
        }

        let build_set_id = BuildSetId(self.next_build_set.fetch_add(1, Ordering::SeqCst));
        let requests: BTreeMap<String, RequestId> = builders
            .iter()
            .map(|b| {
                let id = RequestId(self.next_request.fetch_add(1, Ordering::SeqCst));
                (b.clone(), id)
            })
            .collect();

        let build_set = BuildSet::new(
            build_set_id,
            Arc::clone(&request.source),
            request.reason.clone(),
            request.scheduler.clone(),
            requests,
        );
        Ok((build_set, builders))
    }
}
