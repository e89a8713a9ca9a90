//! Collaborator doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ci_engine::events::build_set::{BuildSetEvent, BuildSetNotice};
use ci_engine::services::agent::{Agent, AgentOutcome, BuildSpec};
use ci_engine::{
    BuildSetId, BuildStatus, Notifier, PropertyMap, Revision, Source, SourceResolutionFailure,
    SourceStamp, TreeHandle,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Semaphore};

/// Resolves every stamp to its own revision, or to a fixed hash for
/// "latest" stamps.
#[derive(Default)]
pub struct FakeSource {
    pub fail: bool,
    pub resolved: Mutex<Vec<SourceStamp>>,
}

impl FakeSource {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn resolve(&self, stamp: &SourceStamp) -> Result<TreeHandle, SourceResolutionFailure> {
        self.resolved.lock().push(stamp.clone());
        if self.fail {
            return Err(SourceResolutionFailure::new("repository unreachable"));
        }
        Ok(TreeHandle {
            revision: stamp
                .revision
                .clone()
                .unwrap_or_else(|| Revision::Hash("d34db33f".into())),
            branch: stamp.branch.clone(),
            patched: stamp.patch.is_some(),
        })
    }
}

/// Agent that finishes every build with a fixed status. With a gate, each
/// build waits for one permit (or an abort) before finishing.
pub struct ScriptedAgent {
    name: String,
    status: BuildStatus,
    properties: PropertyMap,
    gate: Option<Arc<Semaphore>>,
    pub specs: Mutex<Vec<BuildSpec>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, status: BuildStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            properties: PropertyMap::new(),
            gate: None,
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn writes(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn builds(&self) -> usize {
        self.specs.lock().len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_build(&self, spec: BuildSpec, mut abort: watch::Receiver<bool>) -> AgentOutcome {
        self.specs.lock().push(spec);
        if let Some(ref gate) = self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = abort.changed() => return AgentOutcome::new(BuildStatus::Cancelled),
            }
        }
        AgentOutcome {
            status: self.status,
            properties: self.properties.clone(),
        }
    }
}

/// Agent whose every build panics mid-run.
pub struct PanickingAgent(pub &'static str);

#[async_trait]
impl Agent for PanickingAgent {
    fn name(&self) -> &str {
        self.0
    }

    async fn run_build(&self, spec: BuildSpec, _abort: watch::Receiver<bool>) -> AgentOutcome {
        panic!("agent {} crashed running build {}", self.0, spec.build_id);
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub first_failures: Mutex<Vec<BuildSetNotice>>,
    pub finished: Mutex<Vec<BuildSetNotice>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn first_failure(&self, notice: &BuildSetNotice) {
        self.first_failures.lock().push(notice.clone());
    }

    async fn finished(&self, notice: &BuildSetNotice) {
        self.finished.lock().push(notice.clone());
    }
}

/// Wait for the `finished` event of one build set.
pub async fn finished(
    events: &mut broadcast::Receiver<BuildSetEvent>,
    id: BuildSetId,
) -> BuildSetNotice {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(BuildSetEvent::Finished(notice)) if notice.build_set_id == id => {
                    return notice;
                }
                Ok(_) => continue,
                Err(err) => panic!("build set event stream ended: {err}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("build set did not finish")
}

/// Next build set id announced on the stream.
pub async fn created(events: &mut broadcast::Receiver<BuildSetEvent>) -> BuildSetId {
    loop {
        match events.recv().await {
            Ok(BuildSetEvent::BuildSetCreated { build_set_id, .. }) => return build_set_id,
            Ok(_) => continue,
            Err(err) => panic!("build set event stream ended: {err}"),
        }
    }
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
