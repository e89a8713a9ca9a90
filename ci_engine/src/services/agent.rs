//! Agent collaborator interface and the pool tracking which agents are free.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::models::build::BuildStatus;
use crate::models::builder::{AgentConfig, BuildFactory};
use crate::models::source_stamp::SourceStamp;
use crate::models::{BuildId, PropertyMap};
use crate::services::source::TreeHandle;

/// Everything an agent needs to run one build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSpec {
    pub build_id: BuildId,
    pub number: u64,
    pub builder: String,
    pub source: Arc<SourceStamp>,
    pub tree: TreeHandle,
    pub properties: PropertyMap,
    pub factory: BuildFactory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub status: BuildStatus,
    /// Properties written by steps, in step order.
    pub properties: PropertyMap,
}

impl AgentOutcome {
    pub fn new(status: BuildStatus) -> Self {
        Self {
            status,
            properties: PropertyMap::new(),
        }
    }
}

/// An execution agent. The engine never aborts on its own; `abort` flips to
/// `true` only when an operator asks for it.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn run_build(&self, spec: BuildSpec, abort: watch::Receiver<bool>) -> AgentOutcome;
}

struct AgentSlot {
    agent: Option<Arc<dyn Agent>>,
    busy: bool,
    /// Cleared when the agent is unconfigured mid-build; the slot goes
    /// away on release.
    declared: bool,
    properties: PropertyMap,
}

/// A free agent reserved for one build.
pub struct AcquiredAgent {
    pub name: String,
    pub agent: Arc<dyn Agent>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub attached: bool,
    pub busy: bool,
}

/// An agent runs at most one build at a time, across all builders.
#[derive(Default)]
pub struct AgentPool {
    slots: Mutex<HashMap<String, AgentSlot>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an agent name known. Existing attachments are kept.
    pub fn declare(&self, config: &AgentConfig) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(config.name.clone()).or_insert_with(|| AgentSlot {
            agent: None,
            busy: false,
            declared: true,
            properties: PropertyMap::new(),
        });
        slot.declared = true;
        slot.properties = config.properties.clone();
    }

    /// Forget agents not in `keep`. Busy agents finish their build first.
    pub fn retain(&self, keep: &[AgentConfig]) {
        self.slots.lock().retain(|name, slot| {
            if keep.iter().any(|a| a.name == *name) {
                return true;
            }
            slot.declared = false;
            slot.busy
        });
    }

    pub fn attach(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(&name)
            .ok_or_else(|| Error::UnknownAgent(name.clone()))?;
        slot.agent = Some(agent);
        drop(slots);
        tracing::info!(agent = %name, "Agent attached");
        Ok(())
    }

    pub fn detach(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
        slot.agent = None;
        drop(slots);
        tracing::info!(agent = %name, "Agent detached");
        Ok(())
    }

    /// Reserve the first attached, idle agent among `candidates`.
    pub fn acquire(&self, candidates: &[String]) -> Option<AcquiredAgent> {
        let mut slots = self.slots.lock();
        for name in candidates {
            let Some(slot) = slots.get_mut(name) else {
                continue;
            };
            if slot.busy || !slot.declared {
                continue;
            }
            if let Some(ref agent) = slot.agent {
                slot.busy = true;
                return Some(AcquiredAgent {
                    name: name.clone(),
                    agent: Arc::clone(agent),
                    properties: slot.properties.clone(),
                });
            }
        }
        None
    }

    pub fn release(&self, name: &str) {
        let mut slots = self.slots.lock();
        let retired = match slots.get_mut(name) {
            Some(slot) => {
                slot.busy = false;
                !slot.declared
            }
            None => false,
        };
        if retired {
            slots.remove(name);
            tracing::info!(agent = %name, "Unconfigured agent released");
        }
    }

    pub fn status(&self) -> Vec<AgentStatus> {
        let mut out: Vec<_> = self
            .slots
            .lock()
            .iter()
            .map(|(name, slot)| AgentStatus {
                name: name.clone(),
                attached: slot.agent.is_some(),
                busy: slot.busy,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
