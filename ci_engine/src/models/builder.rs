//! Builder and agent definitions as they appear in configuration.

use serde::{Deserialize, Serialize};

use super::PropertyMap;

/// A long-lived named queue for one category of build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    /// Agent pool, by agent name.
    pub agents: Vec<String>,
    #[serde(default)]
    pub factory: BuildFactory,
    /// Whether compatible pending requests may be merged.
    #[serde(default = "default_merge_requests")]
    pub merge_requests: bool,
    #[serde(default)]
    pub properties: PropertyMap,
}

fn default_merge_requests() -> bool {
    true
}

/// Step sequence an agent runs for every build of a builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFactory {
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: PropertyMap::new(),
        }
    }
}

impl BuilderConfig {
    pub fn new(name: impl Into<String>, agents: &[&str]) -> Self {
        Self {
            name: name.into(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            factory: BuildFactory::default(),
            merge_requests: true,
            properties: PropertyMap::new(),
        }
    }
}
