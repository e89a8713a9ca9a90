//! Engine configuration: the serde form read from disk and the validated
//! setup the build master is started with.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::builder::{AgentConfig, BuilderConfig};
use crate::models::PropertyMap;
use crate::services::aggregator::DEFAULT_HORIZON;
use crate::services::filter::{ChangeFilter, FilterSpec};
use crate::services::resolver::{RepositoryKind, SourceStampResolver};
use crate::services::scheduler::{SchedulerDefinition, Trigger};

/// Agent names the master reserves for itself.
const RESERVED_AGENT_NAMES: &[&str] = &["debug", "change", "status"];

/// Unknown keys are rejected so a misspelt section never silently drops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    /// Global property layer.
    pub properties: PropertyMap,
    pub agents: Vec<AgentConfig>,
    pub builders: Vec<BuilderConfig>,
    pub schedulers: Vec<SchedulerConfig>,
    /// Finished build sets kept for status queries.
    pub build_set_horizon: Option<usize>,
    /// Added to the interested users of every notification.
    pub extra_recipients: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub name: String,
    pub builders: Vec<String>,
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub filter: FilterSpec,
    #[serde(default)]
    pub repository_kind: RepositoryKind,
    /// Defaults to half the stable window.
    #[serde(default)]
    pub checkout_delay_secs: Option<u64>,
    #[serde(default)]
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerConfig {
    ChangeTriggered {
        stable_window_secs: u64,
    },
    Periodic {
        interval_secs: u64,
        #[serde(default)]
        branch: Option<String>,
    },
}

impl MasterConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Compile filters and resolvers, then validate the result.
    pub fn into_setup(self) -> Result<MasterSetup> {
        let schedulers = self
            .schedulers
            .into_iter()
            .map(SchedulerConfig::into_definition)
            .collect::<Result<Vec<_>>>()?;

        let setup = MasterSetup {
            properties: self.properties,
            agents: self.agents,
            builders: self.builders,
            schedulers,
            build_set_horizon: self.build_set_horizon.unwrap_or(DEFAULT_HORIZON),
            extra_recipients: self.extra_recipients,
        };
        setup.validate()?;
        Ok(setup)
    }
}

impl SchedulerConfig {
    fn into_definition(self) -> Result<SchedulerDefinition> {
        let checkout_delay = self.checkout_delay_secs.map(Duration::from_secs);
        let (trigger, resolver) = match self.trigger {
            TriggerConfig::ChangeTriggered { stable_window_secs } => {
                let window = Duration::from_secs(stable_window_secs);
                let filter = ChangeFilter::compile(&self.filter)
                    .map_err(|e| Error::InvalidConfig(format!("scheduler {}: {e}", self.name)))?;
                (
                    Trigger::ChangeTriggered {
                        filter: std::sync::Arc::new(filter),
                        window,
                    },
                    SourceStampResolver::for_window(self.repository_kind, window, checkout_delay),
                )
            }
            TriggerConfig::Periodic {
                interval_secs,
                branch,
            } => (
                Trigger::Periodic {
                    interval: Duration::from_secs(interval_secs),
                    branch,
                },
                SourceStampResolver::new(self.repository_kind, checkout_delay.unwrap_or_default()),
            ),
        };

        Ok(SchedulerDefinition {
            name: self.name,
            builders: self.builders,
            trigger,
            resolver,
            properties: self.properties,
        })
    }
}

/// Everything the build master runs with. Schedulers may carry arbitrary
/// predicates, so this is built either from `MasterConfig` or in code.
#[derive(Debug, Clone)]
pub struct MasterSetup {
    pub properties: PropertyMap,
    pub agents: Vec<AgentConfig>,
    pub builders: Vec<BuilderConfig>,
    pub schedulers: Vec<SchedulerDefinition>,
    pub build_set_horizon: usize,
    pub extra_recipients: BTreeSet<String>,
}

impl Default for MasterSetup {
    fn default() -> Self {
        Self {
            properties: PropertyMap::new(),
            agents: Vec::new(),
            builders: Vec::new(),
            schedulers: Vec::new(),
            build_set_horizon: DEFAULT_HORIZON,
            extra_recipients: BTreeSet::new(),
        }
    }
}

impl MasterSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent: AgentConfig) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn builder(mut self, builder: BuilderConfig) -> Self {
        self.builders.push(builder);
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerDefinition) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut agents = HashSet::new();
        for agent in &self.agents {
            if RESERVED_AGENT_NAMES.contains(&agent.name.as_str()) {
                return invalid(format!("agent name '{}' is reserved", agent.name));
            }
            if !agents.insert(agent.name.as_str()) {
                return invalid(format!("duplicate agent name '{}'", agent.name));
            }
        }

        let mut builders = HashSet::new();
        for builder in &self.builders {
            if builder.name.is_empty() || builder.name.starts_with('_') {
                return invalid(format!(
                    "builder name '{}' must be non-empty and must not start with '_'",
                    builder.name
                ));
            }
            if !builders.insert(builder.name.as_str()) {
                return invalid(format!("duplicate builder name '{}'", builder.name));
            }
            if builder.agents.is_empty() {
                return invalid(format!("builder '{}' has no agents", builder.name));
            }
            if let Some(agent) = builder.agents.iter().find(|a| !agents.contains(a.as_str())) {
                return invalid(format!(
                    "builder '{}' uses undeclared agent '{agent}'",
                    builder.name
                ));
            }
        }

        let mut schedulers = HashSet::new();
        let mut scheduled = HashSet::new();
        for scheduler in &self.schedulers {
            if !schedulers.insert(scheduler.name.as_str()) {
                return invalid(format!("duplicate scheduler name '{}'", scheduler.name));
            }
            if scheduler.builders.is_empty() {
                return invalid(format!("scheduler '{}' has no builders", scheduler.name));
            }
            for builder in &scheduler.builders {
                if !builders.contains(builder.as_str()) {
                    return invalid(format!(
                        "scheduler '{}' uses unknown builder '{builder}'",
                        scheduler.name
                    ));
                }
                scheduled.insert(builder.as_str());
            }
            match scheduler.trigger {
                Trigger::ChangeTriggered { window, .. } if window.is_zero() => {
                    return invalid(format!(
                        "scheduler '{}' needs a non-zero stable window",
                        scheduler.name
                    ));
                }
                Trigger::Periodic { interval, .. } if interval.is_zero() => {
                    return invalid(format!(
                        "scheduler '{}' needs a non-zero interval",
                        scheduler.name
                    ));
                }
                _ => {}
            }
        }

        for builder in &self.builders {
            if !scheduled.contains(builder.name.as_str()) {
                tracing::warn!(builder = %builder.name, "Builder is not driven by any scheduler");
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> Result<()> {
    Err(Error::InvalidConfig(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "properties": { "project": "centrix" },
        "agents": [{ "name": "linux-1" }, { "name": "linux-2", "properties": { "arch": "x86_64" } }],
        "builders": [
            {
                "name": "full",
                "agents": ["linux-1", "linux-2"],
                "factory": { "steps": [{ "name": "test", "command": "cargo test" }] }
            },
            { "name": "docs", "agents": ["linux-1"], "merge_requests": false }
        ],
        "schedulers": [
            {
                "name": "main",
                "builders": ["full", "docs"],
                "trigger": { "kind": "change_triggered", "stable_window_secs": 600 },
                "filter": { "branch": "main", "file_pattern": "\\.rs$" },
                "repository_kind": "timestamp_only"
            },
            {
                "name": "nightly",
                "builders": ["full"],
                "trigger": { "kind": "periodic", "interval_secs": 86400, "branch": "main" }
            }
        ],
        "build_set_horizon": 20
    }"#;

    fn setup() -> MasterSetup {
        MasterConfig::from_json(SAMPLE).unwrap().into_setup().unwrap()
    }

    #[test]
    fn sample_config_loads() {
        let setup = setup();
        assert_eq!(setup.builders.len(), 2);
        assert!(!setup.builders[1].merge_requests);
        assert_eq!(setup.build_set_horizon, 20);

        let main = &setup.schedulers[0];
        assert_eq!(main.resolver.kind(), RepositoryKind::TimestampOnly);
        assert_eq!(main.resolver.checkout_delay(), Duration::from_secs(300));
        assert!(matches!(main.trigger, Trigger::ChangeTriggered { window, .. } if window == Duration::from_secs(600)));
        assert!(matches!(setup.schedulers[1].trigger, Trigger::Periodic { .. }));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let misspelt = SAMPLE.replace("\"build_set_horizon\"", "\"buildset_horizon\"");
        match MasterConfig::from_json(&misspelt) {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains("buildset_horizon"), "{msg}"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }

        let misspelt = SAMPLE.replace("\"repository_kind\"", "\"repo_kind\"");
        assert!(matches!(
            MasterConfig::from_json(&misspelt),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn explicit_checkout_delay_wins() {
        let mut config = MasterConfig::from_json(SAMPLE).unwrap();
        config.schedulers[0].checkout_delay_secs = Some(30);
        let setup = config.into_setup().unwrap();
        assert_eq!(setup.schedulers[0].resolver.checkout_delay(), Duration::from_secs(30));
    }

    fn rejects(setup: MasterSetup, needle: &str) {
        match setup.validate() {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("expected InvalidConfig containing {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_builder_names_are_rejected() {
        let mut s = setup();
        s.builders.push(BuilderConfig::new("docs", &["linux-1"]));
        rejects(s, "duplicate builder");
    }

    #[test]
    fn underscore_builder_names_are_rejected() {
        let mut s = setup();
        s.builders.push(BuilderConfig::new("_hidden", &["linux-1"]));
        rejects(s, "must not start with '_'");
    }

    #[test]
    fn builders_must_use_declared_agents() {
        let mut s = setup();
        s.builders.push(BuilderConfig::new("win", &["windows-1"]));
        rejects(s, "undeclared agent 'windows-1'");
    }

    #[test]
    fn reserved_agent_names_are_rejected() {
        let s = setup().agent(AgentConfig::new("status"));
        rejects(s, "reserved");
    }

    #[test]
    fn schedulers_must_target_known_builders() {
        let s = setup().scheduler(SchedulerDefinition::periodic(
            "weekly",
            &["release"],
            Duration::from_secs(60),
            None,
        ));
        rejects(s, "unknown builder 'release'");
    }

    #[test]
    fn duplicate_scheduler_names_are_rejected() {
        let s = setup().scheduler(SchedulerDefinition::periodic(
            "nightly",
            &["docs"],
            Duration::from_secs(60),
            None,
        ));
        rejects(s, "duplicate scheduler");
    }

    #[test]
    fn zero_windows_are_rejected() {
        let s = setup().scheduler(SchedulerDefinition::change_triggered(
            "eager",
            &["docs"],
            ChangeFilter::branch("main"),
            Duration::ZERO,
        ));
        rejects(s, "non-zero stable window");
    }

    #[test]
    fn bad_file_pattern_is_a_config_error() {
        let mut config = MasterConfig::from_json(SAMPLE).unwrap();
        config.schedulers[0].filter.file_pattern = Some("(".into());
        assert!(matches!(config.into_setup(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unscheduled_builders_are_allowed() {
        let s = setup().builder(BuilderConfig::new("manual", &["linux-2"]));
        assert!(s.validate().is_ok());
    }
}
