//! Layered per-build property store.
//!
//! Each layer keeps its own map; a read walks the layers from highest
//! precedence down and returns the first hit. Within one layer a later
//! write replaces an earlier one, which gives step-time writes their
//! "later step shadows earlier" behaviour.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::PropertyMap;

/// Precedence order, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyLayer {
    Global,
    Scheduler,
    Change,
    Agent,
    Builder,
    BuildAutomatic,
    Step,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value: Value,
    pub layer: PropertyLayer,
    /// Free-form origin, e.g. the scheduler or step name.
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    layers: BTreeMap<PropertyLayer, BTreeMap<String, Property>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        layer: PropertyLayer,
        key: impl Into<String>,
        value: impl Into<Value>,
        source: impl Into<String>,
    ) {
        self.layers.entry(layer).or_default().insert(
            key.into(),
            Property {
                value: value.into(),
                layer,
                source: source.into(),
            },
        );
    }

    pub fn update(&mut self, layer: PropertyLayer, values: &PropertyMap, source: &str) {
        for (key, value) in values {
            self.set(layer, key.clone(), value.clone(), source);
        }
    }

    pub fn property(&self, key: &str) -> Option<&Property> {
        self.layers.values().rev().find_map(|layer| layer.get(key))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.property(key).map(|p| &p.value)
    }

    /// Effective property for every key.
    pub fn snapshot(&self) -> BTreeMap<String, Property> {
        let mut out = BTreeMap::new();
        for layer in self.layers.values() {
            for (key, prop) in layer {
                out.insert(key.clone(), prop.clone());
            }
        }
        out
    }

    /// Effective values only, as handed to agents.
    pub fn values(&self) -> PropertyMap {
        self.snapshot()
            .into_iter()
            .map(|(key, prop)| (key, prop.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_layer_shadows_scheduler_layer() {
        let mut props = PropertyStore::new();
        props.set(PropertyLayer::Scheduler, "k", "a", "nightly");
        props.set(PropertyLayer::Builder, "k", "b", "linux");
        assert_eq!(props.get("k"), Some(&json!("b")));
    }

    #[test]
    fn lower_layer_written_later_does_not_win() {
        let mut props = PropertyStore::new();
        props.set(PropertyLayer::BuildAutomatic, "revision", "abc", "build");
        props.set(PropertyLayer::Global, "revision", "zzz", "config");
        assert_eq!(props.get("revision"), Some(&json!("abc")));
        assert_eq!(
            props.property("revision").map(|p| p.layer),
            Some(PropertyLayer::BuildAutomatic)
        );
    }

    #[test]
    fn later_step_shadows_earlier_step() {
        let mut props = PropertyStore::new();
        props.set(PropertyLayer::Step, "artifact", "one", "compile");
        props.set(PropertyLayer::Step, "artifact", "two", "package");
        let prop = props.property("artifact").cloned();
        assert_eq!(prop.map(|p| (p.value, p.source)), Some((json!("two"), "package".to_string())));
    }

    #[test]
    fn snapshot_flattens_to_effective_values() {
        let mut props = PropertyStore::new();
        props.set(PropertyLayer::Global, "a", 1, "config");
        props.set(PropertyLayer::Global, "b", 2, "config");
        props.set(PropertyLayer::Agent, "b", 3, "agent-1");
        let values = props.values();
        assert_eq!(values.get("a"), Some(&json!(1)));
        assert_eq!(values.get("b"), Some(&json!(3)));
        assert_eq!(props.get("missing"), None);
    }
}
