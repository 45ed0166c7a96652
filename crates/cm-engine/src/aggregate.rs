//! Global compliance aggregator
//!
//! Rolls several compliance sensors up into one binary sensor: `on` when
//! any source is `on`, with the worst source severity reported. The
//! aggregator works purely off published source states, so it needs no
//! access to the sensors' internals.

use std::collections::HashMap;
use std::sync::Arc;

use cm_core::{Context, EntityId};
use cm_state_store::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::sensor::attributes;
use crate::severity::canonical_label;

/// Configuration for the global aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Entity ids of the compliance sensors to aggregate
    pub sources: Vec<String>,
}

/// Aggregates compliance sensors into a single roll-up sensor
pub struct GlobalAggregator {
    config: GlobalConfig,
    entity_id: EntityId,
    store: Arc<StateStore>,
}

impl GlobalAggregator {
    pub fn new(config: GlobalConfig, store: Arc<StateStore>) -> Result<Self, EngineError> {
        if config.sources.is_empty() {
            return Err(EngineError::InvalidConfig(
                "global aggregator has no sources".to_string(),
            ));
        }
        let object_id = match &config.unique_id {
            Some(unique_id) => crate::sensor::slugify(unique_id),
            None => format!("compliance_{}", crate::sensor::slugify(&config.name)),
        };
        let entity_id: EntityId = format!("binary_sensor.{object_id}")
            .parse()
            .map_err(|err| EngineError::InvalidConfig(format!("bad aggregator name: {err}")))?;
        Ok(Self {
            config,
            entity_id,
            store,
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn sources(&self) -> &[String] {
        &self.config.sources
    }

    /// Re-read all source states and publish the roll-up
    pub fn evaluate(&self) {
        self.evaluate_inner(Context::new());
    }

    /// Evaluate in response to a source change, publishing under a child
    /// of its context
    pub fn evaluate_with_context(&self, context: &Context) {
        self.evaluate_inner(context.child());
    }

    fn evaluate_inner(&self, context: Context) {
        let mut failing: Vec<String> = Vec::new();
        let mut worst: Option<(u8, String)> = None;

        for source in &self.config.sources {
            let Some(state) = self.store.get(source) else {
                warn!(source, "Aggregator source has no state yet");
                continue;
            };
            if state.state != "on" {
                continue;
            }
            failing.push(source.clone());

            let level = state
                .attribute(attributes::SEVERITY)
                .and_then(Value::as_u64)
                .map(|level| level as u8)
                .unwrap_or(1);
            let label = state
                .attribute(attributes::SEVERITY_LABEL)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if worst.as_ref().map_or(true, |(worst_level, _)| level < *worst_level) {
                worst = Some((level, label));
            }
        }

        let is_on = !failing.is_empty();
        let mut attrs: HashMap<String, Value> = HashMap::new();
        match &worst {
            Some((level, label)) if is_on => {
                attrs.insert(attributes::SEVERITY.to_string(), json!(level));
                attrs.insert(
                    attributes::SEVERITY_LABEL.to_string(),
                    json!(display_label(*level, label)),
                );
            }
            _ => {
                attrs.insert(attributes::SEVERITY.to_string(), json!(""));
                attrs.insert(attributes::SEVERITY_LABEL.to_string(), json!(""));
            }
        }
        attrs.insert(attributes::ACTIVE_VIOLATIONS.to_string(), json!(failing));
        attrs.insert(attributes::ACTIVE_COUNT.to_string(), json!(failing.len()));

        debug!(aggregator = %self.entity_id, is_on, "Publishing roll-up");
        self.store.set(
            self.entity_id.clone(),
            if is_on { "on" } else { "off" },
            attrs,
            context,
        );
    }
}

/// Canonical label for the level, with a differing source label kept
/// parenthetically rather than dropped
fn display_label(level: u8, source_label: &str) -> String {
    match canonical_label(level) {
        Some(canon) if source_label.is_empty() || source_label == canon => canon.to_string(),
        Some(canon) => format!("{canon} ({source_label})"),
        None if source_label.is_empty() => format!("Level {level}"),
        None => format!("Level {level} ({source_label})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_event_bus::EventBus;

    fn make_store() -> Arc<StateStore> {
        Arc::new(StateStore::new(Arc::new(EventBus::new())))
    }

    fn set_sensor(store: &StateStore, entity_id: &str, state: &str, level: Value, label: &str) {
        store.set(
            entity_id.parse().unwrap(),
            state,
            HashMap::from([
                (attributes::SEVERITY.to_string(), level),
                (attributes::SEVERITY_LABEL.to_string(), json!(label)),
            ]),
            Context::new(),
        );
    }

    fn make_aggregator(store: Arc<StateStore>) -> GlobalAggregator {
        GlobalAggregator::new(
            GlobalConfig {
                name: "Home Compliance".to_string(),
                unique_id: None,
                sources: vec![
                    "binary_sensor.compliance_doors".to_string(),
                    "binary_sensor.compliance_climate".to_string(),
                ],
            },
            store,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_sources_rejected() {
        let result = GlobalAggregator::new(
            GlobalConfig {
                name: "Empty".to_string(),
                unique_id: None,
                sources: vec![],
            },
            make_store(),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_all_off() {
        let store = make_store();
        set_sensor(&store, "binary_sensor.compliance_doors", "off", json!(""), "");
        set_sensor(&store, "binary_sensor.compliance_climate", "off", json!(""), "");

        let aggregator = make_aggregator(store.clone());
        aggregator.evaluate();

        let published = store.get("binary_sensor.compliance_home_compliance").unwrap();
        assert_eq!(published.state, "off");
        assert_eq!(published.attribute(attributes::ACTIVE_COUNT), Some(&json!(0)));
        assert_eq!(published.attribute(attributes::SEVERITY), Some(&json!("")));
    }

    #[test]
    fn test_any_on_reports_worst() {
        let store = make_store();
        set_sensor(
            &store,
            "binary_sensor.compliance_doors",
            "on",
            json!(2),
            "Warning",
        );
        set_sensor(
            &store,
            "binary_sensor.compliance_climate",
            "on",
            json!(0),
            "Critical",
        );

        let aggregator = make_aggregator(store.clone());
        aggregator.evaluate();

        let published = store.get("binary_sensor.compliance_home_compliance").unwrap();
        assert_eq!(published.state, "on");
        assert_eq!(published.attribute(attributes::SEVERITY), Some(&json!(0)));
        assert_eq!(
            published.attribute(attributes::SEVERITY_LABEL),
            Some(&json!("Critical"))
        );
        assert_eq!(
            published.attribute(attributes::ACTIVE_VIOLATIONS),
            Some(&json!([
                "binary_sensor.compliance_doors",
                "binary_sensor.compliance_climate"
            ]))
        );
    }

    #[test]
    fn test_missing_source_skipped() {
        let store = make_store();
        set_sensor(&store, "binary_sensor.compliance_doors", "on", json!(1), "Problem");
        // compliance_climate never published

        let aggregator = make_aggregator(store.clone());
        aggregator.evaluate();

        let published = store.get("binary_sensor.compliance_home_compliance").unwrap();
        assert_eq!(published.state, "on");
        assert_eq!(published.attribute(attributes::ACTIVE_COUNT), Some(&json!(1)));
    }

    #[test]
    fn test_display_label_variants() {
        assert_eq!(display_label(0, "Critical"), "Critical");
        assert_eq!(display_label(0, ""), "Critical");
        assert_eq!(display_label(1, "Laundry"), "Problem (Laundry)");
        assert_eq!(display_label(42, ""), "Level 42");
        assert_eq!(display_label(42, "Custom"), "Level 42 (Custom)");
    }
}
