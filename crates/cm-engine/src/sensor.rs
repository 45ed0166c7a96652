//! The compliance binary sensor
//!
//! Each sensor owns a set of flattened rules and two keyed timer
//! registries. A violation starts pending when first observed, becomes
//! active once its grace timer expires while still violating, and is
//! swept (timer cancelled) the moment the entity complies again.
//! Snoozed entities are skipped when counting active violations but
//! their grace clocks keep running, so a snooze never extends a grace
//! period.
//!
//! Every evaluation publishes the result to the state store as an
//! `on`/`off` binary sensor state with the violation details as
//! attributes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cm_core::{Context, EntityId};
use cm_state_store::StateStore;
use cm_template::TemplateEngine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::eval::ViolationEvaluator;
use crate::resolver::TargetResolver;
use crate::rule::{flatten_rules, format_duration, FlattenedRule, Rule};
use crate::severity::Severity;
use crate::timer::{TimerFired, ViolationTimer};

/// Attribute names published on every compliance sensor state
pub mod attributes {
    pub const SEVERITY: &str = "severity";
    pub const SEVERITY_LABEL: &str = "severity_label";
    pub const GRACE_PERIODS: &str = "grace_periods";
    pub const ACTIVE_VIOLATIONS: &str = "active_violations";
    pub const ACTIVE_COUNT: &str = "active_count";
    pub const SNOOZE_REGISTRY: &str = "snooze_registry";

    // Debug-only attributes
    pub const VIOLATIONS_REGISTRY: &str = "violations_registry";
    pub const TRACKED_ENTITIES: &str = "tracked_entities";
    pub const VIOLATIONS_DEBUG: &str = "active_violations_debug_info";
    pub const STATUS: &str = "status";
    pub const WRITE_OPERATIONS: &str = "write_operations";
}

/// Worst severity starts above every real level; if no violation ever
/// lowers it, the published label makes the failure visible.
const SEVERITY_UNEVALUATED: Severity = Severity {
    level: 99,
    label: String::new(),
};
const SEVERITY_FAIL_LABEL: &str = "SeverityEvaluationFail";

/// Immutable configuration for one compliance sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Display name; also the default source of the entity id
    pub name: String,

    /// Overrides the object id derived from the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    pub rules: Vec<Rule>,

    /// Publish the internal registries as extra attributes
    #[serde(default)]
    pub show_debug_attributes: bool,
}

impl SensorConfig {
    /// Slug derived from the display name
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Object id part of the sensor's entity id
    pub fn object_id(&self) -> String {
        match &self.unique_id {
            Some(unique_id) => slugify(unique_id),
            None => format!("compliance_{}", self.slug()),
        }
    }

    /// Full entity id the sensor publishes under
    pub fn entity_id(&self) -> String {
        format!("binary_sensor.{}", self.object_id())
    }
}

/// Snapshot of a sensor's timer registries for persistence
///
/// Timers persist as their ISO 8601 expiry instants; rebuilding from a
/// snapshot re-arms wakeups only for expiries still in the future.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSensorState {
    pub is_on: bool,
    #[serde(default)]
    pub violations_registry: IndexMap<String, String>,
    #[serde(default)]
    pub snooze_registry: IndexMap<String, String>,
}

/// Detail row for one active violation
#[derive(Debug, Clone, Serialize)]
struct ViolationDetail {
    entity_id: String,
    severity: u8,
    severity_label: String,
}

/// A compliance binary sensor
pub struct ComplianceSensor {
    config: SensorConfig,
    entity_id: EntityId,
    store: Arc<StateStore>,
    evaluator: ViolationEvaluator,
    flattened_rules: Vec<FlattenedRule>,
    tracked_entities: BTreeSet<String>,

    /// Grace timers keyed by grace target, insertion-ordered
    violations_registry: IndexMap<String, ViolationTimer>,
    /// Snooze expiries keyed by entity id
    snooze_registry: IndexMap<String, ViolationTimer>,

    /// Entity ids counted as active on the last evaluation
    active_violations: Vec<String>,
    is_on: bool,
    write_count: u64,

    timer_tx: mpsc::Sender<TimerFired>,
    timer_rx: Option<mpsc::Receiver<TimerFired>>,
}

impl ComplianceSensor {
    /// Build a sensor: validate rules, compile templates, resolve targets
    pub fn new(
        config: SensorConfig,
        store: Arc<StateStore>,
        templates: Arc<TemplateEngine>,
        resolver: &TargetResolver,
    ) -> Result<Self, EngineError> {
        let entity_id: EntityId = config
            .entity_id()
            .parse()
            .map_err(|err| EngineError::InvalidConfig(format!("bad sensor name: {err}")))?;

        let (flattened_rules, tracked_entities) =
            flatten_rules(&config.slug(), &config.rules, resolver, &templates)?;

        info!(
            sensor = %entity_id,
            rules = config.rules.len(),
            tracked = tracked_entities.len(),
            "Compliance sensor ready"
        );

        let (timer_tx, timer_rx) = mpsc::channel(64);
        Ok(Self {
            config,
            entity_id,
            store,
            evaluator: ViolationEvaluator::new(templates),
            flattened_rules,
            tracked_entities,
            violations_registry: IndexMap::new(),
            snooze_registry: IndexMap::new(),
            active_violations: Vec::new(),
            is_on: false,
            write_count: 0,
            timer_tx,
            timer_rx: Some(timer_rx),
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    /// Entities whose state changes should trigger re-evaluation
    pub fn tracked_entities(&self) -> &BTreeSet<String> {
        &self.tracked_entities
    }

    /// Receiver for timer wakeups; the run loop takes it once
    pub fn take_timer_rx(&mut self) -> Option<mpsc::Receiver<TimerFired>> {
        self.timer_rx.take()
    }

    /// Rebuild timer registries from a persisted snapshot
    pub fn restore(&mut self, persisted: &PersistedSensorState) {
        self.is_on = persisted.is_on;
        self.violations_registry = persisted
            .violations_registry
            .iter()
            .map(|(key, iso)| {
                (
                    key.clone(),
                    ViolationTimer::from_iso(key.clone(), iso, self.timer_tx.clone()),
                )
            })
            .collect();
        self.snooze_registry = persisted
            .snooze_registry
            .iter()
            .map(|(key, iso)| {
                (
                    key.clone(),
                    ViolationTimer::from_iso(key.clone(), iso, self.timer_tx.clone()),
                )
            })
            .collect();
        debug!(
            sensor = %self.entity_id,
            violations = self.violations_registry.len(),
            snoozes = self.snooze_registry.len(),
            "Restored sensor state"
        );
    }

    /// Snapshot the timer registries for persistence
    pub fn persisted_state(&self) -> PersistedSensorState {
        PersistedSensorState {
            is_on: self.is_on,
            violations_registry: self
                .violations_registry
                .iter()
                .map(|(key, timer)| (key.clone(), timer.expiry_iso()))
                .collect(),
            snooze_registry: self
                .snooze_registry
                .iter()
                .map(|(key, timer)| (key.clone(), timer.expiry_iso()))
                .collect(),
        }
    }

    /// Snooze entities until `duration` from now
    ///
    /// An empty target list snoozes everything currently active. Grace
    /// timers are untouched: when the snooze lapses, a still-standing
    /// violation reappears immediately.
    pub fn snooze(&mut self, targets: &[String], duration: Duration) {
        self.snooze_at(targets, duration, Utc::now());
    }

    pub fn snooze_at(&mut self, targets: &[String], duration: Duration, now: DateTime<Utc>) {
        let expiry = now + chrono::Duration::from_std(duration).unwrap_or_default();
        let targets: Vec<String> = if targets.is_empty() {
            self.active_violations.clone()
        } else {
            targets.to_vec()
        };

        info!(sensor = %self.entity_id, ?targets, %expiry, "Snoozing violations");
        for entity_id in targets {
            let timer =
                ViolationTimer::schedule(entity_id.clone(), expiry, self.timer_tx.clone());
            self.snooze_registry.insert(entity_id, timer);
        }
        self.evaluate_at(now);
    }

    /// Evaluate all rules against the current state store
    pub fn evaluate(&mut self) {
        self.evaluate_at(Utc::now());
    }

    /// Evaluate in response to an event, publishing under a child of its
    /// context so the cascade stays traceable
    pub fn evaluate_with_context(&mut self, context: &Context) {
        self.evaluate_inner(Utc::now(), context.child());
    }

    /// Evaluate with an explicit `now` for deterministic timer checks
    pub fn evaluate_at(&mut self, now: DateTime<Utc>) {
        self.evaluate_inner(now, Context::new());
    }

    fn evaluate_inner(&mut self, now: DateTime<Utc>, context: Context) {
        let mut noncompliant: Vec<usize> = Vec::new();
        for (index, rule) in self.flattened_rules.iter().enumerate() {
            let state = self.store.get(&rule.entity_id);
            if self.evaluator.check_rule_violation(rule, state.as_ref()) {
                noncompliant.push(index);
            }
        }

        let mut active: Vec<ViolationDetail> = Vec::new();
        let mut worst = SEVERITY_UNEVALUATED;
        let mut violating_targets: BTreeSet<&str> = BTreeSet::new();

        for &index in &noncompliant {
            let rule = &self.flattened_rules[index];
            violating_targets.insert(&rule.grace_target);

            // First observation arms the grace clock; later passes reuse
            // it so the window never restarts while the violation stands.
            if !self.violations_registry.contains_key(&rule.grace_target) {
                let expiry = now
                    + chrono::Duration::from_std(rule.grace_period).unwrap_or_default();
                self.violations_registry.insert(
                    rule.grace_target.clone(),
                    ViolationTimer::schedule(rule.grace_target.clone(), expiry, self.timer_tx.clone()),
                );
                debug!(
                    sensor = %self.entity_id,
                    grace_target = %rule.grace_target,
                    %expiry,
                    "Violation pending"
                );
            }

            let snoozed = self
                .snooze_registry
                .get(&rule.entity_id)
                .is_some_and(|snooze| !snooze.is_expired_at(now));
            if snoozed {
                continue;
            }

            let confirmed = self
                .violations_registry
                .get(&rule.grace_target)
                .is_some_and(|grace| grace.is_expired_at(now));
            if confirmed {
                if rule.severity.level < worst.level {
                    worst = rule.severity.clone();
                }
                active.push(ViolationDetail {
                    entity_id: rule.entity_id.clone(),
                    severity: rule.severity.level,
                    severity_label: rule.severity.label.clone(),
                });
            }
        }

        // Sweep grace targets that went compliant; dropping the timer
        // aborts its wakeup. Lapsed snoozes are pruned the same way.
        self.violations_registry
            .retain(|key, _| violating_targets.contains(key.as_str()));
        self.snooze_registry
            .retain(|_, snooze| !snooze.is_expired_at(now));

        self.active_violations = active
            .iter()
            .map(|detail| detail.entity_id.clone())
            .collect();
        self.is_on = !active.is_empty();
        self.write_count += 1;

        self.publish(&active, &worst, context);
    }

    fn publish(&self, active: &[ViolationDetail], worst: &Severity, context: Context) {
        let mut attrs: HashMap<String, Value> = HashMap::new();

        if self.is_on {
            attrs.insert(attributes::SEVERITY.to_string(), json!(worst.level));
            let label = if worst.label.is_empty() {
                SEVERITY_FAIL_LABEL
            } else {
                worst.label.as_str()
            };
            attrs.insert(attributes::SEVERITY_LABEL.to_string(), json!(label));
        } else {
            attrs.insert(attributes::SEVERITY.to_string(), json!(""));
            attrs.insert(attributes::SEVERITY_LABEL.to_string(), json!(""));
        }

        let grace_periods: BTreeSet<String> = self
            .config
            .rules
            .iter()
            .filter_map(|rule| rule.grace_period.map(format_duration))
            .collect();
        attrs.insert(attributes::GRACE_PERIODS.to_string(), json!(grace_periods));
        attrs.insert(
            attributes::ACTIVE_VIOLATIONS.to_string(),
            json!(self.active_violations),
        );
        attrs.insert(attributes::ACTIVE_COUNT.to_string(), json!(active.len()));

        let snoozes: IndexMap<&String, String> = self
            .snooze_registry
            .iter()
            .map(|(key, timer)| (key, timer.expiry_iso()))
            .collect();
        attrs.insert(attributes::SNOOZE_REGISTRY.to_string(), json!(snoozes));

        if self.config.show_debug_attributes {
            let violations: IndexMap<&String, String> = self
                .violations_registry
                .iter()
                .map(|(key, timer)| (key, timer.expiry_iso()))
                .collect();
            attrs.insert(attributes::VIOLATIONS_REGISTRY.to_string(), json!(violations));
            attrs.insert(
                attributes::TRACKED_ENTITIES.to_string(),
                json!(self.tracked_entities),
            );
            attrs.insert(attributes::VIOLATIONS_DEBUG.to_string(), json!(active));
            attrs.insert(
                attributes::STATUS.to_string(),
                json!(if self.is_on { "Non-Compliant" } else { "Compliant" }),
            );
            attrs.insert(
                attributes::WRITE_OPERATIONS.to_string(),
                json!(self.write_count),
            );
        }

        self.store.set(
            self.entity_id.clone(),
            if self.is_on { "on" } else { "off" },
            attrs,
            context,
        );
    }

    /// Cancel all timers; the sensor can be dropped or rebuilt afterwards
    pub fn shutdown(&mut self) {
        debug!(sensor = %self.entity_id, "Shutting down sensor");
        self.violations_registry.clear();
        self.snooze_registry.clear();
    }
}

/// Lowercase, non-alphanumerics collapsed to single underscores
pub(crate) fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    slug.trim_end_matches('_').to_string()
}
