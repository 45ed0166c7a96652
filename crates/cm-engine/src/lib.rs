//! Compliance rule evaluation and violation-lifecycle engine
//!
//! A compliance sensor watches a set of entities and reports, as a binary
//! sensor, whether any of them currently violate a declared rule. Rules
//! target entities directly or through device/area/label registry lookups,
//! carry a recursive condition tree evaluated in "violates" space, and can
//! delay reporting with a grace period. Violations can be snoozed per
//! entity without resetting their grace clocks, and a global aggregator
//! rolls several sensors up into one.

mod aggregate;
mod condition;
mod error;
mod eval;
mod manager;
mod resolver;
mod rule;
mod sensor;
mod severity;
mod timer;

pub use aggregate::{GlobalAggregator, GlobalConfig};
pub use condition::{
    AtomicCondition, Condition, ConditionError, ExpectedState, NumericRange, MAX_CONDITION_DEPTH,
};
pub use error::{EngineError, EngineResult};
pub use eval::ViolationEvaluator;
pub use manager::{ComplianceManager, ManagerConfig};
pub use resolver::TargetResolver;
pub use rule::{flatten_rules, format_duration, FlattenedRule, Rule, Target};
pub use sensor::{attributes, ComplianceSensor, PersistedSensorState, SensorConfig};
pub use severity::{canonical_label, named_level, Severity, SeverityConfig, DEFAULT_SEVERITY};
pub use timer::{TimerFired, ViolationTimer};
