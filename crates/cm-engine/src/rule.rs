//! Rule configuration and flattening
//!
//! A rule as configured targets a set of entities through registry
//! selectors and carries one condition tree. Before evaluation it is
//! flattened into one [`FlattenedRule`] per resolved entity, with the
//! severity resolved and the grace-target key fixed. Grace targets key
//! the violation registry: normally the entity id, but rules with
//! `group_grace` share one key per rule so the whole group runs on a
//! single grace clock.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::condition::Condition;
use crate::error::EngineError;
use crate::severity::{Severity, SeverityConfig, MAX_SEVERITY_LEVEL};
use crate::TargetResolver;
use cm_template::TemplateEngine;

/// Registry selectors naming the entities a rule applies to
///
/// Each field accepts a single id or a list; the resolved set is the
/// union of all selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub entity_id: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub device_id: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub area_id: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub label_id: Vec<String>,
}

impl Target {
    /// Whether any selector is declared
    pub fn is_empty(&self) -> bool {
        self.entity_id.is_empty()
            && self.device_id.is_empty()
            && self.area_id.is_empty()
            && self.label_id.is_empty()
    }
}

/// One compliance rule as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub target: Target,

    /// Condition tree; a list is an implicit `and` in violates-space
    #[serde(deserialize_with = "one_or_many")]
    pub condition: Vec<Condition>,

    /// Do not treat `unavailable` as a violation
    #[serde(default)]
    pub allow_unavailable: bool,

    /// Do not treat `unknown` as a violation
    #[serde(default)]
    pub allow_unknown: bool,

    /// How long a violation must persist before it is reported
    #[serde(default, with = "grace_serde", skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<Duration>,

    /// Share one grace clock across all of the rule's entities
    #[serde(default)]
    pub group_grace: bool,

    #[serde(default)]
    pub severity: SeverityConfig,
}

impl Rule {
    /// Grace period, zero when none is declared
    pub fn effective_grace(&self) -> Duration {
        self.grace_period.unwrap_or(Duration::ZERO)
    }

    fn validate(&self, rule_index: usize) -> Result<(), EngineError> {
        if self.target.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "rule {rule_index} has an empty target"
            )));
        }
        if self.condition.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "rule {rule_index} has no conditions"
            )));
        }
        for condition in &self.condition {
            condition
                .validate()
                .map_err(|source| EngineError::InvalidCondition { rule_index, source })?;
        }
        if let SeverityConfig::Explicit { level, .. } = &self.severity {
            if *level > MAX_SEVERITY_LEVEL {
                return Err(EngineError::InvalidConfig(format!(
                    "rule {rule_index} severity level {level} exceeds {MAX_SEVERITY_LEVEL}"
                )));
            }
        }
        Ok(())
    }
}

/// A rule expanded to a single entity, ready for evaluation
#[derive(Debug, Clone)]
pub struct FlattenedRule {
    pub entity_id: String,
    /// Key into the violation registry
    pub grace_target: String,
    pub condition: Vec<Condition>,
    pub allow_unavailable: bool,
    pub allow_unknown: bool,
    pub grace_period: Duration,
    pub severity: Severity,
}

/// Expand configured rules into per-entity flattened rules
///
/// Validates every condition tree and compiles every template once, so a
/// sensor with bad configuration fails at setup instead of silently
/// misreporting later. Also returns the full set of tracked entity ids.
pub fn flatten_rules(
    sensor_slug: &str,
    rules: &[Rule],
    resolver: &TargetResolver,
    templates: &TemplateEngine,
) -> Result<(Vec<FlattenedRule>, BTreeSet<String>), EngineError> {
    let mut flattened = Vec::new();
    let mut tracked = BTreeSet::new();

    for (rule_index, rule) in rules.iter().enumerate() {
        rule.validate(rule_index)?;
        for condition in &rule.condition {
            condition.for_each_template(&mut |template| {
                templates
                    .syntax_check(template)
                    .map_err(|source| EngineError::InvalidTemplate { rule_index, source })
            })?;
        }

        let severity = rule.severity.resolve();
        let mut entity_ids: Vec<String> = resolver.resolve(&rule.target).into_iter().collect();
        entity_ids.sort();

        for entity_id in entity_ids {
            let grace_target = if rule.group_grace {
                format!("{sensor_slug}___rule_{rule_index}")
            } else {
                entity_id.clone()
            };
            tracked.insert(entity_id.clone());
            flattened.push(FlattenedRule {
                entity_id,
                grace_target,
                condition: rule.condition.clone(),
                allow_unavailable: rule.allow_unavailable,
                allow_unknown: rule.allow_unknown,
                grace_period: rule.effective_grace(),
                severity: severity.clone(),
            });
        }
    }

    debug!(
        sensor = sensor_slug,
        rules = rules.len(),
        flattened = flattened.len(),
        tracked = tracked.len(),
        "Flattened rules"
    );
    Ok((flattened, tracked))
}

/// Render a duration as `H:MM:SS` for the grace-period attribute
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Accept a single value or a list for a field
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Grace periods are written as integer seconds or `H:MM:SS` / `MM:SS`
mod grace_serde {
    use super::format_duration;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(Raw::Text(text)) => parse_clock(&text)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid duration: {text}"))),
        }
    }

    /// Parse `SS`, `MM:SS` or `H:MM:SS`
    fn parse_clock(text: &str) -> Option<Duration> {
        let parts: Vec<&str> = text.trim().split(':').collect();
        let parsed: Option<Vec<u64>> = parts.iter().map(|p| p.parse().ok()).collect();
        let parsed = parsed?;
        let secs = match parsed.as_slice() {
            [s] => *s,
            [m, s] => m * 60 + s,
            [h, m, s] => h * 3600 + m * 60 + s,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }
}
