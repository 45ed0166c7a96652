//! Severity levels for rule violations
//!
//! Lower level means more severe. Rules either name a well-known level
//! (`critical`, `problem`, ...) or spell out a numeric level with an
//! optional custom label.

use serde::{Deserialize, Serialize};

/// Severity used when a rule declares none
pub const DEFAULT_SEVERITY: &str = "problem";

/// Highest numeric level accepted for explicit severities
pub const MAX_SEVERITY_LEVEL: u8 = 100;

/// Severity as declared in rule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeverityConfig {
    /// A well-known level name, e.g. `"warning"`
    Named(String),
    /// An explicit numeric level with an optional display label
    Explicit { level: u8, label: Option<String> },
}

impl Default for SeverityConfig {
    fn default() -> Self {
        SeverityConfig::Named(DEFAULT_SEVERITY.to_string())
    }
}

/// A resolved severity, ready for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Severity {
    pub level: u8,
    pub label: String,
}

/// Numeric level for a well-known severity name
pub fn named_level(name: &str) -> Option<u8> {
    match name.to_lowercase().as_str() {
        "critical" => Some(0),
        "problem" => Some(1),
        "warning" => Some(2),
        "unusual" => Some(3),
        "info" => Some(4),
        _ => None,
    }
}

/// Display label for a well-known severity level
pub fn canonical_label(level: u8) -> Option<&'static str> {
    match level {
        0 => Some("Critical"),
        1 => Some("Problem"),
        2 => Some("Warning"),
        3 => Some("Unusual"),
        4 => Some("Info"),
        _ => None,
    }
}

impl SeverityConfig {
    /// Resolve the declared severity to a concrete level and label
    ///
    /// Unknown names fall back to the `problem` level but keep the
    /// declared name as the label, so misconfigured rules still report
    /// something recognizable instead of failing the whole sensor.
    pub fn resolve(&self) -> Severity {
        match self {
            SeverityConfig::Named(name) => Severity {
                level: named_level(name).unwrap_or(1),
                label: capitalize(name),
            },
            SeverityConfig::Explicit { level, label } => Severity {
                level: *level,
                label: label
                    .clone()
                    .unwrap_or_else(|| match canonical_label(*level) {
                        Some(canon) => canon.to_string(),
                        None => format!("Level {level}"),
                    }),
            },
        }
    }

    /// Numeric level without building the label
    pub fn level(&self) -> u8 {
        match self {
            SeverityConfig::Named(name) => named_level(name).unwrap_or(1),
            SeverityConfig::Explicit { level, .. } => *level,
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
