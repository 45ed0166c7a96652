//! Error types for the compliance engine

use crate::condition::ConditionError;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while loading or running compliance sensors
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule's condition tree failed validation
    #[error("invalid condition in rule {rule_index}: {source}")]
    InvalidCondition {
        rule_index: usize,
        #[source]
        source: ConditionError,
    },

    /// A declared `value_template` did not compile
    #[error("invalid template in rule {rule_index}: {source}")]
    InvalidTemplate {
        rule_index: usize,
        #[source]
        source: cm_template::TemplateError,
    },

    /// Bad configuration value outside the condition tree
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to parse a YAML configuration document
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Lookup of a managed sensor by entity id failed
    #[error("no compliance sensor named {0}")]
    SensorNotFound(String),
}
