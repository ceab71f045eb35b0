//! Model-level errors.

use thiserror::Error;

/// Errors raised while loading or validating a run configuration.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A settings value is out of its accepted range.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    /// The topology references an unknown or duplicate mote.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// YAML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Reading the configuration file failed.
    #[error("failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),
}
