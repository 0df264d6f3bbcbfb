//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading configuration or installing tracing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to write a config file.
    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize config.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is present but unusable.
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// A global tracing subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Logging(String),
}
