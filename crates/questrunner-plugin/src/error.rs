//! Error types for the plugin system.

/// Result type alias used throughout plugin implementations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors a `ProtocolPlugin`, `AuthPlugin`, or `ValueProvider` can surface.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin's static configuration failed schema/semantic validation.
    #[error("invalid plugin configuration: {message}")]
    InvalidConfiguration {
        /// Human-readable description of what is wrong.
        message: String,
    },

    /// The plugin failed while executing (network error, auth failure, …).
    #[error("plugin execution error: {message}")]
    ExecutionError {
        /// Human-readable description of the failure.
        message: String,
    },

    /// The plugin's operation did not complete before its deadline.
    #[error("plugin execution timed out after {timeout_ms}ms")]
    TimeoutError {
        /// The timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// A requested value/key could not be located by the provider.
    #[error("value not found: {key}")]
    NotFound {
        /// The key that was requested.
        key: String,
    },

    /// Catch-all for conditions that don't fit the variants above.
    #[error("plugin error: {0}")]
    Generic(String),
}

impl PluginError {
    /// Build an [`PluginError::ExecutionError`].
    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    /// Build an [`PluginError::InvalidConfiguration`].
    pub fn invalid_configuration<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Build a [`PluginError::Generic`].
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        Self::Generic(message)
    }
}
