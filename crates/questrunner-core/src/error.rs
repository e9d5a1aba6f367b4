//! Error types for the collection execution engine.

/// Result type alias used throughout `questrunner-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the collection execution engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A collection/script failed static validation.
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable description.
        message: String,
    },

    /// The task graph could not be built (cycle, dangling `dependsOn`, …).
    #[error("graph error: {message}")]
    Graph {
        /// Human-readable description.
        message: String,
    },

    /// A user script threw an uncaught error or violated a sandbox rule.
    #[error("script error: {message}")]
    Script {
        /// Human-readable description.
        message: String,
    },

    /// The scheduler encountered an unrecoverable condition.
    #[error("scheduler error: {message}")]
    Scheduler {
        /// Human-readable description.
        message: String,
    },

    /// A `ProtocolPlugin`, `AuthPlugin`, or `ValueProvider` call failed.
    #[error("plugin error: {0}")]
    Plugin(#[from] questrunner_plugin::PluginError),

    /// The run was aborted (external cancellation or bail).
    #[error("run aborted: {reason}")]
    Aborted {
        /// Why the run was aborted.
        reason: String,
    },

    /// An uncaught script error during a pre- or post-script. The scheduler
    /// fails the whole `run()` call rather than continuing, but the history
    /// accumulated so far is retained on the error so callers don't lose it.
    #[error("script error during run: {message}")]
    ScriptFailed {
        /// The thrown error's message.
        message: String,
        /// Everything the scheduler had produced before the failure.
        partial_result: Box<crate::context::RunResult>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Catch-all for conditions that don't fit the variants above.
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Generic(message)
    }
}

impl Error {
    /// Build an [`Error::Validation`].
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build an [`Error::Graph`].
    pub fn graph<S: Into<String>>(message: S) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    /// Build an [`Error::Script`].
    pub fn script<S: Into<String>>(message: S) -> Self {
        Self::Script {
            message: message.into(),
        }
    }

    /// Build an [`Error::Scheduler`].
    pub fn scheduler<S: Into<String>>(message: S) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Build a generic error.
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}
