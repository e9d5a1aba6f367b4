//! Error type for the HTTP protocol plugin.

use questrunner_plugin::PluginError;

/// Result alias used throughout `questrunner-http`.
pub type Result<T> = std::result::Result<T, HttpError>;

/// Errors the HTTP `ProtocolPlugin` can surface.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// A header name or value, or the request URL, was malformed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The underlying `reqwest` client could not be built or the request
    /// failed to send (DNS, TLS, connection refused, …).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A `body.mode` the plugin does not recognize.
    #[error("unsupported body mode: {0}")]
    UnsupportedBodyMode(String),

    /// Base64 payload for `mode: "binary"` failed to decode.
    #[error("invalid base64 body: {0}")]
    InvalidBinaryBody(#[from] base64::DecodeError),
}

impl From<HttpError> for PluginError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::Malformed(message) => PluginError::invalid_configuration(message),
            other => PluginError::execution(other.to_string()),
        }
    }
}
