//! Error type shared by the bearer/basic/OAuth2 auth plugins.

use questrunner_plugin::PluginError;

/// Result alias used throughout `questrunner-auth`.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors an `AuthPlugin` implementation in this crate can surface.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// `auth.data` was missing a required field or had the wrong shape.
    #[error("invalid auth data: {0}")]
    InvalidData(String),

    /// A header could not be constructed from the credential material.
    #[error("malformed credential header: {0}")]
    MalformedHeader(String),

    /// The OAuth2 client-credentials token request failed.
    #[error("token request failed: {0}")]
    TokenRequest(String),
}

impl From<AuthError> for PluginError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidData(message) => PluginError::invalid_configuration(message),
            other => PluginError::execution(other.to_string()),
        }
    }
}
