//! Error type for the file-vault value provider.

use questrunner_plugin::PluginError;

/// Result alias used throughout `questrunner-vault`.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors the file-vault `ValueProvider` can surface.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The provider's configuration blob was missing `file` or malformed.
    #[error("invalid vault configuration: {0}")]
    InvalidConfiguration(String),

    /// The vault file could not be read from disk.
    #[error("failed to read vault file: {0}")]
    Io(#[from] std::io::Error),

    /// The vault file was not valid JSON, or a dot-notation path segment
    /// did not resolve to an object/leaf.
    #[error("malformed vault file: {0}")]
    Malformed(String),

    /// AES-256-GCM decryption failed — wrong key, truncated ciphertext, or
    /// a tampered `_authTag`.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl From<VaultError> for PluginError {
    fn from(error: VaultError) -> Self {
        match error {
            VaultError::InvalidConfiguration(message) => PluginError::invalid_configuration(message),
            other => PluginError::execution(other.to_string()),
        }
    }
}
