//! # File-vault `ValueProvider`
//!
//! Reads secrets from an encrypted JSON file on disk, where each leaf is
//! `{ _encrypted, _iv, _authTag, _data }`, AES-256-GCM encrypted with a key
//! derived by SHA-256 from the caller-supplied passphrase. Nested keys are
//! addressed with dot notation (`"database.password"`).

mod crypto;
mod error;

pub use crypto::{decrypt, encrypt, EncryptedLeaf};
pub use error::VaultError;

use async_trait::async_trait;
use questrunner_plugin::{ProviderContext, Result, ValueProvider};
use serde::Deserialize;
use serde_json::Value;

/// `config` shape this provider expects from `RuntimeOptions.plugins["file-vault"]`.
#[derive(Debug, Clone, Deserialize)]
struct FileVaultConfig {
    /// Path to the encrypted vault JSON file.
    file: String,
    /// Passphrase the leaves were encrypted with; SHA-256'd into the AES key.
    key: String,
}

/// The encrypted file-vault `ValueProvider`.
#[derive(Debug, Default)]
pub struct FileVaultProvider;

impl FileVaultProvider {
    /// A new file-vault provider instance. Stateless; the vault file is
    /// read fresh on every lookup so external edits are picked up.
    pub fn new() -> Self {
        Self
    }

    async fn load(&self, config: &FileVaultConfig) -> Result<Value> {
        let contents = tokio::fs::read_to_string(&config.file).await.map_err(VaultError::from)?;
        serde_json::from_str(&contents)
            .map_err(|e| VaultError::Malformed(format!("vault file is not valid JSON: {e}")).into())
    }
}

fn navigate<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in key.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[async_trait]
impl ValueProvider for FileVaultProvider {
    fn provider_id(&self) -> &str {
        "file-vault"
    }

    fn validate(&self, config: &Value) -> Result<()> {
        let parsed: FileVaultConfig = serde_json::from_value(config.clone())
            .map_err(|e| VaultError::InvalidConfiguration(e.to_string()))?;
        if parsed.file.trim().is_empty() {
            return Err(VaultError::InvalidConfiguration("'file' must not be empty".to_string()).into());
        }
        if parsed.key.trim().is_empty() {
            return Err(VaultError::InvalidConfiguration("'key' must not be empty".to_string()).into());
        }
        Ok(())
    }

    async fn get_value(
        &self,
        key: &str,
        config: &Value,
        _context: Option<&ProviderContext>,
    ) -> Result<Option<String>> {
        let parsed: FileVaultConfig = serde_json::from_value(config.clone())
            .map_err(|e| VaultError::InvalidConfiguration(e.to_string()))?;
        let root = self.load(&parsed).await?;

        let Some(leaf) = navigate(&root, key) else {
            return Ok(None);
        };

        if let Value::String(plain) = leaf {
            return Ok(Some(plain.clone()));
        }

        let encrypted: EncryptedLeaf = serde_json::from_value(leaf.clone())
            .map_err(|e| VaultError::Malformed(format!("'{key}' is not an encrypted leaf: {e}")))?;
        let decrypted = decrypt(&parsed.key, &encrypted)?;
        Ok(Some(decrypted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_vault_file(passphrase: &str) -> tempfile::NamedTempFile {
        let db_password = encrypt(passphrase, "hunter2").unwrap();
        let api_key = encrypt(passphrase, "sk-abc-123").unwrap();
        let contents = json!({
            "database": { "password": db_password },
            "api": { "key": api_key },
            "plain_note": "not a secret",
        });
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&contents).unwrap().as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn resolves_dot_notation_nested_key() {
        let file = write_vault_file("passphrase");
        let provider = FileVaultProvider::new();
        let config = json!({"file": file.path().to_str().unwrap(), "key": "passphrase"});
        let value = provider.get_value("database.password", &config, None).await.unwrap();
        assert_eq!(value, Some("hunter2".to_string()));
    }

    #[tokio::test]
    async fn missing_key_returns_none_not_error() {
        let file = write_vault_file("passphrase");
        let provider = FileVaultProvider::new();
        let config = json!({"file": file.path().to_str().unwrap(), "key": "passphrase"});
        let value = provider.get_value("database.missing", &config, None).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn plain_string_leaves_pass_through_undecrypted() {
        let file = write_vault_file("passphrase");
        let provider = FileVaultProvider::new();
        let config = json!({"file": file.path().to_str().unwrap(), "key": "passphrase"});
        let value = provider.get_value("plain_note", &config, None).await.unwrap();
        assert_eq!(value, Some("not a secret".to_string()));
    }

    #[tokio::test]
    async fn wrong_passphrase_errors() {
        let file = write_vault_file("passphrase");
        let provider = FileVaultProvider::new();
        let config = json!({"file": file.path().to_str().unwrap(), "key": "wrong"});
        assert!(provider.get_value("database.password", &config, None).await.is_err());
    }

    #[test]
    fn validate_rejects_empty_file_path() {
        let provider = FileVaultProvider::new();
        let config = json!({"file": "", "key": "x"});
        assert!(provider.validate(&config).is_err());
    }
}
