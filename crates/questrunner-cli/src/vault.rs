//! Optional pre-run secret injection from the `questrunner-vault`
//! `ValueProvider`: `--vault-var NAME=dot.path` entries are resolved against
//! `--vault-file` (decrypted with the passphrase in `--vault-key-env`) and
//! seeded into `RuntimeOptions.global_variables` before the run starts.

use anyhow::{bail, Context, Result};
use questrunner_plugin::ValueProvider;
use questrunner_vault::FileVaultProvider;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

/// Resolves every `name=dot.path` entry in `vars` against the vault file at
/// `file`, decrypted with the passphrase held in the environment variable
/// named `key_env`.
pub async fn resolve_vault_vars(
    file: &Path,
    key_env: &str,
    vars: &[String],
) -> Result<HashMap<String, Value>> {
    let key = std::env::var(key_env)
        .with_context(|| format!("vault passphrase env var '{key_env}' is not set"))?;
    let config = json!({"file": file.to_string_lossy(), "key": key});

    let provider = FileVaultProvider::new();
    provider.validate(&config).context("invalid vault configuration")?;

    let mut resolved = HashMap::new();
    for entry in vars {
        let Some((name, dot_path)) = entry.split_once('=') else {
            bail!("'--vault-var {entry}' must be in NAME=dot.path form");
        };
        let value = provider
            .get_value(dot_path, &config, None)
            .await
            .with_context(|| format!("failed to resolve vault key '{dot_path}'"))?
            .with_context(|| format!("vault has no value at '{dot_path}'"))?;
        resolved.insert(name.to_string(), Value::String(value));
    }
    Ok(resolved)
}
