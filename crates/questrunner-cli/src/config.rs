//! Layered `RuntimeOptions` configuration: a YAML/JSON config file, an
//! optional named profile within it, then CLI flags/env vars, outermost
//! wins — mirroring `mockforge-core::config::load_config_with_profile` /
//! `apply_profile` / `apply_env_overrides`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Execution knobs a config file or profile may override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionOverrides {
    pub allow_parallel: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub bail: Option<bool>,
}

/// One config file's worth of overrides, and optionally a set of named
/// profiles carrying further overrides of the same shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub data: Option<std::path::PathBuf>,
    pub iterations: Option<i64>,
    pub strict_mode: Option<bool>,
    pub request_timeout_ms: Option<u64>,
    pub follow_redirects: Option<bool>,
    pub max_redirects: Option<u32>,
    pub execution: ExecutionOverrides,
    pub log_level: Option<String>,
    pub profiles: HashMap<String, ConfigFile>,
}

impl ConfigFile {
    /// Merge `other`'s `Some` fields over `self`'s, the way
    /// `mockforge-core::config::apply_profile` merges a profile onto a
    /// base config — each field is independently overridable.
    fn merge(mut self, other: ConfigFile) -> Self {
        macro_rules! merge_field {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        merge_field!(data);
        merge_field!(iterations);
        merge_field!(strict_mode);
        merge_field!(request_timeout_ms);
        merge_field!(follow_redirects);
        merge_field!(max_redirects);
        merge_field!(log_level);
        if other.execution.allow_parallel.is_some() {
            self.execution.allow_parallel = other.execution.allow_parallel;
        }
        if other.execution.max_concurrency.is_some() {
            self.execution.max_concurrency = other.execution.max_concurrency;
        }
        if other.execution.bail.is_some() {
            self.execution.bail = other.execution.bail;
        }
        self
    }
}

/// Reads and parses a config file, dispatching on its extension exactly as
/// `mockforge-core::config::load_config` does (`.yaml`/`.yml` vs. anything
/// else treated as JSON).
pub async fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );
    let config = if is_yaml {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?
    } else {
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?
    };
    Ok(config)
}

/// Applies a named profile from `config.profiles` onto `config`, clearing
/// the profile table afterward (it has served its purpose).
pub fn apply_profile(mut config: ConfigFile, profile_name: Option<&str>) -> Result<ConfigFile> {
    if let Some(name) = profile_name {
        let profile = config
            .profiles
            .remove(name)
            .with_context(|| {
                format!(
                    "profile '{name}' not found in configuration. Available profiles: {}",
                    config.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            })?;
        config = config.merge(profile);
    }
    config.profiles.clear();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_yaml_config_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, "iterations: 3\nexecution:\n  bail: true\n").await.unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.iterations, Some(3));
        assert_eq!(config.execution.bail, Some(true));
    }

    #[tokio::test]
    async fn profile_overrides_base_fields_only_where_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "iterations: 1\nexecution:\n  max_concurrency: 2\nprofiles:\n  ci:\n    execution:\n      bail: true\n",
        )
        .await
        .unwrap();
        let config = load_config(&path).await.unwrap();
        let merged = apply_profile(config, Some("ci")).unwrap();
        assert_eq!(merged.iterations, Some(1));
        assert_eq!(merged.execution.max_concurrency, Some(2));
        assert_eq!(merged.execution.bail, Some(true));
        assert!(merged.profiles.is_empty());
    }

    #[tokio::test]
    async fn unknown_profile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, "iterations: 1\n").await.unwrap();
        let config = load_config(&path).await.unwrap();
        assert!(apply_profile(config, Some("missing")).is_err());
    }
}
