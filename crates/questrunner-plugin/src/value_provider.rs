//! The `ValueProvider` interface — external value sources (file vault,
//! environment, …) consulted by the variable resolution cascade.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Read-only execution context passed to a provider, so it can make
/// request-scoped decisions (e.g. a vault that rotates keys per environment).
#[derive(Debug, Clone, Default)]
pub struct ProviderContext {
    /// The active environment name, if any.
    pub environment_name: Option<String>,
    /// Arbitrary key/value metadata the caller wants the provider to see.
    pub metadata: HashMap<String, String>,
}

/// Value providers (file vault, environment, …) implement this trait; the
/// engine never depends on a concrete source.
#[async_trait]
pub trait ValueProvider: Send + Sync {
    /// Stable identifier for this provider (`"file-vault"`, `"env"`, …).
    fn provider_id(&self) -> &str;

    /// Validate a provider configuration blob before use.
    fn validate(&self, config: &Value) -> Result<()>;

    /// Resolve `key` (dot-notation for nested structures) against `config`,
    /// returning `None` when the key does not exist rather than erroring.
    async fn get_value(
        &self,
        key: &str,
        config: &Value,
        context: Option<&ProviderContext>,
    ) -> Result<Option<String>>;
}
