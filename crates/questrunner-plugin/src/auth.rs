//! The `AuthPlugin` interface — concrete auth schemes (bearer, basic,
//! OAuth2, …) are external collaborators accessed only through this trait.

use crate::error::Result;
use crate::protocol::{ProtocolOptions, ProtocolRequest};
use crate::validation::ValidationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An auth block as attached to a Collection/Folder/Request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSpec {
    /// `"inherit"`, `"none"`, or a plugin id.
    #[serde(rename = "type")]
    pub auth_type: String,
    /// Plugin-specific credential data (tokens, usernames, client ids, …).
    #[serde(default)]
    pub data: Value,
}

impl AuthSpec {
    /// The `{type: "inherit"}` sentinel.
    pub fn inherit() -> Self {
        Self {
            auth_type: "inherit".to_string(),
            data: Value::Null,
        }
    }

    /// The `{type: "none"}` sentinel.
    pub fn none() -> Self {
        Self {
            auth_type: "none".to_string(),
            data: Value::Null,
        }
    }

    /// True for the `"inherit"` sentinel.
    pub fn is_inherit(&self) -> bool {
        self.auth_type == "inherit"
    }

    /// True for the `"none"` sentinel.
    pub fn is_none(&self) -> bool {
        self.auth_type == "none"
    }
}

/// Static capability description for an `AuthPlugin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Auth type identifiers this plugin handles (`"bearer"`, `"basic"`, …).
    pub auth_types: Vec<String>,
    /// Protocols this plugin can attach credentials to.
    pub protocols: Vec<String>,
    /// JSON Schema describing the shape `AuthSpec.data` must have for this
    /// plugin's `validate`/`apply` calls.
    pub data_schema: Value,
    /// Plugin name, for diagnostics.
    pub name: String,
    /// Plugin version string.
    pub version: String,
}

/// Auth plugins (bearer, basic, OAuth2, …) implement this trait; the engine
/// never depends on a concrete scheme.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    /// Static capability description.
    fn info(&self) -> AuthInfo;

    /// Statically validate an auth block's `data` shape.
    fn validate(&self, auth: &AuthSpec, options: &ProtocolOptions) -> ValidationResult;

    /// Mutate `request` (typically its headers) to carry credentials.
    /// Returns the mutated request; plugins that need an async token fetch
    /// (OAuth2 client-credentials) may perform it here.
    async fn apply(
        &self,
        request: ProtocolRequest,
        auth: &AuthSpec,
        options: &ProtocolOptions,
    ) -> Result<ProtocolRequest>;
}
