//! Bearer token `AuthPlugin`.

use crate::error::AuthError;
use async_trait::async_trait;
use questrunner_plugin::{
    AuthInfo, AuthPlugin, AuthSpec, ProtocolOptions, ProtocolRequest, Result, ValidationError,
    ValidationResult, ValidationSource,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BearerData {
    token: String,
    #[serde(default)]
    prefix: Option<String>,
}

/// Injects `Authorization: <prefix> <token>` (prefix defaults to `Bearer`).
#[derive(Debug, Default)]
pub struct BearerAuthPlugin;

impl BearerAuthPlugin {
    /// A new bearer auth plugin instance.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthPlugin for BearerAuthPlugin {
    fn info(&self) -> AuthInfo {
        AuthInfo {
            auth_types: vec!["bearer".to_string()],
            protocols: vec!["http".to_string(), "https".to_string()],
            data_schema: serde_json::json!({
                "type": "object",
                "required": ["token"],
                "properties": {
                    "token": { "type": "string", "minLength": 1 },
                    "prefix": { "type": "string" }
                }
            }),
            name: "questrunner-auth-bearer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn validate(&self, auth: &AuthSpec, _options: &ProtocolOptions) -> ValidationResult {
        match serde_json::from_value::<BearerData>(auth.data.clone()) {
            Ok(data) if !data.token.trim().is_empty() => ValidationResult::ok(),
            Ok(_) => ValidationResult::failed(vec![ValidationError::from_plugin(
                ValidationSource::Auth,
                "bearer auth requires a non-empty 'token'",
            )]),
            Err(e) => ValidationResult::failed(vec![ValidationError::from_plugin(
                ValidationSource::Auth,
                format!("invalid bearer auth data: {e}"),
            )]),
        }
    }

    async fn apply(
        &self,
        mut request: ProtocolRequest,
        auth: &AuthSpec,
        _options: &ProtocolOptions,
    ) -> Result<ProtocolRequest> {
        let data: BearerData = serde_json::from_value(auth.data.clone())
            .map_err(|e| AuthError::InvalidData(e.to_string()))?;
        let prefix = data.prefix.unwrap_or_else(|| "Bearer".to_string());
        request.headers.insert("Authorization".to_string(), format!("{prefix} {}", data.token));
        Ok(request)
    }
}
