//! HTTP Basic `AuthPlugin`.

use crate::error::AuthError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use questrunner_plugin::{
    AuthInfo, AuthPlugin, AuthSpec, ProtocolOptions, ProtocolRequest, Result, ValidationError,
    ValidationResult, ValidationSource,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BasicData {
    username: String,
    #[serde(default)]
    password: String,
}

/// Injects `Authorization: Basic base64(username:password)`.
#[derive(Debug, Default)]
pub struct BasicAuthPlugin;

impl BasicAuthPlugin {
    /// A new basic auth plugin instance.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthPlugin for BasicAuthPlugin {
    fn info(&self) -> AuthInfo {
        AuthInfo {
            auth_types: vec!["basic".to_string()],
            protocols: vec!["http".to_string(), "https".to_string()],
            data_schema: serde_json::json!({
                "type": "object",
                "required": ["username"],
                "properties": {
                    "username": { "type": "string", "minLength": 1 },
                    "password": { "type": "string" }
                }
            }),
            name: "questrunner-auth-basic".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn validate(&self, auth: &AuthSpec, _options: &ProtocolOptions) -> ValidationResult {
        match serde_json::from_value::<BasicData>(auth.data.clone()) {
            Ok(data) if !data.username.is_empty() => ValidationResult::ok(),
            Ok(_) => ValidationResult::failed(vec![ValidationError::from_plugin(
                ValidationSource::Auth,
                "basic auth requires a non-empty 'username'",
            )]),
            Err(e) => ValidationResult::failed(vec![ValidationError::from_plugin(
                ValidationSource::Auth,
                format!("invalid basic auth data: {e}"),
            )]),
        }
    }

    async fn apply(
        &self,
        mut request: ProtocolRequest,
        auth: &AuthSpec,
        _options: &ProtocolOptions,
    ) -> Result<ProtocolRequest> {
        let data: BasicData = serde_json::from_value(auth.data.clone())
            .map_err(|e| AuthError::InvalidData(e.to_string()))?;
        let encoded = BASE64.encode(format!("{}:{}", data.username, data.password));
        request.headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_request() -> ProtocolRequest {
        ProtocolRequest {
            id: "r1".to_string(),
            name: "Sample".to_string(),
            method: "GET".to_string(),
            url: "https://example.com".to_string(),
            headers: HashMap::new(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn apply_base64_encodes_credentials() {
        let plugin = BasicAuthPlugin::new();
        let auth = AuthSpec {
            auth_type: "basic".to_string(),
            data: json!({"username": "alice", "password": "wonderland"}),
        };
        let request = plugin.apply(sample_request(), &auth, &ProtocolOptions::default()).await.unwrap();
        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Basic YWxpY2U6d29uZGVybGFuZA==".to_string())
        );
    }

    #[test]
    fn validate_rejects_missing_username() {
        let plugin = BasicAuthPlugin::new();
        let auth = AuthSpec {
            auth_type: "basic".to_string(),
            data: json!({"username": "", "password": "x"}),
        };
        assert!(!plugin.validate(&auth, &ProtocolOptions::default()).valid);
    }
}
