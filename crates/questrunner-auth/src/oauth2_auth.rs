//! OAuth2 client-credentials `AuthPlugin`.
//!
//! Fetches (and caches until near expiry) an access token via the
//! `oauth2` crate's client-credentials grant, then injects it as a bearer
//! token header, matching `AuthPlugin::apply()`'s contract.

use crate::error::AuthError;
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use parking_lot::Mutex;
use questrunner_plugin::{
    AuthInfo, AuthPlugin, AuthSpec, ProtocolOptions, ProtocolRequest, Result, ValidationError,
    ValidationResult, ValidationSource,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
struct OAuth2Data {
    client_id: String,
    client_secret: String,
    token_url: String,
    #[serde(default)]
    scope: Option<String>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// OAuth2 client-credentials grant. Caches the most recently fetched token
/// per `(client_id, token_url)` pair and re-fetches once it is within 30
/// seconds of its reported expiry.
#[derive(Default)]
pub struct OAuth2AuthPlugin {
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl std::fmt::Debug for OAuth2AuthPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2AuthPlugin").finish()
    }
}

impl OAuth2AuthPlugin {
    /// A new OAuth2 auth plugin instance with an empty token cache.
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_token(&self, data: &OAuth2Data) -> Result<String> {
        let cache_key = format!("{}|{}", data.client_id, data.token_url);
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let token_url = TokenUrl::new(data.token_url.clone())
            .map_err(|e| AuthError::InvalidData(format!("invalid token_url: {e}")))?;
        let auth_url = AuthUrl::new(data.token_url.clone())
            .map_err(|e| AuthError::InvalidData(format!("invalid token_url: {e}")))?;
        let client = BasicClient::new(
            ClientId::new(data.client_id.clone()),
            Some(ClientSecret::new(data.client_secret.clone())),
            auth_url,
            Some(token_url),
        );

        let mut request = client.exchange_client_credentials();
        if let Some(scope) = &data.scope {
            for s in scope.split_whitespace() {
                request = request.add_scope(Scope::new(s.to_string()));
            }
        }

        let token = request
            .request_async(async_http_client)
            .await
            .map_err(|e| AuthError::TokenRequest(e.to_string()))?;

        let access_token = token.access_token().secret().clone();
        let ttl = token
            .expires_in()
            .unwrap_or(Duration::from_secs(3600))
            .saturating_sub(Duration::from_secs(30));
        self.cache.lock().insert(
            cache_key,
            CachedToken {
                access_token: access_token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(access_token)
    }
}

#[async_trait]
impl AuthPlugin for OAuth2AuthPlugin {
    fn info(&self) -> AuthInfo {
        AuthInfo {
            auth_types: vec!["oauth2".to_string()],
            protocols: vec!["http".to_string(), "https".to_string()],
            data_schema: serde_json::json!({
                "type": "object",
                "required": ["client_id", "client_secret", "token_url"],
                "properties": {
                    "client_id": { "type": "string", "minLength": 1 },
                    "client_secret": { "type": "string", "minLength": 1 },
                    "token_url": { "type": "string", "minLength": 1 },
                    "scope": { "type": "string" }
                }
            }),
            name: "questrunner-auth-oauth2".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn validate(&self, auth: &AuthSpec, _options: &ProtocolOptions) -> ValidationResult {
        match serde_json::from_value::<OAuth2Data>(auth.data.clone()) {
            Ok(data) if !data.client_id.is_empty() && !data.token_url.is_empty() => {
                ValidationResult::ok()
            }
            Ok(_) => ValidationResult::failed(vec![ValidationError::from_plugin(
                ValidationSource::Auth,
                "oauth2 auth requires non-empty 'client_id' and 'token_url'",
            )]),
            Err(e) => ValidationResult::failed(vec![ValidationError::from_plugin(
                ValidationSource::Auth,
                format!("invalid oauth2 auth data: {e}"),
            )]),
        }
    }

    async fn apply(
        &self,
        mut request: ProtocolRequest,
        auth: &AuthSpec,
        _options: &ProtocolOptions,
    ) -> Result<ProtocolRequest> {
        let data: OAuth2Data = serde_json::from_value(auth.data.clone())
            .map_err(|e| AuthError::InvalidData(e.to_string()))?;
        let access_token = self.fetch_token(&data).await?;
        request.headers.insert("Authorization".to_string(), format!("Bearer {access_token}"));
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_missing_token_url() {
        let plugin = OAuth2AuthPlugin::new();
        let auth = AuthSpec {
            auth_type: "oauth2".to_string(),
            data: json!({"client_id": "id", "client_secret": "secret", "token_url": ""}),
        };
        assert!(!plugin.validate(&auth, &ProtocolOptions::default()).valid);
    }

    #[test]
    fn validate_accepts_well_formed_data() {
        let plugin = OAuth2AuthPlugin::new();
        let auth = AuthSpec {
            auth_type: "oauth2".to_string(),
            data: json!({
                "client_id": "id",
                "client_secret": "secret",
                "token_url": "https://auth.example.com/token",
            }),
        };
        assert!(plugin.validate(&auth, &ProtocolOptions::default()).valid);
    }
}
