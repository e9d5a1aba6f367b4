//! # HTTP `ProtocolPlugin`
//!
//! Concrete `http`/`https` transport for the Quest Runner collection
//! execution engine, implemented with `reqwest`. Exercises the
//! `ProtocolPlugin` trait end-to-end the way `mockforge-core`'s
//! `ChainExecutionEngine::execute_request` exercises a templated HTTP call,
//! generalized here into the structured `{data, summary}` response shape.

mod body;
mod error;
mod proxy;

pub use error::HttpError;

use async_trait::async_trait;
use body::EncodedBody;
use jsonschema::{Draft, Validator as JsonSchemaValidator};
use once_cell::sync::Lazy;
use questrunner_plugin::{
    EmitEvent, ProtocolEvent, ProtocolInfo, ProtocolOptions, ProtocolPlugin, ProtocolRequest,
    ProtocolResponse, ProtocolResponseSummary, Result, ValidationError, ValidationResult,
    ValidationSource,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// The JSON Schema describing `ProtocolRequest.data`'s recognized shape,
/// advertised through `ProtocolInfo::data_schema` and enforced in `validate`.
static REQUEST_DATA_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "body": {
                "type": ["object", "null"],
                "properties": {
                    "mode": {
                        "enum": ["raw", "urlencoded", "formdata", "binary"]
                    }
                }
            }
        }
    })
});

static REQUEST_DATA_VALIDATOR: Lazy<JsonSchemaValidator> = Lazy::new(|| {
    jsonschema::options()
        .with_draft(Draft::Draft7)
        .build(&REQUEST_DATA_SCHEMA)
        .expect("REQUEST_DATA_SCHEMA is a valid Draft7 schema")
});

/// The HTTP/HTTPS `ProtocolPlugin`.
#[derive(Debug, Default)]
pub struct HttpPlugin;

impl HttpPlugin {
    /// A new HTTP plugin instance. Stateless; a fresh `reqwest::Client` is
    /// built per `execute` call so each run's TLS/proxy options apply
    /// independently.
    pub fn new() -> Self {
        Self
    }

    fn build_client(&self, request_url: &str, options: &ProtocolOptions) -> reqwest::Result<Client> {
        let timeout_ms = options.request_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let mut builder = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .danger_accept_invalid_certs(!options.validate_certificates);

        builder = if options.follow_redirects {
            let max = if options.max_redirects == 0 { 10 } else { options.max_redirects as usize };
            builder.redirect(reqwest::redirect::Policy::limited(max))
        } else {
            builder.redirect(reqwest::redirect::Policy::none())
        };

        if let Some(proxy_url) = proxy::resolve_proxy_for(request_url, options.proxy.as_deref()) {
            if let Ok(proxy) = reqwest::Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        builder.build()
    }
}

#[async_trait]
impl ProtocolPlugin for HttpPlugin {
    fn info(&self) -> ProtocolInfo {
        ProtocolInfo {
            protocols: vec!["http".to_string(), "https".to_string()],
            name: "questrunner-http".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_auth_types: vec![
                "bearer".to_string(),
                "basic".to_string(),
                "oauth2".to_string(),
            ],
            strict_auth_list: false,
            data_schema: REQUEST_DATA_SCHEMA.clone(),
            options_schema: None,
            // HTTP request/response is a single round trip; it fires no
            // plugin events (unlike the streaming transports this system
            // also defines interfaces for).
            events: Vec::<ProtocolEvent>::new(),
        }
    }

    fn validate(&self, request: &ProtocolRequest, _options: &ProtocolOptions) -> ValidationResult {
        let mut errors = Vec::new();
        for error in REQUEST_DATA_VALIDATOR.iter_errors(&request.data) {
            errors.push(ValidationError::from_plugin(
                ValidationSource::Schema,
                error.to_string(),
            ));
        }
        if request.url.trim().is_empty() {
            errors.push(ValidationError::from_plugin(
                questrunner_plugin::ValidationSource::Protocol,
                "HTTP request is missing a url",
            ));
        }
        if Method::from_bytes(request.method.as_bytes()).is_err() {
            errors.push(ValidationError::from_plugin(
                questrunner_plugin::ValidationSource::Protocol,
                format!("invalid HTTP method '{}'", request.method),
            ));
        }
        for name in request.headers.keys() {
            if HeaderName::from_str(name).is_err() {
                errors.push(ValidationError::from_plugin(
                    questrunner_plugin::ValidationSource::Protocol,
                    format!("invalid header name '{name}'"),
                ));
            }
        }
        if let Some(body) = request.data.get("body") {
            if let Err(e) = body::encode_body(body) {
                errors.push(ValidationError::from_plugin(
                    questrunner_plugin::ValidationSource::Protocol,
                    e.to_string(),
                ));
            }
        }
        ValidationResult::failed(errors)
    }

    async fn execute(
        &self,
        request: &ProtocolRequest,
        options: &ProtocolOptions,
        _emit_event: Option<EmitEvent<'_>>,
    ) -> Result<ProtocolResponse> {
        let start = std::time::Instant::now();
        let client = self
            .build_client(&request.url, options)
            .map_err(|e| questrunner_plugin::PluginError::from(HttpError::from(e)))?;

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| HttpError::Malformed(format!("invalid method '{}': {e}", request.method)))?;

        let mut header_map = HeaderMap::new();
        for (key, value) in &request.headers {
            let name = HeaderName::from_str(key)
                .map_err(|e| HttpError::Malformed(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::Malformed(format!("invalid header value for '{key}': {e}")))?;
            header_map.insert(name, value);
        }

        let mut builder = client.request(method, &request.url).headers(header_map);

        let body = request.data.get("body").cloned().unwrap_or(Value::Null);
        match body::encode_body(&body)? {
            EncodedBody::None => {}
            EncodedBody::Bytes(bytes, content_type) => {
                builder = builder.body(bytes);
                if let Some(content_type) = content_type {
                    builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
                }
            }
            EncodedBody::Multipart(form) => {
                builder = builder.multipart(form);
            }
        }

        let sent_at = std::time::Instant::now();
        let result = builder.send().await;
        let duration_ms = sent_at.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                return Ok(ProtocolResponse {
                    data: json!({
                        "status": 0,
                        "statusText": "",
                        "headers": {},
                        "body": Value::Null,
                    }),
                    summary: ProtocolResponseSummary {
                        outcome: if err.is_timeout() { "timeout" } else { "error" }.to_string(),
                        code: "0".to_string(),
                        label: "transport error".to_string(),
                        message: Some(err.to_string()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    },
                });
            }
        };

        let status = response.status();
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_str().unwrap_or("").to_string());
        }

        let body_bytes = response.bytes().await.map_err(HttpError::from)?;
        let body_json: Value = serde_json::from_slice(&body_bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body_bytes).to_string()));

        let outcome = if status.as_u16() < 400 { "ok" } else { "error" };
        Ok(ProtocolResponse {
            data: json!({
                "status": status.as_u16(),
                "statusText": status.canonical_reason().unwrap_or("").to_string(),
                "headers": headers,
                "body": body_json,
            }),
            summary: ProtocolResponseSummary {
                outcome: outcome.to_string(),
                code: status.as_u16().to_string(),
                label: format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("")),
                message: if outcome == "error" {
                    Some(format!("HTTP {}", status.as_u16()))
                } else {
                    None
                },
                duration_ms,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questrunner_plugin::ProtocolRequest;

    fn sample_request(url: &str, method: &str) -> ProtocolRequest {
        ProtocolRequest {
            id: "r1".to_string(),
            name: "Sample".to_string(),
            method: method.to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            data: json!({}),
        }
    }

    #[test]
    fn validate_rejects_missing_url() {
        let plugin = HttpPlugin::new();
        let request = sample_request("", "GET");
        let result = plugin.validate(&request, &ProtocolOptions::default());
        assert!(!result.valid);
    }

    #[test]
    fn validate_rejects_invalid_method() {
        let plugin = HttpPlugin::new();
        let request = sample_request("https://example.com", "NOTAMETHOD!!");
        let result = plugin.validate(&request, &ProtocolOptions::default());
        assert!(!result.valid);
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let plugin = HttpPlugin::new();
        let request = sample_request("https://example.com", "GET");
        let result = plugin.validate(&request, &ProtocolOptions::default());
        assert!(result.valid);
    }

    #[test]
    fn info_declares_no_events() {
        let plugin = HttpPlugin::new();
        assert!(plugin.info().events.is_empty());
        assert_eq!(plugin.info().protocols, vec!["http", "https"]);
    }
}
