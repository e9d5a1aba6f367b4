//! The `ProtocolPlugin` interface — transports (HTTP, GraphQL, SSE, …) are
//! external collaborators accessed only through this trait.

use crate::error::Result;
use crate::validation::ValidationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Describes one named event a protocol can emit during `execute` (e.g.
/// `onMessage`, `onComplete` for a streaming transport).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// The event name scripts attach to via `data.scripts[].event`.
    pub name: String,
    /// Whether `quest.test(...)` may be called from this event's script.
    pub can_have_tests: bool,
    /// Whether a well-formed request for this protocol must eventually fire
    /// this event at least once.
    pub required: bool,
    /// Human-readable description, surfaced by tooling.
    pub description: String,
}

/// Static description of a `ProtocolPlugin`'s capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Protocol identifiers this plugin handles (`"http"`, `"https"`, …).
    pub protocols: Vec<String>,
    /// Plugin name, for diagnostics.
    pub name: String,
    /// Plugin version string.
    pub version: String,
    /// Auth plugin ids this protocol accepts.
    pub supported_auth_types: Vec<String>,
    /// If true, an auth type outside `supported_auth_types` is a hard error
    /// rather than a best-effort pass-through.
    pub strict_auth_list: bool,
    /// JSON Schema describing the shape `validate`/`execute` expect
    /// `ProtocolRequest.data` to have.
    pub data_schema: Value,
    /// JSON Schema for this protocol's `plugin_config` entry in
    /// `ProtocolOptions`, when it accepts one.
    pub options_schema: Option<Value>,
    /// Events this protocol may emit during `execute`.
    pub events: Vec<ProtocolEvent>,
}

/// A request as handed to a `ProtocolPlugin::execute` call. This is the
/// boundary type between the collection's richer `Request` item and the
/// transport; `questrunner-core` builds one of these per request node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRequest {
    /// Item id, echoed back in responses/history.
    pub id: String,
    /// Human-readable item name.
    pub name: String,
    /// HTTP-ish method, meaningless for non-request-reply protocols.
    pub method: String,
    /// Target URL/endpoint, pre-interpolation-resolved by the scheduler.
    pub url: String,
    /// Request headers, already variable-resolved.
    pub headers: HashMap<String, String>,
    /// Raw protocol-specific request payload (body, query, GraphQL document, …).
    pub data: Value,
}

/// The structured `ProtocolResponse` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolResponseSummary {
    /// High-level outcome classification (`"ok"`, `"error"`, `"timeout"`, …).
    pub outcome: String,
    /// Protocol-specific status code (HTTP status, gRPC code, …) as a string
    /// so non-numeric codes are representable.
    pub code: String,
    /// Short human label for the outcome (`"200 OK"`).
    pub label: String,
    /// Optional longer message, typically set on failure.
    pub message: Option<String>,
    /// Wall-clock duration of the call, in milliseconds.
    pub duration_ms: u64,
}

/// Protocol-specific response payload plus its outcome summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolResponse {
    /// Raw protocol-specific data (headers, body, trailers, …).
    pub data: Value,
    /// Uniform summary every protocol can produce.
    pub summary: ProtocolResponseSummary,
}

/// The legacy flat response shape some plugins may still return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyProtocolResponse {
    /// Numeric status code, `0` on transport failure.
    pub status: u16,
    /// Status line text.
    pub status_text: String,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, as raw JSON.
    pub body: Value,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Transport-level error message, if any.
    pub error: Option<String>,
}

/// Adapts a legacy flat response into the structured shape, so the
/// scheduler only ever has to handle [`ProtocolResponse`].
pub fn adapt_legacy(legacy: LegacyProtocolResponse) -> ProtocolResponse {
    let outcome = if legacy.error.is_some() {
        "error"
    } else if legacy.status == 0 {
        "error"
    } else if legacy.status < 400 {
        "ok"
    } else {
        "error"
    };
    ProtocolResponse {
        data: serde_json::json!({
            "status": legacy.status,
            "statusText": legacy.status_text,
            "headers": legacy.headers,
            "body": legacy.body,
        }),
        summary: ProtocolResponseSummary {
            outcome: outcome.to_string(),
            code: legacy.status.to_string(),
            label: format!("{} {}", legacy.status, legacy.status_text),
            message: legacy.error,
            duration_ms: legacy.duration_ms,
        },
    }
}

/// Callback a `ProtocolPlugin` invokes synchronously for each event it
/// fires during `execute`. It blocks until the scheduler has run the
/// matching user script (if any) through the script mutex, preserving its
/// serialization invariant.
pub type EmitEvent<'a> = Arc<
    dyn Fn(
            &str,
            Value,
        ) -> futures::future::BoxFuture<'static, Result<()>>
        + Send
        + Sync
        + 'a,
>;

/// Options forwarded from `RuntimeOptions` that are relevant to transports:
/// timeouts, TLS, proxying, redirects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolOptions {
    /// Per-request timeout, in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Whether to validate TLS certificates.
    pub validate_certificates: bool,
    /// Whether to follow redirects automatically.
    pub follow_redirects: bool,
    /// Maximum redirects to follow.
    pub max_redirects: u32,
    /// Explicit proxy URL, overriding environment detection.
    pub proxy: Option<String>,
    /// Arbitrary plugin-specific configuration, keyed by plugin id.
    pub plugin_config: HashMap<String, Value>,
}

/// Transports (HTTP, GraphQL, SSE, WebSocket, gRPC, …) implement this trait;
/// the engine never depends on a concrete transport.
#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    /// Static capability description.
    fn info(&self) -> ProtocolInfo;

    /// Statically validate a request's `data` against this protocol's
    /// schema, without performing any I/O.
    fn validate(&self, request: &ProtocolRequest, options: &ProtocolOptions) -> ValidationResult;

    /// Execute one request. `emit_event` is called synchronously for every
    /// protocol event fired; implementations must await its future before
    /// proceeding, so scheduler-side script execution for that event
    /// completes before the next event (or the final response) is produced.
    async fn execute(
        &self,
        request: &ProtocolRequest,
        options: &ProtocolOptions,
        emit_event: Option<EmitEvent<'_>>,
    ) -> Result<ProtocolResponse>;
}
