//! # Quest Runner Plugin Interfaces
//!
//! Core traits that keep the collection execution engine
//! (`questrunner-core`) independent of concrete transports, auth schemes,
//! and value sources: [`protocol::ProtocolPlugin`], [`auth::AuthPlugin`],
//! and [`value_provider::ValueProvider`].

pub mod auth;
pub mod error;
pub mod protocol;
pub mod validation;
pub mod value_provider;

pub use auth::{AuthInfo, AuthPlugin, AuthSpec};
pub use error::{PluginError, Result};
pub use protocol::{
    adapt_legacy, EmitEvent, LegacyProtocolResponse, ProtocolEvent, ProtocolInfo, ProtocolOptions,
    ProtocolPlugin, ProtocolRequest, ProtocolResponse, ProtocolResponseSummary,
};
pub use validation::{
    SourceLocation, ValidationDetails, ValidationError, ValidationResult, ValidationSource,
};
pub use value_provider::{ProviderContext, ValueProvider};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_spec_sentinels() {
        assert!(AuthSpec::inherit().is_inherit());
        assert!(AuthSpec::none().is_none());
        assert!(!AuthSpec::inherit().is_none());
    }

    #[test]
    fn adapt_legacy_maps_success() {
        let legacy = LegacyProtocolResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: Default::default(),
            body: json!({"ok": true}),
            duration_ms: 12,
            error: None,
        };
        let structured = adapt_legacy(legacy);
        assert_eq!(structured.summary.outcome, "ok");
        assert_eq!(structured.summary.code, "200");
    }

    #[test]
    fn adapt_legacy_maps_failure() {
        let legacy = LegacyProtocolResponse {
            status: 0,
            status_text: String::new(),
            headers: Default::default(),
            body: json!(null),
            duration_ms: 5,
            error: Some("connection refused".to_string()),
        };
        let structured = adapt_legacy(legacy);
        assert_eq!(structured.summary.outcome, "error");
        assert_eq!(structured.summary.message.as_deref(), Some("connection refused"));
    }
}
