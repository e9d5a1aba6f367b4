//! Wires the concrete plugin implementations this workspace ships
//! (`questrunner-http`, `questrunner-auth`) to the collection's declared
//! protocol and the auth types its items reference.

use anyhow::{bail, Result};
use questrunner_auth::{BasicAuthPlugin, BearerAuthPlugin, OAuth2AuthPlugin};
use questrunner_http::HttpPlugin;
use questrunner_plugin::{AuthPlugin, ProtocolPlugin};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves `protocol` to a concrete [`ProtocolPlugin`]. Only `http`/`https`
/// ship with this workspace; other protocol ids (GraphQL, SSE, WebSocket,
/// gRPC) remain external collaborators.
pub fn resolve_protocol(protocol: &str) -> Result<Arc<dyn ProtocolPlugin>> {
    match protocol {
        "http" | "https" => Ok(Arc::new(HttpPlugin::new())),
        other => bail!("no ProtocolPlugin registered for protocol '{other}'"),
    }
}

/// Every [`AuthPlugin`] this workspace ships, keyed by auth type id.
pub fn all_auth_plugins() -> HashMap<String, Arc<dyn AuthPlugin>> {
    let mut plugins: HashMap<String, Arc<dyn AuthPlugin>> = HashMap::new();
    plugins.insert("bearer".to_string(), Arc::new(BearerAuthPlugin::new()));
    plugins.insert("basic".to_string(), Arc::new(BasicAuthPlugin::new()));
    plugins.insert("oauth2".to_string(), Arc::new(OAuth2AuthPlugin::new()));
    plugins
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_http_and_https() {
        assert!(resolve_protocol("http").is_ok());
        assert!(resolve_protocol("https").is_ok());
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(resolve_protocol("graphql").is_err());
    }

    #[test]
    fn ships_all_three_auth_plugins() {
        let plugins = all_auth_plugins();
        assert!(plugins.contains_key("bearer"));
        assert!(plugins.contains_key("basic"));
        assert!(plugins.contains_key("oauth2"));
    }
}
