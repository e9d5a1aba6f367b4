//! `CollectionValidator` — walks a whole [`Collection`] before it is ever
//! scheduled, aggregating every [`ValidationError`] from script checks,
//! duplicate-id detection, and plugin-delegated auth/protocol checks. See
//! here.

use crate::model::{Collection, EventScript, FolderItem, Item, RequestItem};
use crate::script_kind::ScriptKind;
use crate::validator::{self, EventContext, ValidationContext};
use questrunner_plugin::{
    AuthPlugin, AuthSpec, ProtocolEvent, ProtocolOptions, ProtocolPlugin, ProtocolRequest, ValidationError,
    ValidationSource,
};
use std::collections::{HashMap, HashSet};

/// Plugins consulted while validating a collection. Auth plugins are keyed
/// by their `AuthSpec.type` string.
pub struct CollectionValidator<'a> {
    protocol: &'a dyn ProtocolPlugin,
    auth_plugins: HashMap<String, &'a dyn AuthPlugin>,
    strict_mode: bool,
}

impl<'a> CollectionValidator<'a> {
    /// Build a validator against `protocol`, with `auth_plugins` keyed by
    /// auth type id.
    pub fn new(
        protocol: &'a dyn ProtocolPlugin,
        auth_plugins: HashMap<String, &'a dyn AuthPlugin>,
        strict_mode: bool,
    ) -> Self {
        Self {
            protocol,
            auth_plugins,
            strict_mode,
        }
    }

    /// Validate the whole collection, returning every accumulated error.
    /// An empty result means the collection is runnable.
    pub fn validate(&self, collection: &Collection) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let protocol_events = self.protocol.info().events;

        self.check_duplicate_ids(collection, &mut errors);

        let script_ctx = ValidationContext {
            strict_mode: self.strict_mode,
            event: None,
        };
        push_script_errors(&collection.pre_script, ScriptKind::CollectionPre, &script_ctx, &mut errors);
        push_script_errors(&collection.post_script, ScriptKind::CollectionPost, &script_ctx, &mut errors);
        push_script_errors(&collection.pre_request_script, ScriptKind::RequestPre, &script_ctx, &mut errors);
        push_script_errors(&collection.post_request_script, ScriptKind::RequestPost, &script_ctx, &mut errors);

        if let Some(auth) = &collection.auth {
            self.check_auth(auth, &mut errors);
        }

        for item in &collection.items {
            self.validate_item(item, &protocol_events, &mut errors);
        }

        errors
    }

    fn check_duplicate_ids(&self, collection: &Collection, errors: &mut Vec<ValidationError>) {
        let ids = collection.all_item_ids();
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                errors.push(ValidationError::script(format!("duplicate item id '{id}'"), None));
            }
        }
    }

    fn check_auth(&self, auth: &AuthSpec, errors: &mut Vec<ValidationError>) {
        if auth.is_inherit() || auth.is_none() {
            return;
        }
        match self.auth_plugins.get(&auth.auth_type) {
            None => {
                errors.push(ValidationError::from_plugin(
                    ValidationSource::Auth,
                    format!("unknown auth type '{}'", auth.auth_type),
                ));
            }
            Some(plugin) => {
                let options = ProtocolOptions::default();
                let result = plugin.validate(auth, &options);
                if !result.valid {
                    errors.extend(result.errors);
                }
            }
        }
    }

    fn validate_item(&self, item: &Item, protocol_events: &[ProtocolEvent], errors: &mut Vec<ValidationError>) {
        match item {
            Item::Folder(folder) => self.validate_folder(folder, protocol_events, errors),
            Item::Request(request) => self.validate_request(request, protocol_events, errors),
        }
    }

    fn validate_folder(&self, folder: &FolderItem, protocol_events: &[ProtocolEvent], errors: &mut Vec<ValidationError>) {
        let ctx = ValidationContext {
            strict_mode: self.strict_mode,
            event: None,
        };
        push_script_errors(&folder.pre_script, ScriptKind::FolderPre, &ctx, errors);
        push_script_errors(&folder.post_script, ScriptKind::FolderPost, &ctx, errors);
        push_script_errors(&folder.pre_request_script, ScriptKind::RequestPre, &ctx, errors);
        push_script_errors(&folder.post_request_script, ScriptKind::RequestPost, &ctx, errors);

        if let Some(auth) = &folder.auth {
            self.check_auth(auth, errors);
        }

        for item in &folder.items {
            self.validate_item(item, protocol_events, errors);
        }
    }

    fn validate_request(&self, request: &RequestItem, protocol_events: &[ProtocolEvent], errors: &mut Vec<ValidationError>) {
        let ctx = ValidationContext {
            strict_mode: self.strict_mode,
            event: None,
        };
        push_script_errors(&request.pre_request_script, ScriptKind::RequestPre, &ctx, errors);
        push_script_errors(&request.post_request_script, ScriptKind::RequestPost, &ctx, errors);

        if let Some(auth) = &request.auth {
            self.check_auth(auth, errors);
        }

        self.check_event_scripts(&request.data.scripts, protocol_events, errors);

        let protocol_request = ProtocolRequest {
            id: request.id.clone(),
            name: request.name.clone(),
            method: request.data.method.clone(),
            url: request.data.url.clone(),
            headers: request.data.headers.clone(),
            data: serde_json::to_value(&request.data).unwrap_or_default(),
        };
        let protocol_options = ProtocolOptions::default();
        let result = self.protocol.validate(&protocol_request, &protocol_options);
        if !result.valid {
            errors.extend(result.errors);
        }
    }

    /// Checks 5 and 6: an event-script's event must exist on the protocol
    /// and support tests if it calls `quest.test`/`quest.expectMessages`,
    /// and each event name may only be scripted once per request.
    fn check_event_scripts(&self, scripts: &[EventScript], protocol_events: &[ProtocolEvent], errors: &mut Vec<ValidationError>) {
        let events_by_name: HashMap<&str, &ProtocolEvent> =
            protocol_events.iter().map(|e| (e.name.as_str(), e)).collect();
        let mut seen = HashSet::new();

        for entry in scripts {
            if !seen.insert(entry.event.clone()) {
                errors.push(ValidationError::script(
                    format!("event '{}' has more than one script attached", entry.event),
                    Some(ScriptKind::PluginEvent.as_str()),
                ));
                continue;
            }

            let Some(event) = events_by_name.get(entry.event.as_str()) else {
                errors.push(ValidationError::script(
                    format!("'{}' is not an event this protocol emits", entry.event),
                    Some(ScriptKind::PluginEvent.as_str()),
                ));
                continue;
            };

            let ctx = ValidationContext {
                strict_mode: self.strict_mode,
                event: Some(EventContext {
                    name: &event.name,
                    can_have_tests: event.can_have_tests,
                }),
            };
            errors.extend(validator::validate(&entry.script, ScriptKind::PluginEvent, &ctx));
        }
    }
}

fn push_script_errors(
    script: &Option<String>,
    kind: ScriptKind,
    ctx: &ValidationContext<'_>,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(script) = script {
        errors.extend(validator::validate(script, kind, ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionInfo, RequestData};
    use async_trait::async_trait;
    use questrunner_plugin::{ProtocolInfo, ProtocolResponse, Result as PluginResult, ValidationResult};
    use std::collections::HashMap as StdHashMap;

    struct StubProtocol;

    #[async_trait]
    impl ProtocolPlugin for StubProtocol {
        fn info(&self) -> ProtocolInfo {
            ProtocolInfo {
                protocols: vec!["stub".to_string()],
                name: "stub".to_string(),
                version: "0.0.0".to_string(),
                supported_auth_types: vec![],
                strict_auth_list: false,
                data_schema: serde_json::json!({}),
                options_schema: None,
                events: vec![ProtocolEvent {
                    name: "onComplete".to_string(),
                    can_have_tests: true,
                    required: true,
                    description: String::new(),
                }],
            }
        }

        fn validate(&self, _request: &ProtocolRequest, _options: &ProtocolOptions) -> ValidationResult {
            ValidationResult::ok()
        }

        async fn execute(
            &self,
            _request: &ProtocolRequest,
            _options: &ProtocolOptions,
            _emit_event: Option<questrunner_plugin::EmitEvent<'_>>,
        ) -> PluginResult<ProtocolResponse> {
            unimplemented!("not exercised by validation tests")
        }
    }

    fn collection(items: Vec<Item>) -> Collection {
        Collection {
            info: CollectionInfo {
                id: "c1".to_string(),
                name: "C".to_string(),
            },
            protocol: "stub".to_string(),
            auth: None,
            test_data: None,
            pre_script: None,
            post_script: None,
            pre_request_script: None,
            post_request_script: None,
            variables: StdHashMap::new(),
            items,
        }
    }

    fn request(id: &str) -> RequestItem {
        RequestItem {
            id: id.to_string(),
            name: id.to_string(),
            condition: None,
            auth: None,
            depends_on: vec![],
            pre_request_script: None,
            post_request_script: None,
            data: RequestData {
                url: "https://example.com".to_string(),
                method: "GET".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn flags_duplicate_item_ids() {
        let c = collection(vec![Item::Request(request("dup")), Item::Request(request("dup"))]);
        let protocol = StubProtocol;
        let validator = CollectionValidator::new(&protocol, HashMap::new(), true);
        let errors = validator.validate(&c);
        assert!(errors.iter().any(|e| e.message.contains("duplicate item id")));
    }

    #[test]
    fn flags_test_call_in_request_pre_script() {
        let mut r = request("r1");
        r.pre_request_script = Some(r#"quest.test("a", () => {});"#.to_string());
        let c = collection(vec![Item::Request(r)]);
        let protocol = StubProtocol;
        let validator = CollectionValidator::new(&protocol, HashMap::new(), true);
        let errors = validator.validate(&c);
        assert!(errors.iter().any(|e| e.script_type.as_deref() == Some("request-pre")));
    }

    #[test]
    fn flags_unknown_event_name() {
        let mut r = request("r1");
        r.data.scripts.push(EventScript {
            event: "onBogus".to_string(),
            script: "quest.test('x', () => {});".to_string(),
        });
        let c = collection(vec![Item::Request(r)]);
        let protocol = StubProtocol;
        let validator = CollectionValidator::new(&protocol, HashMap::new(), true);
        let errors = validator.validate(&c);
        assert!(errors.iter().any(|e| e.message.contains("not an event")));
    }

    #[test]
    fn flags_duplicate_event_script() {
        let mut r = request("r1");
        r.data.scripts.push(EventScript {
            event: "onComplete".to_string(),
            script: String::new(),
        });
        r.data.scripts.push(EventScript {
            event: "onComplete".to_string(),
            script: String::new(),
        });
        let c = collection(vec![Item::Request(r)]);
        let protocol = StubProtocol;
        let validator = CollectionValidator::new(&protocol, HashMap::new(), true);
        let errors = validator.validate(&c);
        assert!(errors.iter().any(|e| e.message.contains("more than one script")));
    }

    #[test]
    fn clean_collection_has_no_errors() {
        let c = collection(vec![Item::Request(request("r1"))]);
        let protocol = StubProtocol;
        let validator = CollectionValidator::new(&protocol, HashMap::new(), true);
        assert!(validator.validate(&c).is_empty());
    }
}
