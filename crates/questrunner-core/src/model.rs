//! The collection data model: Collection, Folder, Request, Auth, and the
//! per-request event-script attachments.

use questrunner_plugin::AuthSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Top-level metadata for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

/// A single `{event, script}` attachment on a request's `data.scripts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventScript {
    /// Event name this script runs for (plugin-defined, e.g. `"onMessage"`).
    pub event: String,
    /// Script source.
    pub script: String,
}

/// Protocol-specific request payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestData {
    /// Target URL, possibly containing `{{placeholders}}`.
    pub url: String,
    /// HTTP-ish method; meaningless for some protocols.
    #[serde(default)]
    pub method: String,
    /// Request headers, possibly containing placeholders.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body, protocol-defined shape.
    #[serde(default)]
    pub body: Value,
    /// Per-event scripts (`plugin-event` script type).
    #[serde(default)]
    pub scripts: Vec<EventScript>,
    /// Any other protocol-specific fields (GraphQL document, gRPC method, …).
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// A leaf request item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestItem {
    /// Unique id within the collection.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Skip condition, evaluated as a boolean-ish expression string.
    #[serde(default)]
    pub condition: Option<String>,
    /// Auth override; absent means `{type: "inherit"}`.
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    /// Item ids that must complete before this request may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Script run before the request (`request-pre`).
    #[serde(default)]
    pub pre_request_script: Option<String>,
    /// Script run after the request (`request-post`).
    #[serde(default)]
    pub post_request_script: Option<String>,
    /// The request payload and per-event scripts.
    pub data: RequestData,
}

/// A grouping item containing further items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderItem {
    /// Unique id within the collection.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Skip condition, evaluated as a boolean-ish expression string.
    #[serde(default)]
    pub condition: Option<String>,
    /// Auth override; absent means `{type: "inherit"}`.
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    /// Item ids that must complete before this folder may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Folder-level pre script (`folder-pre`).
    #[serde(default)]
    pub pre_script: Option<String>,
    /// Folder-level post script (`folder-post`).
    #[serde(default)]
    pub post_script: Option<String>,
    /// Inherited pre-request script, appended to descendants' chains.
    #[serde(default)]
    pub pre_request_script: Option<String>,
    /// Inherited post-request script, prepended to descendants' chains.
    #[serde(default)]
    pub post_request_script: Option<String>,
    /// Child items, in declaration order.
    pub items: Vec<Item>,
}

/// A collection tree item: either a folder or a leaf request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Item {
    /// A grouping folder.
    Folder(FolderItem),
    /// A leaf request.
    Request(RequestItem),
}

impl Item {
    /// The item's id, regardless of kind.
    pub fn id(&self) -> &str {
        match self {
            Item::Folder(f) => &f.id,
            Item::Request(r) => &r.id,
        }
    }

    /// The item's human-readable name.
    pub fn name(&self) -> &str {
        match self {
            Item::Folder(f) => &f.name,
            Item::Request(r) => &r.name,
        }
    }
}

/// Root input to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Collection metadata.
    pub info: CollectionInfo,
    /// Protocol id used by requests that don't override it.
    pub protocol: String,
    /// Collection-level auth; absent means `{type: "none"}`.
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    /// Default iteration data, one row per iteration, unless overridden by
    /// `RuntimeOptions.data`.
    #[serde(default)]
    pub test_data: Option<Vec<Value>>,
    /// Collection-pre script (always a graph boundary, even if blank).
    #[serde(default)]
    pub pre_script: Option<String>,
    /// Collection-post script (always a graph boundary, even if blank).
    #[serde(default)]
    pub post_script: Option<String>,
    /// Inherited pre-request script, appended to every request's chain.
    #[serde(default)]
    pub pre_request_script: Option<String>,
    /// Inherited post-request script, prepended to every request's chain.
    #[serde(default)]
    pub post_request_script: Option<String>,
    /// Initial collection-scope variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Top-level items, in declaration order.
    pub items: Vec<Item>,
}

impl Collection {
    /// Collect every item id in the tree, depth-first.
    pub fn all_item_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for item in &self.items {
            collect_ids(item, &mut ids);
        }
        ids
    }
}

fn collect_ids(item: &Item, out: &mut Vec<String>) {
    out.push(item.id().to_string());
    if let Item::Folder(folder) = item {
        for child in &folder.items {
            collect_ids(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_request(id: &str) -> Item {
        Item::Request(RequestItem {
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
        })
    }

    #[test]
    fn all_item_ids_is_depth_first() {
        let collection = Collection {
            info: CollectionInfo {
                id: "c1".to_string(),
                name: "Collection".to_string(),
            },
            protocol: "http".to_string(),
            auth: None,
            test_data: None,
            pre_script: None,
            post_script: None,
            pre_request_script: None,
            post_request_script: None,
            variables: HashMap::new(),
            items: vec![
                Item::Folder(FolderItem {
                    id: "f1".to_string(),
                    name: "Folder".to_string(),
                    condition: None,
                    auth: None,
                    depends_on: vec![],
                    pre_script: None,
                    post_script: None,
                    pre_request_script: None,
                    post_request_script: None,
                    items: vec![leaf_request("r1")],
                }),
                leaf_request("r2"),
            ],
        };

        assert_eq!(collection.all_item_ids(), vec!["f1", "r1", "r2"]);
    }

    #[test]
    fn collection_round_trips_through_yaml() {
        let yaml = r#"
info:
  id: c1
  name: My Collection
protocol: http
variables:
  baseUrl: "https://api.example.com"
items:
  - type: request
    id: r1
    name: Get Users
    data:
      url: "{{baseUrl}}/users"
      method: GET
"#;
        let collection: Collection = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(collection.info.id, "c1");
        assert_eq!(collection.items.len(), 1);
        assert_eq!(collection.items[0].id(), "r1");
    }
}
