//! `ScriptKind` — the full script-type taxonomy used by the validator, the
//! script engine, and `TestResult`/`ValidationError` tagging. A superset of
//! `graph::ScriptType`, which only names the four script types materialized
//! as standalone DAG nodes.

use std::fmt;

/// Every slot a user script can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// `collection-pre`.
    CollectionPre,
    /// `collection-post`.
    CollectionPost,
    /// `folder-pre`.
    FolderPre,
    /// `folder-post`.
    FolderPost,
    /// `request-pre` (the request's own `preRequestScript`, or an inherited
    /// `preRequestScript` from an ancestor).
    RequestPre,
    /// `request-post` (the request's own `postRequestScript`, or an
    /// inherited `postRequestScript` from an ancestor).
    RequestPost,
    /// A protocol-emitted event script (`onMessage`, `onComplete`, …).
    PluginEvent,
}

impl ScriptKind {
    /// The string form used in `TestResult::script_type` and
    /// `ValidationError::script_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::CollectionPre => "collection-pre",
            ScriptKind::CollectionPost => "collection-post",
            ScriptKind::FolderPre => "folder-pre",
            ScriptKind::FolderPost => "folder-post",
            ScriptKind::RequestPre => "request-pre",
            ScriptKind::RequestPost => "request-post",
            ScriptKind::PluginEvent => "plugin-event",
        }
    }

    /// Whether `quest.test(...)` is statically allowed in this slot,
    /// independent of a protocol event's `canHaveTests` flag (checked
    /// separately for [`ScriptKind::PluginEvent`]).
    pub fn allows_test_by_default(self) -> bool {
        matches!(self, ScriptKind::RequestPost)
    }

    /// Whether `quest.expectMessages(...)` is statically allowed here.
    pub fn allows_expect_messages(self) -> bool {
        matches!(self, ScriptKind::RequestPre)
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
