//! The variable scope stack — one [`ScopeFrame`] per live collection/folder/
//! request lifecycle span (`ScopeStackFrame`).

use serde_json::Value;
use std::collections::HashMap;

/// The lexical-ish level a [`ScopeFrame`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLevel {
    /// The single collection-wide frame, pushed before `collection-pre`.
    Collection,
    /// One frame per live folder instance.
    Folder,
    /// One frame per live request instance.
    Request,
}

/// A single frame on the [`ScopeStack`].
#[derive(Debug, Clone)]
pub struct ScopeFrame {
    /// Which lifecycle level pushed this frame.
    pub level: ScopeLevel,
    /// The owning item's id (collection id for the collection frame).
    pub id: String,
    /// Frame-local variables, writable by `quest.scope.variables` on the
    /// top frame only.
    pub vars: HashMap<String, Value>,
}

impl ScopeFrame {
    /// Build a new, empty frame.
    pub fn new(level: ScopeLevel, id: impl Into<String>) -> Self {
        Self {
            level,
            id: id.into(),
            vars: HashMap::new(),
        }
    }
}

/// The scheduler-owned stack of live scope frames. Scripts may only read the
/// whole stack and write the top frame's `vars`; pushes/pops happen only at
/// scheduler-controlled lifecycle transitions (folder-enter/exit, request
/// start/completion).
#[derive(Debug, Clone, Default)]
pub struct ScopeStack {
    frames: Vec<ScopeFrame>,
}

impl ScopeStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Push a new frame onto the stack.
    pub fn push(&mut self, frame: ScopeFrame) {
        self.frames.push(frame);
    }

    /// Pop the top frame. Returns `None` if the stack was already empty
    /// (a scheduler bug, since every push has a matching pop).
    pub fn pop(&mut self) -> Option<ScopeFrame> {
        self.frames.pop()
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// All frames, outermost first (bottom of the stack).
    pub fn frames(&self) -> &[ScopeFrame] {
        &self.frames
    }

    /// Read-only access to the top frame, if any.
    pub fn top(&self) -> Option<&ScopeFrame> {
        self.frames.last()
    }

    /// Mutable access to the top frame, if any — the only frame scripts are
    /// allowed to write.
    pub fn top_mut(&mut self) -> Option<&mut ScopeFrame> {
        self.frames.last_mut()
    }

    /// Look up `key` by scanning frames top-to-bottom (innermost first),
    /// per the `quest.variables` cascade.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.vars.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_scans_innermost_first() {
        let mut stack = ScopeStack::new();
        let mut collection = ScopeFrame::new(ScopeLevel::Collection, "c1");
        collection.vars.insert("x".to_string(), json!("outer"));
        stack.push(collection);

        let mut folder = ScopeFrame::new(ScopeLevel::Folder, "f1");
        folder.vars.insert("x".to_string(), json!("inner"));
        stack.push(folder);

        assert_eq!(stack.get("x"), Some(&json!("inner")));
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn pop_restores_prior_depth() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeFrame::new(ScopeLevel::Collection, "c1"));
        stack.push(ScopeFrame::new(ScopeLevel::Request, "r1"));
        assert_eq!(stack.depth(), 2);
        stack.pop();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().unwrap().id, "c1");
    }
}
