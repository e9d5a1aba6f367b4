//! `VariableResolver` — `{{name}}` placeholder interpolation over the
//! priority cascade.

use crate::context::ExecutionContext;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("valid regex"));

/// Look up `name` against the cascade: iteration row, scope frames
/// (top-to-bottom), collection variables, environment variables, global
/// variables. Returns `None` if no source has it.
pub fn resolve_name(ctx: &ExecutionContext, name: &str) -> Option<Value> {
    if let Some(row) = ctx.current_iteration_row() {
        if let Some(v) = row.get(name) {
            return Some(v.clone());
        }
    }
    if let Some(v) = ctx.scope_stack.get(name) {
        return Some(v.clone());
    }
    if let Some(v) = ctx.collection_variables.get(name) {
        return Some(v.clone());
    }
    if let Some(v) = ctx.environment.vars.get(name) {
        return Some(v.clone());
    }
    if let Some(v) = ctx.global_variables.get(name) {
        return Some(v.clone());
    }
    None
}

/// A `Value` rendered as the string a template substitution should splice
/// in: strings are inserted literally, everything else falls back to its
/// JSON text.
fn value_to_template_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interpolate every `{{name}}` occurrence in `input` against the cascade.
/// Unresolved placeholders are left literally in the output.
pub fn resolve_str(ctx: &ExecutionContext, input: &str) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            match resolve_name(ctx, name) {
                Some(value) => value_to_template_string(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Recursively resolve every string found in a JSON value, preserving its
/// shape (objects/arrays are walked, other scalars passed through
/// unchanged). Non-string leaves are never converted to strings.
pub fn resolve_value(ctx: &ExecutionContext, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(ctx, s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(ctx, v)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), resolve_value(ctx, v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EnvironmentSpec, ExecutionContextBuilder};
    use serde_json::json;

    fn ctx_with_global(key: &str, value: Value) -> ExecutionContext {
        let mut ctx = ExecutionContextBuilder::new("c1", "http").build();
        ctx.global_variables.insert(key.to_string(), value);
        ctx
    }

    #[test]
    fn resolves_present_placeholder() {
        let ctx = ctx_with_global("x", json!("v"));
        assert_eq!(resolve_str(&ctx, "{{x}}"), "v");
    }

    #[test]
    fn leaves_unresolved_placeholder_literal() {
        let ctx = ctx_with_global("x", json!("v"));
        assert_eq!(resolve_str(&ctx, "{{missing}}"), "{{missing}}");
    }

    #[test]
    fn non_string_input_types_pass_through_shape() {
        let ctx = ctx_with_global("x", json!("v"));
        let input = json!({"a": "{{x}}", "b": [1, "{{x}}"], "c": 5});
        let resolved = resolve_value(&ctx, &input);
        assert_eq!(resolved, json!({"a": "v", "b": [1, "v"], "c": 5}));
    }

    #[test]
    fn cascade_prefers_scope_over_collection() {
        let mut ctx = ctx_with_global("x", json!("global"));
        ctx.collection_variables.insert("x".to_string(), json!("collection"));
        ctx.scope_stack.push(crate::scope::ScopeFrame::new(
            crate::scope::ScopeLevel::Collection,
            "c1",
        ));
        ctx.scope_stack
            .top_mut()
            .unwrap()
            .vars
            .insert("x".to_string(), json!("scope"));
        assert_eq!(resolve_str(&ctx, "{{x}}"), "scope");
        let _ = EnvironmentSpec::default();
    }
}
