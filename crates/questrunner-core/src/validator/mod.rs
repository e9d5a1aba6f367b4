//! `ScriptValidator` — AST-level static checks on user scripts (unknown
//! `quest.*` members, calls to `quest.test` outside a `test` event, bare
//! `throw` without a message). Parses with `boa_parser`/`boa_ast` rather
//! than a hand-rolled parser.

mod ast;

pub use ast::{ExpectArg, Position};

use crate::script_kind::ScriptKind;
use questrunner_plugin::ValidationError;

/// The event a `plugin-event` script is attached to, needed to resolve
/// check 1 / check 5 for that script type.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    /// The event name.
    pub name: &'a str,
    /// Whether the protocol plugin allows `quest.test(...)` in this event's
    /// script.
    pub can_have_tests: bool,
}

/// Per-call validation context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext<'a> {
    /// Whether check 2 (conditional tests) is enforced.
    pub strict_mode: bool,
    /// Set when validating a `plugin-event` script.
    pub event: Option<EventContext<'a>>,
}

fn to_position(position: Option<Position>) -> Option<(u32, u32)> {
    position.map(|p| (p.line, p.column))
}

fn make_error(
    message: impl Into<String>,
    script_type: ScriptKind,
    position: Option<Position>,
) -> ValidationError {
    let mut error = ValidationError::script(message, Some(script_type.as_str()));
    if let Some((line, column)) = to_position(position) {
        error = error.with_location(line, column);
    }
    error
}

/// Statically validate one script slot. Returns an empty list for a blank
/// script or one with no violations.
pub fn validate(script: &str, script_type: ScriptKind, ctx: &ValidationContext<'_>) -> Vec<ValidationError> {
    if script.trim().is_empty() {
        return Vec::new();
    }

    let (script_ast, interner) = match ast::parse(script) {
        Ok(parsed) => parsed,
        Err(message) => {
            // Check 7: syntax errors are reported once with file location.
            return vec![make_error(format!("syntax error: {message}"), script_type, None)];
        }
    };
    let scan = ast::scan(&script_ast, &interner);
    let mut errors = Vec::new();

    // Check 1: placement of quest.test(...).
    let test_allowed = match script_type {
        ScriptKind::RequestPost => true,
        ScriptKind::PluginEvent => ctx.event.map(|e| e.can_have_tests).unwrap_or(false),
        _ => false,
    };
    for call in &scan.test_calls {
        if !test_allowed {
            errors.push(make_error(
                format!("quest.test() is not allowed in a {script_type} script"),
                script_type,
                call.position,
            ));
            continue;
        }
        // Check 2: conditional tests, strict mode only.
        if ctx.strict_mode && call.under_conditional_ancestor {
            errors.push(
                make_error(
                    "quest.test() must not be called conditionally",
                    script_type,
                    call.position,
                )
                .with_suggestion(
                    "use quest.skip() inside the test body, or move the condition to the request's `condition` field",
                ),
            );
        }
    }

    // Check 3: placement of quest.expectMessages(...).
    if !script_type.allows_expect_messages() {
        for call in &scan.expect_messages_calls {
            errors.push(make_error(
                "quest.expectMessages() is only allowed in request-pre scripts",
                script_type,
                call.position,
            ));
        }
    } else {
        for call in &scan.expect_messages_calls {
            // Check 4: argument validity.
            if call.first_arg == ast::ExpectArg::Invalid {
                errors.push(make_error(
                    "quest.expectMessages() requires a positive integer literal as its first argument",
                    script_type,
                    call.position,
                ));
            }
            // Check 5: protocol/event compatibility, the per-script half —
            // when called from inside a plugin-event script, that event
            // must itself support tests.
            if let Some(event) = ctx.event {
                if !event.can_have_tests {
                    errors.push(make_error(
                        format!("event '{}' does not support quest.test() or quest.expectMessages()", event.name),
                        script_type,
                        call.position,
                    ));
                }
            }
        }
    }

    errors
}

/// `countTests(script)` — number of `quest.test(...)` call sites; `0` on a
/// syntax error.
pub fn count_tests(script: &str) -> usize {
    if script.trim().is_empty() {
        return 0;
    }
    ast::parse(script).map(|(s, i)| ast::scan(&s, &i).test_calls.len()).unwrap_or(0)
}

/// `extractExpectedMessages(script)` — the literal integer argument of the
/// first `quest.expectMessages(...)` call, else `None`.
pub fn extract_expected_messages(script: &str) -> Option<u64> {
    if script.trim().is_empty() {
        return None;
    }
    let (script_ast, interner) = ast::parse(script).ok()?;
    ast::scan(&script_ast, &interner).expect_messages_calls.into_iter().find_map(|call| match call.first_arg {
        ast::ExpectArg::PositiveInt(n) => Some(n),
        ast::ExpectArg::Invalid => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(strict: bool) -> ValidationContext<'static> {
        ValidationContext {
            strict_mode: strict,
            event: None,
        }
    }

    #[test]
    fn test_call_rejected_outside_request_post() {
        let errors = validate(r#"quest.test("a", () => {});"#, ScriptKind::RequestPre, &ctx(true));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_call_allowed_in_request_post() {
        let errors = validate(r#"quest.test("a", () => {});"#, ScriptKind::RequestPost, &ctx(true));
        assert!(errors.is_empty());
    }

    #[test]
    fn conditional_test_rejected_in_strict_mode_only() {
        let script = r#"if (x) { quest.test("a", () => {}); }"#;
        let strict_errors = validate(script, ScriptKind::RequestPost, &ctx(true));
        assert_eq!(strict_errors.len(), 1);
        let lenient_errors = validate(script, ScriptKind::RequestPost, &ctx(false));
        assert!(lenient_errors.is_empty());
    }

    #[test]
    fn expect_messages_rejected_outside_request_pre() {
        let errors = validate("quest.expectMessages(3);", ScriptKind::RequestPost, &ctx(true));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn expect_messages_rejects_non_positive_integer_argument() {
        let errors = validate("quest.expectMessages(-1);", ScriptKind::RequestPre, &ctx(true));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn count_tests_matches_call_sites() {
        let script = r#"
            quest.test("a", () => {});
            quest.test("b", () => {});
        "#;
        assert_eq!(count_tests(script), 2);
    }

    #[test]
    fn count_tests_is_zero_on_syntax_error() {
        assert_eq!(count_tests("quest.test("), 0);
    }

    #[test]
    fn extract_expected_messages_reads_literal() {
        assert_eq!(extract_expected_messages("quest.expectMessages(5);"), Some(5));
        assert_eq!(extract_expected_messages("quest.expectMessages(-5);"), None);
        assert_eq!(extract_expected_messages("let x = 1;"), None);
    }

    #[test]
    fn event_without_can_have_tests_rejects_expect_messages() {
        let context = ValidationContext {
            strict_mode: true,
            event: Some(EventContext {
                name: "onComplete",
                can_have_tests: false,
            }),
        };
        let errors = validate(r#"quest.test("a", () => {});"#, ScriptKind::PluginEvent, &context);
        assert_eq!(errors.len(), 1);
    }
}
