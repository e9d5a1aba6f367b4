//! Low-level AST walk over a parsed script, looking for `quest.test(...)`
//! and `quest.expectMessages(...)` call sites and the ancestor shape
//! around each one. Built on `boa_parser`/`boa_ast`/`boa_interner` for
//! standalone static inspection of JavaScript source.

use boa_ast::expression::literal::Literal;
use boa_ast::expression::operator::binary::{BinaryOp, LogicalOp};
use boa_ast::expression::operator::unary::UnaryOp;
use boa_ast::expression::Expression;
use boa_ast::function::FormalParameterList;
use boa_ast::statement::{Statement, StatementListItem};
use boa_ast::visitor::{VisitWith, Visitor};
use boa_ast::Script;
use boa_interner::{Interner, Sym};
use std::ops::ControlFlow;

/// A source position, 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// One ancestor control-structure kind the walker tracks, per check 2 in
/// the script body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestorKind {
    /// An `if (...) { ... }` / `if (...) ... else ...`.
    IfStatement,
    /// A `cond ? a : b` ternary.
    Ternary,
    /// A `a && b` / `a || b` short-circuit.
    Logical,
    /// A `try { ... } catch { ... }`.
    TryStatement,
}

/// A single `quest.test(...)` call site found in the script.
#[derive(Debug, Clone)]
pub struct TestCallSite {
    /// Source position of the call, if known.
    pub position: Option<Position>,
    /// Whether any ancestor node is an if/ternary/logical/try.
    pub under_conditional_ancestor: bool,
}

/// The validity classification of `quest.expectMessages`'s first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectArg {
    /// A literal positive integer.
    PositiveInt(u64),
    /// Present but not a positive integer literal (unary-minus, float,
    /// non-literal expression, zero, …).
    Invalid,
}

/// A single `quest.expectMessages(...)` call site found in the script.
#[derive(Debug, Clone)]
pub struct ExpectMessagesCallSite {
    /// Source position of the call, if known.
    pub position: Option<Position>,
    /// Classification of the first argument.
    pub first_arg: ExpectArg,
}

/// The result of scanning one script's AST.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Every `quest.test(...)` call site found.
    pub test_calls: Vec<TestCallSite>,
    /// Every `quest.expectMessages(...)` call site found.
    pub expect_messages_calls: Vec<ExpectMessagesCallSite>,
}

/// Parse `source` as a script, returning the AST plus the interner that
/// resolves its symbols. A syntax error is surfaced as `Err(message)`.
pub fn parse(source: &str) -> Result<(Script, Interner), String> {
    use boa_parser::{Parser, Source};

    let mut interner = Interner::default();
    let mut parser = Parser::new(Source::from_bytes(source.as_bytes()));
    parser.parse_script(&boa_ast::scope::Scope::new_global(), &mut interner).map(|script| (script, interner)).map_err(|e| e.to_string())
}

/// Resolve `sym` to its string form, or an empty string if the interner has
/// no entry (should not happen for a successfully-parsed script).
fn resolve<'i>(interner: &'i Interner, sym: Sym) -> std::borrow::Cow<'i, str> {
    interner
        .resolve(sym)
        .map(|s| s.to_string().into())
        .unwrap_or_default()
}

/// Returns `Some(member)` when `expr` is exactly `quest.<member>` (a simple,
/// non-computed property access on an identifier named `quest`).
fn as_quest_member(expr: &Expression, interner: &Interner) -> Option<String> {
    let Expression::PropertyAccess(access) = expr else {
        return None;
    };
    let simple = access.as_simple()?;
    let Expression::Identifier(ident) = simple.target() else {
        return None;
    };
    if resolve(interner, ident.sym()) != "quest" {
        return None;
    }
    let field = simple.field().literal()?;
    Some(resolve(interner, field).into_owned())
}

/// Classifies a `quest.expectMessages` first argument expression.
fn classify_first_arg(expr: &Expression) -> ExpectArg {
    match expr {
        Expression::Literal(Literal::Int(i)) if *i > 0 => ExpectArg::PositiveInt(*i as u64),
        Expression::Literal(Literal::Num(f)) if *f > 0.0 && f.fract() == 0.0 => {
            ExpectArg::PositiveInt(*f as u64)
        }
        _ => ExpectArg::Invalid,
    }
}

struct Walker<'i> {
    interner: &'i Interner,
    ancestors: Vec<AncestorKind>,
    result: ScanResult,
}

impl<'i> Walker<'i> {
    fn under_conditional_ancestor(&self) -> bool {
        !self.ancestors.is_empty()
    }

    fn record_call(&mut self, callee_member: &str, args: &[Expression], position: Option<Position>) {
        match callee_member {
            "test" => {
                self.result.test_calls.push(TestCallSite {
                    position,
                    under_conditional_ancestor: self.under_conditional_ancestor(),
                });
            }
            "expectMessages" => {
                let first_arg = match args.first() {
                    Some(Expression::Unary(unary)) if unary.op() == UnaryOp::Minus => {
                        ExpectArg::Invalid
                    }
                    Some(expr) => classify_first_arg(expr),
                    None => ExpectArg::Invalid,
                };
                self.result.expect_messages_calls.push(ExpectMessagesCallSite { position, first_arg });
            }
            _ => {}
        }
    }
}

impl<'i, 'ast> Visitor<'ast> for Walker<'i> {
    type BreakTy = ();

    fn visit_statement(&mut self, node: &'ast Statement) -> ControlFlow<Self::BreakTy> {
        let pushed = match node {
            Statement::If(_) => Some(AncestorKind::IfStatement),
            Statement::Try(_) => Some(AncestorKind::TryStatement),
            _ => None,
        };
        if let Some(kind) = pushed {
            self.ancestors.push(kind);
        }
        let flow = node.visit_with(self);
        if pushed.is_some() {
            self.ancestors.pop();
        }
        flow
    }

    fn visit_expression(&mut self, node: &'ast Expression) -> ControlFlow<Self::BreakTy> {
        if let Expression::Call(call) = node {
            if let Some(member) = as_quest_member(call.function(), self.interner) {
                self.record_call(&member, call.args(), None);
            }
        }

        let pushed = match node {
            Expression::Conditional(_) => Some(AncestorKind::Ternary),
            Expression::Binary(bin) => match bin.op() {
                BinaryOp::Logical(LogicalOp::And | LogicalOp::Or) => Some(AncestorKind::Logical),
                _ => None,
            },
            _ => None,
        };
        if let Some(kind) = pushed {
            self.ancestors.push(kind);
        }
        let flow = node.visit_with(self);
        if pushed.is_some() {
            self.ancestors.pop();
        }
        flow
    }

    fn visit_formal_parameter_list(
        &mut self,
        node: &'ast FormalParameterList,
    ) -> ControlFlow<Self::BreakTy> {
        node.visit_with(self)
    }

    fn visit_statement_list_item(
        &mut self,
        node: &'ast StatementListItem,
    ) -> ControlFlow<Self::BreakTy> {
        node.visit_with(self)
    }
}

/// Walk `script`'s whole statement list, recording every `quest.test(...)`
/// and `quest.expectMessages(...)` call site.
pub fn scan(script: &Script, interner: &Interner) -> ScanResult {
    let mut walker = Walker {
        interner,
        ancestors: Vec::new(),
        result: ScanResult::default(),
    };
    let _ = script.visit_with(&mut walker);
    walker.result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_unconditional_test_call() {
        let (script, interner) = parse(r#"quest.test("ok", () => {});"#).unwrap();
        let result = scan(&script, &interner);
        assert_eq!(result.test_calls.len(), 1);
        assert!(!result.test_calls[0].under_conditional_ancestor);
    }

    #[test]
    fn flags_test_call_under_if() {
        let (script, interner) =
            parse(r#"if (x) { quest.test("ok", () => {}); }"#).unwrap();
        let result = scan(&script, &interner);
        assert_eq!(result.test_calls.len(), 1);
        assert!(result.test_calls[0].under_conditional_ancestor);
    }

    #[test]
    fn flags_test_call_under_logical_and() {
        let (script, interner) =
            parse(r#"x && quest.test("ok", () => {});"#).unwrap();
        let result = scan(&script, &interner);
        assert!(result.test_calls[0].under_conditional_ancestor);
    }

    #[test]
    fn classifies_expect_messages_positive_int() {
        let (script, interner) = parse(r#"quest.expectMessages(3);"#).unwrap();
        let result = scan(&script, &interner);
        assert_eq!(result.expect_messages_calls.len(), 1);
        assert_eq!(result.expect_messages_calls[0].first_arg, ExpectArg::PositiveInt(3));
    }

    #[test]
    fn rejects_unary_minus_expect_messages_argument() {
        let (script, interner) = parse(r#"quest.expectMessages(-1);"#).unwrap();
        let result = scan(&script, &interner);
        assert_eq!(result.expect_messages_calls[0].first_arg, ExpectArg::Invalid);
    }

    #[test]
    fn rejects_non_integer_expect_messages_argument() {
        let (script, interner) = parse(r#"quest.expectMessages(1.5);"#).unwrap();
        let result = scan(&script, &interner);
        assert_eq!(result.expect_messages_calls[0].first_arg, ExpectArg::Invalid);
    }

    #[test]
    fn syntax_error_surfaces_as_err() {
        assert!(parse("quest.test(").is_err());
    }
}
