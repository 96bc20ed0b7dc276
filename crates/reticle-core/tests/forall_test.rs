//! Universal quantification
//!
//! `forall` has no node of its own; these tests check the rewritten network behaves like the
//! quantifier, including the vacuous case.

use reticle_core::model::{Condition, Declaration, PatternElement, RuleDefinition, RuleElement};
use reticle_core::test_utils::*;
use reticle_core::{FactValue, NetworkBuilder, Session};
use std::sync::Arc;

fn field_above(declaration: &Declaration, field: &'static str, bound: i64) -> Condition {
    let text = format!("{}.{field} > {bound}", declaration.name());
    Condition::expression(text, vec![declaration.clone()], move |args| Ok(args[0].field_i64(field)? > bound))
}

fn session(rule: RuleDefinition) -> Session {
    Session::new(Arc::new(NetworkBuilder::compile(&[rule]).unwrap())).unwrap()
}

/// Every overdrawn account stays above the credit limit
fn within_limit() -> RuleDefinition {
    let a = Declaration::new("a", account_type());
    let b = Declaration::new("b", account_type());
    let base = PatternElement::new(a.clone()).with_condition(field_below(&a, "balance", 0));
    let limited = PatternElement::new(b.clone()).with_condition(field_above(&b, "balance", -100));
    RuleDefinition::new("within_limit", RuleElement::ForAll { base, patterns: vec![limited] })
}

#[test]
fn test_forall_holds_vacuously() {
    let mut session = session(within_limit());
    assert_eq!(session.agenda().len(), 1);
    session.insert(account_type(), account(1, 500)).unwrap();
    assert_eq!(session.agenda().len(), 1);
}

#[test]
fn test_forall_fails_on_counterexample() {
    let mut session = session(within_limit());
    session.insert(account_type(), account(1, -50)).unwrap();
    assert_eq!(session.agenda().len(), 1);

    let deep = session.insert(account_type(), account(2, -500)).unwrap();
    assert!(session.agenda().is_empty());

    session.update(deep, account(2, -20)).unwrap();
    assert_eq!(session.agenda().len(), 1);
    session.update(deep, account(2, -200)).unwrap();
    assert!(session.agenda().is_empty());
    session.retract(deep).unwrap();
    assert_eq!(session.agenda().len(), 1);
}

#[test]
fn test_forall_scoped_by_outer_pattern() {
    let a = Declaration::new("a", account_type());
    let h = Declaration::new("h", hold_type());
    let small = Declaration::new("s", hold_type());
    let base = PatternElement::new(h.clone()).with_condition(fields_equal(&h, "account_id", &a, "id"));
    let below = PatternElement::new(small.clone()).with_condition(field_below(&small, "amount", 100));
    let lhs = RuleElement::And(vec![
        PatternElement::new(a).into(),
        RuleElement::ForAll { base, patterns: vec![below] },
    ]);
    let mut session = session(RuleDefinition::new("small_holds_only", lhs));

    session.insert(account_type(), account(1, 0)).unwrap();
    session.insert(account_type(), account(2, 0)).unwrap();
    session.insert(hold_type(), hold(1, 1).with("amount", 20)).unwrap();
    assert_eq!(session.agenda().len(), 2);

    let large = session.insert(hold_type(), hold(2, 1).with("amount", 500)).unwrap();
    let matched: Vec<_> = session
        .agenda()
        .activations()
        .filter_map(|a| a.fact("a"))
        .filter_map(|f| session.value(f))
        .filter_map(|v| v.get("id").cloned())
        .collect();
    assert_eq!(matched, vec![FactValue::Integer(2)]);

    session.update(large, hold(2, 2).with("amount", 500)).unwrap();
    let matched: Vec<_> = session
        .agenda()
        .activations()
        .filter_map(|a| a.fact("a"))
        .filter_map(|f| session.value(f))
        .filter_map(|v| v.get("id").cloned())
        .collect();
    assert_eq!(matched, vec![FactValue::Integer(1)]);
}

#[test]
fn test_forall_without_patterns_is_rejected() {
    let base = PatternElement::of("a", &account_type());
    let rule = RuleDefinition::new("empty", RuleElement::ForAll { base, patterns: Vec::new() });
    let err = NetworkBuilder::compile(&[rule]).unwrap_err();
    assert_eq!(err.category(), "compilation");
}
