//! Fixtures shared by unit tests, integration tests and benchmarks
//!
//! The fixtures model a small banking domain: accounts with a balance and holds placed on
//! accounts. [`overdraft_rule`] is the canonical `pattern AND NOT pattern` rule.

use crate::expression::Lambda;
use crate::model::{Condition, Declaration, PatternElement, RuleDefinition, RuleElement};
use reticle_types::{FactType, FactValue};

pub fn account_type() -> FactType {
    FactType::new("Account")
}

pub fn hold_type() -> FactType {
    FactType::new("Hold")
}

pub fn account(id: i64, balance: i64) -> FactValue {
    FactValue::record([("id", id), ("balance", balance)])
}

pub fn hold(id: i64, account_id: i64) -> FactValue {
    FactValue::record([("id", id), ("account_id", account_id)])
}

/// `left.left_field == right.right_field`
pub fn fields_equal(
    left: &Declaration,
    left_field: &'static str,
    right: &Declaration,
    right_field: &'static str,
) -> Condition {
    let text = format!("{}.{left_field} == {}.{right_field}", left.name(), right.name());
    Condition::expression(text, vec![left.clone(), right.clone()], move |args| {
        Ok(args[0].field(left_field)? == args[1].field(right_field)?)
    })
}

/// `declaration.field < bound`
pub fn field_below(declaration: &Declaration, field: &'static str, bound: i64) -> Condition {
    let text = format!("{}.{field} < {bound}", declaration.name());
    Condition::expression(text, vec![declaration.clone()], move |args| Ok(args[0].field_i64(field)? < bound))
}

/// Selector returning one field of the declaration's fact
pub fn field_selector(declaration: &Declaration, field: &'static str) -> Lambda<FactValue> {
    let text = format!("{}.{field}", declaration.name());
    Lambda::new(text, vec![declaration.clone()], move |args| Ok(args[0].field(field)?.clone()))
}

/// `Account(a.balance < 0) AND NOT Hold(h.account_id == a.id)`
pub fn overdraft_rule() -> RuleDefinition {
    let a = Declaration::new("a", account_type());
    let h = Declaration::new("h", hold_type());
    let accounts = PatternElement::new(a.clone()).with_condition(field_below(&a, "balance", 0));
    let holds = PatternElement::new(h.clone()).with_condition(fields_equal(&h, "account_id", &a, "id"));
    RuleDefinition::new("overdraft", RuleElement::And(vec![accounts.into(), RuleElement::not(holds.into())]))
}
