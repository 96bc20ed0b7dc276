//! End-to-end matching through sessions
//!
//! Covers the negation scenario, quantifier boundaries, updates, disjunction, bindings and
//! type hierarchies, observing the network only through the agenda.

use reticle_core::agenda::AgendaEvent;
use reticle_core::config::EngineConfig;
use reticle_core::model::{Condition, Declaration, PatternElement, RuleDefinition, RuleElement};
use reticle_core::test_utils::*;
use reticle_core::{FactType, FactValue, Lambda, NetworkBuilder, Session};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

fn recording_session(rules: &[RuleDefinition]) -> Session {
    init_tracing();
    let network = Arc::new(NetworkBuilder::compile(rules).unwrap());
    let config = EngineConfig::from_yaml_str("session:\n  record_agenda_events: true\n").unwrap();
    Session::from_config(network, &config).unwrap()
}

fn event_kinds(session: &mut Session) -> Vec<&'static str> {
    session.agenda_mut().take_events().iter().map(AgendaEvent::kind).collect()
}

/// `Account a AND EXISTS Hold(h.account_id == a.id)`
fn held_rule() -> RuleDefinition {
    let a = Declaration::new("a", account_type());
    let h = Declaration::new("h", hold_type());
    let holds = PatternElement::new(h.clone()).with_condition(fields_equal(&h, "account_id", &a, "id"));
    RuleDefinition::new(
        "held",
        RuleElement::And(vec![PatternElement::new(a).into(), RuleElement::exists(holds.into())]),
    )
}

#[test]
fn test_overdraft_scenario() {
    let mut session = recording_session(&[overdraft_rule()]);

    let account = session.insert(account_type(), account(1, -10)).unwrap();
    assert_eq!(session.agenda().len(), 1);
    let activation = session.agenda().activations().next().unwrap().clone();
    assert_eq!(activation.rule, "overdraft");
    assert_eq!(activation.fact("a"), Some(account));

    let hold_fact = session.insert(hold_type(), hold(100, 1)).unwrap();
    assert!(session.agenda().is_empty());

    session.retract(hold_fact).unwrap();
    assert_eq!(session.agenda().len(), 1);
    assert_eq!(event_kinds(&mut session), vec!["asserted", "retracted", "asserted"]);
}

#[test]
fn test_hold_on_other_account_does_not_block() {
    let mut session = recording_session(&[overdraft_rule()]);
    session.insert(account_type(), account(1, -10)).unwrap();
    session.insert(account_type(), account(2, -20)).unwrap();
    session.insert(hold_type(), hold(100, 2)).unwrap();

    let matched: Vec<_> = session.agenda().activations().filter_map(|a| a.fact("a")).collect();
    assert_eq!(matched.len(), 1);
    assert_eq!(session.value(matched[0]).and_then(|v| v.get("id")), Some(&FactValue::Integer(1)));
}

#[test]
fn test_not_fires_once_per_zero_crossing() {
    let mut session = recording_session(&[overdraft_rule()]);
    session.insert(account_type(), account(1, -10)).unwrap();
    session.agenda_mut().take_events();

    let holds = session
        .insert_all(vec![(hold_type(), hold(1, 1)), (hold_type(), hold(2, 1)), (hold_type(), hold(3, 1))])
        .unwrap();
    assert_eq!(event_kinds(&mut session), vec!["retracted"]);

    let more = session.insert(hold_type(), hold(4, 1)).unwrap();
    session.retract_all(&holds[..2]).unwrap();
    assert!(event_kinds(&mut session).is_empty());

    session.retract_all(&[holds[2], more]).unwrap();
    assert_eq!(event_kinds(&mut session), vec!["asserted"]);
}

#[test]
fn test_exists_fires_once_per_zero_crossing() {
    let mut session = recording_session(&[held_rule()]);
    session.insert(account_type(), account(1, 50)).unwrap();
    assert!(session.agenda().is_empty());

    let first = session.insert(hold_type(), hold(1, 1)).unwrap();
    let second = session.insert(hold_type(), hold(2, 1)).unwrap();
    assert_eq!(event_kinds(&mut session), vec!["asserted"]);
    let activation = session.agenda().activations().next().unwrap();
    assert_eq!(activation.fact("h"), None);

    session.retract(first).unwrap();
    assert!(event_kinds(&mut session).is_empty());
    session.retract(second).unwrap();
    assert_eq!(event_kinds(&mut session), vec!["retracted"]);
}

#[test]
fn test_update_moves_fact_in_and_out_of_match() {
    let mut session = recording_session(&[overdraft_rule()]);
    let fact = session.insert(account_type(), account(1, -10)).unwrap();

    session.update(fact, account(1, -20)).unwrap();
    session.update(fact, account(1, 5)).unwrap();
    assert!(session.agenda().is_empty());
    session.update(fact, account(1, -1)).unwrap();
    assert_eq!(session.agenda().len(), 1);

    assert_eq!(event_kinds(&mut session), vec!["asserted", "updated", "retracted", "asserted"]);
}

#[test]
fn test_updated_hold_can_release_account() {
    let mut session = recording_session(&[overdraft_rule()]);
    session.insert(account_type(), account(1, -10)).unwrap();
    let hold_fact = session.insert(hold_type(), hold(7, 1)).unwrap();
    assert!(session.agenda().is_empty());

    session.update(hold_fact, hold(7, 2)).unwrap();
    assert_eq!(session.agenda().len(), 1);
    session.update(hold_fact, hold(7, 1)).unwrap();
    assert!(session.agenda().is_empty());
}

#[test]
fn test_or_branches_share_one_rule() {
    let a = Declaration::new("a", account_type());
    let h = Declaration::new("h", hold_type());
    let overdrawn = PatternElement::new(a.clone()).with_condition(field_below(&a, "balance", 0));
    let lhs = RuleElement::Or(vec![overdrawn.into(), PatternElement::new(h).into()]);
    let mut session = recording_session(&[RuleDefinition::new("attention", lhs)]);

    session.insert(account_type(), account(1, -5)).unwrap();
    let hold_fact = session.insert(hold_type(), hold(3, 9)).unwrap();
    assert_eq!(session.agenda().for_rule("attention").count(), 2);

    let by_hold = session.agenda().activations().find(|a| a.fact("h").is_some()).unwrap();
    assert_eq!(by_hold.fact("h"), Some(hold_fact));
    assert_eq!(by_hold.fact("a"), None);
    assert_eq!(by_hold.declarations.len(), 2);
}

#[test]
fn test_binding_tracks_its_inputs() {
    let a = Declaration::new("a", account_type());
    let doubled = Lambda::new("a.balance * 2", vec![a.clone()], |args| {
        Ok(FactValue::from(args[0].field_i64("balance")? * 2))
    });
    let d = PatternElement::of("d", &FactType::new("Doubled")).from_binding(doubled);
    let lhs = RuleElement::And(vec![PatternElement::new(a).into(), d.into()]);
    let mut session = recording_session(&[RuleDefinition::new("doubled", lhs)]);

    let fact = session.insert(account_type(), account(1, -4)).unwrap();
    let bound = session.agenda().activations().next().and_then(|a| a.fact("d")).unwrap();
    assert_eq!(session.value(bound), Some(&FactValue::Integer(-8)));

    session.update(fact, account(1, 6)).unwrap();
    assert_eq!(session.value(bound), Some(&FactValue::Integer(12)));
    assert_eq!(event_kinds(&mut session), vec!["asserted", "updated"]);

    session.retract(fact).unwrap();
    assert!(session.agenda().is_empty());
    assert!(session.value(bound).is_none());
}

#[test]
fn test_binding_with_condition_joins_through_subnet() {
    let a = Declaration::new("a", account_type());
    let d = Declaration::new("d", FactType::new("Doubled"));
    let doubled = Lambda::new("a.balance * 2", vec![a.clone()], |args| {
        Ok(FactValue::from(args[0].field_i64("balance")? * 2))
    });
    let very_negative = Condition::expression("d < -5", vec![d.clone()], |args| {
        Ok(args[0].as_i64().is_some_and(|v| v < -5))
    });
    let bound = PatternElement::new(d).from_binding(doubled).with_condition(very_negative);
    let lhs = RuleElement::And(vec![PatternElement::new(a).into(), bound.into()]);
    let mut session = recording_session(&[RuleDefinition::new("deep", lhs)]);

    let fact = session.insert(account_type(), account(1, -4)).unwrap();
    let activation = session.agenda().activations().next().unwrap().clone();
    let value = activation.fact("d").and_then(|f| session.value(f));
    assert_eq!(value, Some(&FactValue::Integer(-8)));

    session.update(fact, account(1, -2)).unwrap();
    assert!(session.agenda().is_empty());
    session.update(fact, account(1, -3)).unwrap();
    assert_eq!(session.agenda().len(), 1);
}

#[test]
fn test_supertype_pattern_matches_subtypes() {
    let party = FactType::new("Party");
    let customer = FactType::new("Customer").with_supertype(&party);
    let mut session = recording_session(&[RuleDefinition::new("parties", PatternElement::of("p", &party).into())]);

    session.insert(customer, FactValue::record([("id", 1)])).unwrap();
    session.insert(FactType::new("Supplier"), FactValue::record([("id", 2)])).unwrap();
    session.insert(party, FactValue::record([("id", 3)])).unwrap();
    assert_eq!(session.agenda().len(), 2);
}

#[test]
fn test_rule_without_facts_matches_on_activation() {
    let h = Declaration::new("h", hold_type());
    let lhs = RuleElement::not(PatternElement::new(h).into());
    let mut session = recording_session(&[RuleDefinition::new("no_holds", lhs)]);
    assert_eq!(session.agenda().len(), 1);

    let fact = session.insert(hold_type(), hold(1, 1)).unwrap();
    assert!(session.agenda().is_empty());
    session.retract(fact).unwrap();
    assert_eq!(session.agenda().len(), 1);
}

#[test]
fn test_fail_fast_surfaces_expression_text() {
    let mut session = recording_session(&[overdraft_rule()]);
    let err = session.insert(account_type(), FactValue::record([("id", 1)])).unwrap_err();
    assert_eq!(err.category(), "evaluation");
    assert!(err.to_string().contains("a.balance < 0"));
}

#[test]
fn test_suppressed_failure_counts_as_no_match() {
    let network = Arc::new(NetworkBuilder::compile(&[overdraft_rule()]).unwrap());
    let config = EngineConfig::from_yaml_str("lhs_errors: suppress\n").unwrap();
    let mut session = Session::from_config(network, &config).unwrap();

    session.insert(account_type(), FactValue::record([("id", 1)])).unwrap();
    session.insert(account_type(), account(2, -1)).unwrap();
    assert_eq!(session.agenda().len(), 1);
}
