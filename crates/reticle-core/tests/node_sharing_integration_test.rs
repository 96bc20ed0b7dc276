//! Integration tests for node sharing
//!
//! Rules with identical prefixes must share alpha chains, memories and beta nodes while each
//! rule still gets its own terminal and its own activations.

use reticle_core::config::EngineConfig;
use reticle_core::model::{Declaration, PatternElement, RuleDefinition, RuleElement};
use reticle_core::test_utils::*;
use reticle_core::{NetworkBuilder, Session};
use std::sync::Arc;

fn overdrawn(name: &str) -> RuleDefinition {
    let a = Declaration::new("a", account_type());
    RuleDefinition::new(name, PatternElement::new(a.clone()).with_condition(field_below(&a, "balance", 0)).into())
}

#[test]
fn test_identical_first_pattern_shares_alpha_memory() {
    let network = Arc::new(NetworkBuilder::compile(&[overdrawn("alert"), overdrawn("audit")]).unwrap());
    let memories = network.alpha_memories_for(&account_type());
    assert_eq!(memories.len(), 1);
    assert_eq!(network.stats().alpha_nodes, 2);

    let mut session = Session::new(Arc::clone(&network)).unwrap();
    session.insert(account_type(), account(1, -3)).unwrap();
    assert_eq!(session.alpha_fact_count(memories[0]), 1);
    assert_eq!(session.agenda().for_rule("alert").count(), 1);
    assert_eq!(session.agenda().for_rule("audit").count(), 1);
}

#[test]
fn test_shared_prefix_diverges_at_first_difference() {
    let a = Declaration::new("a", account_type());
    let h = Declaration::new("h", hold_type());
    let accounts = || PatternElement::new(a.clone()).with_condition(field_below(&a, "balance", 0));
    let held = RuleDefinition::new(
        "held_overdraft",
        RuleElement::And(vec![
            accounts().into(),
            PatternElement::new(h.clone()).with_condition(fields_equal(&h, "account_id", &a, "id")).into(),
        ]),
    );

    let network = NetworkBuilder::compile(&[overdraft_rule(), held, overdrawn("plain")]).unwrap();
    let stats = network.stats();
    // The hold join inside the overdraft subnet is reused by held_overdraft
    assert_eq!(network.nodes_of("join").len(), 2);
    assert_eq!(stats.alpha_memories, 2);
    assert_eq!(stats.terminals, 3);
    assert!(stats.shared_nodes >= 3);

    let first_join = network.nodes_of("join")[0];
    let mut rules = network.node(first_join).rules.clone();
    rules.sort();
    assert_eq!(rules, vec!["held_overdraft", "overdraft", "plain"]);
}

#[test]
fn test_sharing_does_not_change_matches() {
    let rules = [overdraft_rule(), overdrawn("plain")];
    let facts = vec![
        (account_type(), account(1, -10)),
        (account_type(), account(2, -5)),
        (account_type(), account(3, 5)),
        (hold_type(), hold(1, 2)),
    ];

    let mut counts = Vec::new();
    for node_sharing in [true, false] {
        let config = EngineConfig { node_sharing, ..EngineConfig::default() };
        let mut builder = NetworkBuilder::from_config(&config);
        builder.add_rules(&rules).unwrap();
        let network = Arc::new(builder.build());
        let mut session = Session::from_config(network, &config).unwrap();
        session.insert_all(facts.clone()).unwrap();
        counts.push((
            session.agenda().for_rule("overdraft").count(),
            session.agenda().for_rule("plain").count(),
            session.stats().network.total_nodes,
        ));
    }
    assert_eq!((counts[0].0, counts[0].1), (1, 2));
    assert_eq!((counts[1].0, counts[1].1), (1, 2));
    assert!(counts[0].2 < counts[1].2);
}
