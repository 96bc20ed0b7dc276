//! Beta network propagation
//!
//! Beta nodes receive tuples on the left and facts on the right. Every binary node writes its
//! output into its own beta memory as `(parent tuple, right fact)` pairs; the memory creates,
//! finds or frees the child tuples and activates the next nodes on their left.
//!
//! ## Subnet joins
//!
//! When the right input of a node is an adapter over a subnetwork, each wrapper fact only
//! belongs to the left tuple its subnet tuple was derived from. Such facts are grouped by the
//! ancestor of the wrapped tuple at the left memory's level instead of being cross joined.
//!
//! Subnets are built before their consumer, so a left memory activates the subnet first on
//! assert: right activations for a tuple that is not yet in the left memory are skipped and
//! the consumer pulls the wrapper facts itself when the tuple arrives on its left. On retract
//! the memory notifies its sinks in reverse, so the consumer lets go of a tuple before the
//! subnet retracts the wrapper facts derived from it.

use crate::agenda::Activation;
use crate::aggregate_node::AggregateNode;
use crate::binding_node::BindingNode;
use crate::error::{ExpressionKind, Result};
use crate::fact::{Fact, FactId};
use crate::model::Declaration;
use crate::rete_network::{ExecutionContext, JoinCondition, NodeId, NodeKind, ReteNetwork};
use crate::state::NodeState;
use crate::tuple::TupleId;
use crate::working_memory::WorkingMemory;
use ahash::AHashMap;
use reticle_types::FactType;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// A parent tuple and the right fact extending it; `None` for Not/Exists
pub(crate) type Pair = (TupleId, Option<FactId>);

/// Type given to wrapper facts over tuples without any fact
const EMPTY_TUPLE_TYPE: &str = "$tuple";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Assert,
    Update,
    Retract,
}

/// Put the root tuple into the dummy memory and let every node built on it see it
pub(crate) fn activate(ctx: &mut ExecutionContext<'_>, dummy: NodeId) -> Result<()> {
    let root = ctx.memory.create_root_tuple();
    let network = ctx.network;
    for sink in sinks(network, dummy) {
        left_assert(ctx, *sink, &[root])?;
    }
    ctx.memory.beta_memory_mut(dummy).add_root(root);
    Ok(())
}

// ============================================================================
// LEFT ACTIVATIONS
// ============================================================================

pub(crate) fn left_assert(ctx: &mut ExecutionContext<'_>, node: NodeId, tuples: &[TupleId]) -> Result<()> {
    if tuples.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Join { left, right, conditions, is_subnet, memory } => {
            let mut matches = Vec::new();
            for (tuple, facts) in candidates(ctx, *left, *right, *is_subnet, tuples) {
                for fact in facts {
                    if join_matches(ctx, node, conditions, tuple, fact)? {
                        matches.push((tuple, Some(fact)));
                    }
                }
            }
            memory_assert(ctx, *memory, matches)
        }
        NodeKind::Not { left, right, is_subnet, memory } | NodeKind::Exists { left, right, is_subnet, memory } => {
            let negated = matches!(network.node(node).kind, NodeKind::Not { .. });
            let mut passing = Vec::new();
            for (tuple, facts) in candidates(ctx, *left, *right, *is_subnet, tuples) {
                let count = facts.len();
                ctx.memory.set_state(node, tuple, NodeState::Quantifier(count));
                if quantifier_holds(negated, count) {
                    passing.push((tuple, None));
                }
            }
            memory_assert(ctx, *memory, passing)
        }
        NodeKind::Aggregate { .. } => AggregateNode::of(network, node).map_or(Ok(()), |n| n.left_assert(ctx, tuples)),
        NodeKind::Binding { .. } => BindingNode::of(network, node).map_or(Ok(()), |n| n.left_assert(ctx, tuples)),
        NodeKind::Adapter { sinks, .. } => adapter_assert(ctx, node, sinks, tuples),
        NodeKind::Terminal { rule, fact_map, declarations } => {
            notify_terminal(ctx, rule, fact_map, declarations, tuples, Change::Assert);
            Ok(())
        }
        _ => Ok(()),
    }
}

pub(crate) fn left_update(ctx: &mut ExecutionContext<'_>, node: NodeId, tuples: &[TupleId]) -> Result<()> {
    if tuples.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Join { left, right, conditions, is_subnet, memory } => {
            // The subnet delivers the changes through the adapter
            if *is_subnet {
                return Ok(());
            }
            let mut to_update = Vec::new();
            let mut to_retract = Vec::new();
            for (tuple, facts) in candidates(ctx, *left, *right, false, tuples) {
                for fact in facts {
                    if join_matches(ctx, node, conditions, tuple, fact)? {
                        to_update.push((tuple, Some(fact)));
                    } else {
                        to_retract.push((tuple, Some(fact)));
                    }
                }
            }
            memory_retract(ctx, *memory, to_retract)?;
            memory_update(ctx, *memory, to_update)
        }
        NodeKind::Not { memory, .. } | NodeKind::Exists { memory, .. } => {
            let negated = matches!(network.node(node).kind, NodeKind::Not { .. });
            let passing: Vec<Pair> = tuples
                .iter()
                .filter(|t| match ctx.memory.state(node, **t) {
                    Some(NodeState::Quantifier(count)) => quantifier_holds(negated, *count),
                    _ => false,
                })
                .map(|t| (*t, None))
                .collect();
            memory_update(ctx, *memory, passing)
        }
        NodeKind::Aggregate { .. } => AggregateNode::of(network, node).map_or(Ok(()), |n| n.left_update(ctx, tuples)),
        NodeKind::Binding { .. } => BindingNode::of(network, node).map_or(Ok(()), |n| n.left_update(ctx, tuples)),
        NodeKind::Adapter { sinks, .. } => {
            let wrappers = wrappers_of(ctx.memory, node, tuples);
            for sink in sinks {
                right_update(ctx, *sink, &wrappers)?;
            }
            Ok(())
        }
        NodeKind::Terminal { rule, fact_map, declarations } => {
            notify_terminal(ctx, rule, fact_map, declarations, tuples, Change::Update);
            Ok(())
        }
        _ => Ok(()),
    }
}

pub(crate) fn left_retract(ctx: &mut ExecutionContext<'_>, node: NodeId, tuples: &[TupleId]) -> Result<()> {
    if tuples.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Join { left, right, is_subnet, memory, .. } => {
            let pairs = candidates(ctx, *left, *right, *is_subnet, tuples)
                .into_iter()
                .flat_map(|(tuple, facts)| facts.into_iter().map(move |f| (tuple, Some(f))))
                .collect();
            memory_retract(ctx, *memory, pairs)
        }
        NodeKind::Not { memory, .. } | NodeKind::Exists { memory, .. } => {
            let negated = matches!(network.node(node).kind, NodeKind::Not { .. });
            let mut passing = Vec::new();
            for &tuple in tuples {
                if let Some(NodeState::Quantifier(count)) = ctx.memory.remove_state(node, tuple) {
                    if quantifier_holds(negated, count) {
                        passing.push((tuple, None));
                    }
                }
            }
            memory_retract(ctx, *memory, passing)
        }
        NodeKind::Aggregate { .. } => AggregateNode::of(network, node).map_or(Ok(()), |n| n.left_retract(ctx, tuples)),
        NodeKind::Binding { .. } => BindingNode::of(network, node).map_or(Ok(()), |n| n.left_retract(ctx, tuples)),
        NodeKind::Adapter { sinks, .. } => adapter_retract(ctx, node, sinks, tuples),
        NodeKind::Terminal { rule, fact_map, declarations } => {
            notify_terminal(ctx, rule, fact_map, declarations, tuples, Change::Retract);
            Ok(())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// RIGHT ACTIVATIONS
// ============================================================================

pub(crate) fn right_assert(ctx: &mut ExecutionContext<'_>, node: NodeId, facts: &[FactId]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Join { left, conditions, is_subnet, memory, .. } => {
            let mut matches = Vec::new();
            for (tuple, group) in affected(ctx, *left, *is_subnet, facts) {
                for fact in group {
                    if join_matches(ctx, node, conditions, tuple, fact)? {
                        matches.push((tuple, Some(fact)));
                    }
                }
            }
            memory_assert(ctx, *memory, matches)
        }
        NodeKind::Not { left, is_subnet, memory, .. } | NodeKind::Exists { left, is_subnet, memory, .. } => {
            let negated = matches!(network.node(node).kind, NodeKind::Not { .. });
            let mut crossed = Vec::new();
            for (tuple, group) in affected(ctx, *left, *is_subnet, facts) {
                if let Some(NodeState::Quantifier(count)) = ctx.memory.state_mut(node, tuple) {
                    let before = *count;
                    *count += group.len();
                    if before == 0 && *count > 0 {
                        crossed.push((tuple, None));
                    }
                }
            }
            trace!(node = %node, crossed = crossed.len(), "Quantifier right assert");
            if negated {
                memory_retract(ctx, *memory, crossed)
            } else {
                memory_assert(ctx, *memory, crossed)
            }
        }
        NodeKind::Aggregate { .. } => AggregateNode::of(network, node).map_or(Ok(()), |n| n.right_assert(ctx, facts)),
        _ => Ok(()),
    }
}

pub(crate) fn right_update(ctx: &mut ExecutionContext<'_>, node: NodeId, facts: &[FactId]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Join { left, conditions, is_subnet, memory, .. } => {
            let mut to_update = Vec::new();
            let mut to_retract = Vec::new();
            for (tuple, group) in affected(ctx, *left, *is_subnet, facts) {
                for fact in group {
                    if join_matches(ctx, node, conditions, tuple, fact)? {
                        to_update.push((tuple, Some(fact)));
                    } else {
                        to_retract.push((tuple, Some(fact)));
                    }
                }
            }
            memory_retract(ctx, *memory, to_retract)?;
            memory_update(ctx, *memory, to_update)
        }
        // A changed value never moves a quantifier across zero
        NodeKind::Not { .. } | NodeKind::Exists { .. } => Ok(()),
        NodeKind::Aggregate { .. } => AggregateNode::of(network, node).map_or(Ok(()), |n| n.right_update(ctx, facts)),
        _ => Ok(()),
    }
}

pub(crate) fn right_retract(ctx: &mut ExecutionContext<'_>, node: NodeId, facts: &[FactId]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Join { left, is_subnet, memory, .. } => {
            let pairs = affected(ctx, *left, *is_subnet, facts)
                .into_iter()
                .flat_map(|(tuple, group)| group.into_iter().map(move |f| (tuple, Some(f))))
                .collect();
            memory_retract(ctx, *memory, pairs)
        }
        NodeKind::Not { left, is_subnet, memory, .. } | NodeKind::Exists { left, is_subnet, memory, .. } => {
            let negated = matches!(network.node(node).kind, NodeKind::Not { .. });
            let mut crossed = Vec::new();
            for (tuple, group) in affected(ctx, *left, *is_subnet, facts) {
                if let Some(NodeState::Quantifier(count)) = ctx.memory.state_mut(node, tuple) {
                    let before = *count;
                    *count = count.saturating_sub(group.len());
                    if before > 0 && *count == 0 {
                        crossed.push((tuple, None));
                    }
                }
            }
            trace!(node = %node, crossed = crossed.len(), "Quantifier right retract");
            if negated {
                memory_assert(ctx, *memory, crossed)
            } else {
                memory_retract(ctx, *memory, crossed)
            }
        }
        NodeKind::Aggregate { .. } => AggregateNode::of(network, node).map_or(Ok(()), |n| n.right_retract(ctx, facts)),
        _ => Ok(()),
    }
}

// ============================================================================
// BETA MEMORY
// ============================================================================

/// Create child tuples for `pairs`, activate the memory's sinks, then store the tuples
pub(crate) fn memory_assert(ctx: &mut ExecutionContext<'_>, memory: NodeId, pairs: Vec<Pair>) -> Result<()> {
    if pairs.is_empty() {
        return Ok(());
    }
    let mut created = Vec::with_capacity(pairs.len());
    for (parent, fact) in pairs {
        if ctx.memory.beta_memory(memory).is_some_and(|m| m.find(parent, fact).is_some()) {
            continue;
        }
        let child = ctx.memory.create_tuple(parent, fact)?;
        created.push((child, parent, fact));
    }
    let tuples: Vec<TupleId> = created.iter().map(|(child, _, _)| *child).collect();
    trace!(memory = %memory, tuples = tuples.len(), "Beta memory assert");

    let network = ctx.network;
    for sink in sinks(network, memory) {
        left_assert(ctx, *sink, &tuples)?;
    }
    let beta = ctx.memory.beta_memory_mut(memory);
    for (child, parent, fact) in created {
        beta.add(child, parent, fact);
    }
    Ok(())
}

/// Update the child tuples of known pairs; pairs without a child are asserted first
pub(crate) fn memory_update(ctx: &mut ExecutionContext<'_>, memory: NodeId, pairs: Vec<Pair>) -> Result<()> {
    if pairs.is_empty() {
        return Ok(());
    }
    let mut known = Vec::with_capacity(pairs.len());
    let mut unknown = Vec::new();
    for (parent, fact) in pairs {
        match ctx.memory.beta_memory(memory).and_then(|m| m.find(parent, fact)) {
            Some(child) => known.push(child),
            None => unknown.push((parent, fact)),
        }
    }
    memory_assert(ctx, memory, unknown)?;
    if known.is_empty() {
        return Ok(());
    }
    trace!(memory = %memory, tuples = known.len(), "Beta memory update");

    let network = ctx.network;
    for sink in sinks(network, memory) {
        left_update(ctx, *sink, &known)?;
    }
    Ok(())
}

/// Remove the child tuples of known pairs, retract them from the sinks in reverse order and
/// free them. Unknown pairs are ignored.
pub(crate) fn memory_retract(ctx: &mut ExecutionContext<'_>, memory: NodeId, pairs: Vec<Pair>) -> Result<()> {
    if pairs.is_empty() {
        return Ok(());
    }
    let mut removed = Vec::with_capacity(pairs.len());
    {
        let beta = ctx.memory.beta_memory_mut(memory);
        for (parent, fact) in pairs {
            if let Some(child) = beta.find(parent, fact) {
                beta.remove(child, Some(parent), fact);
                removed.push(child);
            }
        }
    }
    if removed.is_empty() {
        return Ok(());
    }
    trace!(memory = %memory, tuples = removed.len(), "Beta memory retract");

    let network = ctx.network;
    for sink in sinks(network, memory).iter().rev() {
        left_retract(ctx, *sink, &removed)?;
    }
    for child in removed {
        ctx.memory.remove_tuple(child);
    }
    Ok(())
}

fn sinks(network: &ReteNetwork, memory: NodeId) -> &[NodeId] {
    match &network.node(memory).kind {
        NodeKind::BetaMemory { sinks, .. } | NodeKind::Dummy { sinks } => sinks,
        _ => &[],
    }
}

// ============================================================================
// JOIN HELPERS
// ============================================================================

/// Right facts to consider for each left tuple
pub(crate) fn candidates(
    ctx: &ExecutionContext<'_>,
    left: NodeId,
    right: NodeId,
    is_subnet: bool,
    tuples: &[TupleId],
) -> Vec<(TupleId, Vec<FactId>)> {
    let facts = ctx.memory.alpha_facts(right);
    if !is_subnet {
        return tuples.iter().map(|t| (*t, facts.clone())).collect();
    }
    let level = ctx.network.level_of(left);
    let mut groups: AHashMap<TupleId, Vec<FactId>> = AHashMap::new();
    for fact in facts {
        if let Some(group) = group_of(ctx.memory, fact, level) {
            groups.entry(group).or_default().push(fact);
        }
    }
    tuples.iter().map(|t| (*t, groups.get(t).cloned().unwrap_or_default())).collect()
}

/// Left tuples affected by a batch of right facts, with the facts relevant to each
pub(crate) fn affected(
    ctx: &ExecutionContext<'_>,
    left: NodeId,
    is_subnet: bool,
    facts: &[FactId],
) -> Vec<(TupleId, Vec<FactId>)> {
    if !is_subnet {
        return ctx.memory.beta_tuples(left).into_iter().map(|t| (t, facts.to_vec())).collect();
    }
    let level = ctx.network.level_of(left);
    let mut groups: BTreeMap<TupleId, Vec<FactId>> = BTreeMap::new();
    for &fact in facts {
        if let Some(group) = group_of(ctx.memory, fact, level) {
            groups.entry(group).or_default().push(fact);
        }
    }
    let left_memory = ctx.memory.beta_memory(left);
    groups.into_iter().filter(|(tuple, _)| left_memory.is_some_and(|m| m.contains(*tuple))).collect()
}

/// Left tuple a wrapper fact belongs to
fn group_of(memory: &WorkingMemory, fact: FactId, level: usize) -> Option<TupleId> {
    let wrapped = memory.fact(fact)?.wrapped_tuple()?;
    memory.ancestor_at(wrapped, level)
}

fn join_matches(
    ctx: &ExecutionContext<'_>,
    node: NodeId,
    conditions: &[JoinCondition],
    tuple: TupleId,
    fact: FactId,
) -> Result<bool> {
    for condition in conditions {
        let passed = match condition {
            JoinCondition::Expression(expression) => {
                ctx.test(expression, ExpressionKind::Join, node, Some(tuple), Some(fact))?
            }
            JoinCondition::SameFact { position } => {
                let left = ctx.memory.tuple_facts(tuple).get(*position).and_then(|f| ctx.memory.resolve(*f));
                left.is_some() && left == ctx.memory.resolve(fact)
            }
        };
        if !passed {
            return Ok(false);
        }
    }
    Ok(true)
}

fn quantifier_holds(negated: bool, count: usize) -> bool {
    if negated { count == 0 } else { count > 0 }
}

// ============================================================================
// ADAPTER
// ============================================================================

fn adapter_assert(ctx: &mut ExecutionContext<'_>, node: NodeId, sinks: &[NodeId], tuples: &[TupleId]) -> Result<()> {
    let mut wrappers = Vec::with_capacity(tuples.len());
    for &tuple in tuples {
        let fact_type = ctx
            .memory
            .youngest_fact(tuple)
            .and_then(|f| ctx.memory.resolve(f))
            .and_then(|f| ctx.memory.fact(f))
            .map(|f| f.fact_type.clone())
            .unwrap_or_else(|| FactType::new(EMPTY_TUPLE_TYPE));
        let wrapper = ctx.memory.insert_with(|id| Fact::wrapper(id, fact_type, tuple));
        ctx.memory.set_state(node, tuple, NodeState::WrapperFact(wrapper));
        wrappers.push(wrapper);
    }
    for sink in sinks {
        right_assert(ctx, *sink, &wrappers)?;
    }
    ctx.memory.alpha_memory_mut(node).add(&wrappers);
    Ok(())
}

fn adapter_retract(ctx: &mut ExecutionContext<'_>, node: NodeId, sinks: &[NodeId], tuples: &[TupleId]) -> Result<()> {
    let wrappers = wrappers_of(ctx.memory, node, tuples);
    for sink in sinks {
        right_retract(ctx, *sink, &wrappers)?;
    }
    ctx.memory.alpha_memory_mut(node).remove(&wrappers);
    for &tuple in tuples {
        if let Some(NodeState::WrapperFact(wrapper)) = ctx.memory.remove_state(node, tuple) {
            ctx.memory.remove_fact(wrapper);
        }
    }
    Ok(())
}

fn wrappers_of(memory: &WorkingMemory, node: NodeId, tuples: &[TupleId]) -> Vec<FactId> {
    tuples
        .iter()
        .filter_map(|t| match memory.state(node, *t) {
            Some(NodeState::WrapperFact(wrapper)) => Some(*wrapper),
            _ => None,
        })
        .collect()
}

// ============================================================================
// TERMINAL
// ============================================================================

fn notify_terminal(
    ctx: &mut ExecutionContext<'_>,
    rule: &str,
    fact_map: &[Option<usize>],
    declarations: &Arc<Vec<Declaration>>,
    tuples: &[TupleId],
    change: Change,
) {
    for &tuple in tuples {
        let mut facts = vec![None; declarations.len()];
        for (position, fact) in ctx.memory.tuple_facts(tuple).into_iter().enumerate() {
            if let Some(slot) = fact_map.get(position).copied().flatten() {
                facts[slot] = ctx.memory.resolve(fact);
            }
        }
        let activation = Activation::new(rule, tuple, facts, Arc::clone(declarations));
        trace!(rule = %rule, tuple = %tuple, ?change, "Terminal notified");
        match change {
            Change::Assert => ctx.sink.on_assert(activation),
            Change::Update => ctx.sink.on_update(activation),
            Change::Retract => ctx.sink.on_retract(activation),
        }
    }
}
