//! Alpha network propagation
//!
//! Single-fact filtering: the root forwards every batch to its type nodes, type nodes keep the
//! facts whose runtime type is assignable to theirs, selection nodes keep the facts passing
//! their condition and alpha memories hand the survivors to the beta network as right
//! activations.
//!
//! An update is where the alpha network has to be careful. A fact that stops passing a
//! selection is sent down as a retract, so it leaves every dependent memory instead of being
//! updated into it; alpha memories turn updates of facts they never held into asserts.

use crate::beta_network;
use crate::error::{ExpressionKind, Result};
use crate::fact::FactId;
use crate::rete_network::{ExecutionContext, NodeId, NodeKind};
use reticle_types::FactType;
use tracing::trace;

pub(crate) fn assert(ctx: &mut ExecutionContext<'_>, node: NodeId, facts: &[FactId]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Root { children } => {
            for child in children {
                assert(ctx, *child, facts)?;
            }
        }
        NodeKind::Type { fact_type, children, memory } => {
            let matching = of_type(ctx, fact_type, facts);
            forward_assert(ctx, children, *memory, &matching)?;
        }
        NodeKind::Selection { condition, children, memory } => {
            let mut passing = Vec::with_capacity(facts.len());
            for &fact in facts {
                if ctx.test(condition, ExpressionKind::Selection, node, None, Some(fact))? {
                    passing.push(fact);
                }
            }
            forward_assert(ctx, children, *memory, &passing)?;
        }
        NodeKind::AlphaMemory { sinks } => {
            trace!(node = %node, facts = facts.len(), "Alpha memory assert");
            for sink in sinks {
                beta_network::right_assert(ctx, *sink, facts)?;
            }
            ctx.memory.alpha_memory_mut(node).add(facts);
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn update(ctx: &mut ExecutionContext<'_>, node: NodeId, facts: &[FactId]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Root { children } => {
            for child in children {
                update(ctx, *child, facts)?;
            }
        }
        NodeKind::Type { fact_type, children, memory } => {
            let matching = of_type(ctx, fact_type, facts);
            forward_update(ctx, children, *memory, &matching)?;
        }
        NodeKind::Selection { condition, children, memory } => {
            let mut passing = Vec::with_capacity(facts.len());
            let mut failing = Vec::new();
            for &fact in facts {
                if ctx.test(condition, ExpressionKind::Selection, node, None, Some(fact))? {
                    passing.push(fact);
                } else {
                    failing.push(fact);
                }
            }
            forward_retract(ctx, children, *memory, &failing)?;
            forward_update(ctx, children, *memory, &passing)?;
        }
        NodeKind::AlphaMemory { sinks } => {
            let (members, newcomers): (Vec<FactId>, Vec<FactId>) = {
                let memory = ctx.memory.alpha_memory(node);
                facts.iter().copied().partition(|f| memory.is_some_and(|m| m.contains(*f)))
            };
            trace!(node = %node, updated = members.len(), entered = newcomers.len(), "Alpha memory update");
            if !members.is_empty() {
                for sink in sinks {
                    beta_network::right_update(ctx, *sink, &members)?;
                }
            }
            if !newcomers.is_empty() {
                for sink in sinks {
                    beta_network::right_assert(ctx, *sink, &newcomers)?;
                }
                ctx.memory.alpha_memory_mut(node).add(&newcomers);
            }
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn retract(ctx: &mut ExecutionContext<'_>, node: NodeId, facts: &[FactId]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let network = ctx.network;
    match &network.node(node).kind {
        NodeKind::Root { children } => {
            for child in children {
                retract(ctx, *child, facts)?;
            }
        }
        NodeKind::Type { fact_type, children, memory } => {
            let matching = of_type(ctx, fact_type, facts);
            forward_retract(ctx, children, *memory, &matching)?;
        }
        NodeKind::Selection { children, memory, .. } => {
            forward_retract(ctx, children, *memory, facts)?;
        }
        NodeKind::AlphaMemory { sinks } => {
            let members: Vec<FactId> = match ctx.memory.alpha_memory(node) {
                Some(memory) => facts.iter().copied().filter(|f| memory.contains(*f)).collect(),
                None => return Ok(()),
            };
            if members.is_empty() {
                return Ok(());
            }
            trace!(node = %node, facts = members.len(), "Alpha memory retract");
            for sink in sinks {
                beta_network::right_retract(ctx, *sink, &members)?;
            }
            ctx.memory.alpha_memory_mut(node).remove(&members);
        }
        _ => {}
    }
    Ok(())
}

fn of_type(ctx: &ExecutionContext<'_>, fact_type: &FactType, facts: &[FactId]) -> Vec<FactId> {
    facts
        .iter()
        .copied()
        .filter(|f| ctx.memory.fact(*f).is_some_and(|fact| fact_type.is_assignable_from(&fact.fact_type)))
        .collect()
}

fn forward_assert(
    ctx: &mut ExecutionContext<'_>,
    children: &[NodeId],
    memory: Option<NodeId>,
    facts: &[FactId],
) -> Result<()> {
    for child in children.iter().copied().chain(memory) {
        assert(ctx, child, facts)?;
    }
    Ok(())
}

fn forward_update(
    ctx: &mut ExecutionContext<'_>,
    children: &[NodeId],
    memory: Option<NodeId>,
    facts: &[FactId],
) -> Result<()> {
    for child in children.iter().copied().chain(memory) {
        update(ctx, child, facts)?;
    }
    Ok(())
}

fn forward_retract(
    ctx: &mut ExecutionContext<'_>,
    children: &[NodeId],
    memory: Option<NodeId>,
    facts: &[FactId],
) -> Result<()> {
    for child in children.iter().copied().chain(memory) {
        retract(ctx, child, facts)?;
    }
    Ok(())
}
