//! Aggregate beta node
//!
//! One [`Aggregator`](crate::aggregation::Aggregator) per left tuple, created when the tuple
//! arrives and fed the right facts joined with it. Each aggregate value the aggregator reports
//! becomes a synthetic fact of the element's result type, propagated as the right fact of a
//! child tuple. Results are mapped to facts by result id, so a `Modified` result updates its
//! fact in place and downstream sees an update, never a retract and re-assert.
//!
//! A suppressed expression failure faults the tuple's aggregate: its facts are retracted and
//! right deltas are ignored until the left tuple is updated, which rebuilds the aggregate from
//! the facts joined at that time.

use crate::aggregation::{AggregationAction, AggregationContext, AggregationResult, ResultId};
use crate::beta_network::{Pair, affected, candidates, memory_assert, memory_retract, memory_update};
use crate::error::{ReteError, Result};
use crate::fact::{Fact, FactId, FactSource};
use crate::rete_network::{AggregateSpec, ExecutionContext, NodeId, NodeKind, ReteNetwork};
use crate::state::{NodeState, TupleAggregate};
use crate::tuple::TupleId;
use ahash::AHashSet;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delta {
    Add,
    Modify,
    Remove,
}

/// Run of results with the same action, propagated as one batch
type Batch = (AggregationAction, Vec<FactId>);

pub(crate) struct AggregateNode<'n> {
    id: NodeId,
    left: NodeId,
    right: NodeId,
    is_subnet: bool,
    memory: NodeId,
    spec: &'n AggregateSpec,
}

impl<'n> AggregateNode<'n> {
    pub(crate) fn of(network: &'n ReteNetwork, id: NodeId) -> Option<Self> {
        match &network.node(id).kind {
            NodeKind::Aggregate { left, right, is_subnet, memory, spec } => Some(Self {
                id,
                left: *left,
                right: *right,
                is_subnet: *is_subnet,
                memory: *memory,
                spec,
            }),
            _ => None,
        }
    }

    pub(crate) fn left_assert(&self, ctx: &mut ExecutionContext<'_>, tuples: &[TupleId]) -> Result<()> {
        for (tuple, facts) in candidates(ctx, self.left, self.right, self.is_subnet, tuples) {
            self.start(ctx, tuple, &facts)?;
        }
        Ok(())
    }

    pub(crate) fn left_update(&self, ctx: &mut ExecutionContext<'_>, tuples: &[TupleId]) -> Result<()> {
        for &tuple in tuples {
            let current = match ctx.memory.state(self.id, tuple) {
                Some(NodeState::Aggregate(state)) if !state.is_faulted() => Some(state.facts()),
                _ => None,
            };
            let Some(current) = current else {
                self.rebuild(ctx, tuple)?;
                continue;
            };

            // Joined facts of a subnet arrive as right updates through the adapter
            let touched = if self.is_subnet {
                AHashSet::new()
            } else {
                let joined = candidates(ctx, self.left, self.right, false, &[tuple])
                    .into_iter()
                    .flat_map(|(_, facts)| facts)
                    .collect::<Vec<_>>();
                self.apply(ctx, tuple, Delta::Modify, &joined)?
            };
            let untouched: Vec<Pair> = current
                .into_iter()
                .filter(|f| !touched.contains(f) && ctx.memory.fact(*f).is_some())
                .map(|f| (tuple, Some(f)))
                .collect();
            memory_update(ctx, self.memory, untouched)?;
        }
        Ok(())
    }

    pub(crate) fn left_retract(&self, ctx: &mut ExecutionContext<'_>, tuples: &[TupleId]) -> Result<()> {
        let mut pairs = Vec::new();
        for &tuple in tuples {
            if let Some(NodeState::Aggregate(state)) = ctx.memory.remove_state(self.id, tuple) {
                pairs.extend(state.facts().into_iter().map(|f| (tuple, Some(f))));
            }
        }
        self.retract_and_free(ctx, pairs)
    }

    pub(crate) fn right_assert(&self, ctx: &mut ExecutionContext<'_>, facts: &[FactId]) -> Result<()> {
        self.right(ctx, Delta::Add, facts)
    }

    pub(crate) fn right_update(&self, ctx: &mut ExecutionContext<'_>, facts: &[FactId]) -> Result<()> {
        self.right(ctx, Delta::Modify, facts)
    }

    pub(crate) fn right_retract(&self, ctx: &mut ExecutionContext<'_>, facts: &[FactId]) -> Result<()> {
        self.right(ctx, Delta::Remove, facts)
    }

    fn right(&self, ctx: &mut ExecutionContext<'_>, delta: Delta, facts: &[FactId]) -> Result<()> {
        for (tuple, group) in affected(ctx, self.left, self.is_subnet, facts) {
            self.apply(ctx, tuple, delta, &group)?;
        }
        Ok(())
    }

    /// Create the tuple's aggregator and add the joined facts
    fn start(&self, ctx: &mut ExecutionContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<()> {
        let aggregator = self.spec.factory.create(&self.spec.expressions)?;
        let state = TupleAggregate::new(aggregator);
        ctx.memory.set_state(self.id, tuple, NodeState::Aggregate(Box::new(state)));
        self.apply(ctx, tuple, Delta::Add, facts)?;
        Ok(())
    }

    fn rebuild(&self, ctx: &mut ExecutionContext<'_>, tuple: TupleId) -> Result<()> {
        debug!(node = %self.id, tuple = %tuple, aggregator = %self.spec.aggregator, "Rebuilding aggregate");
        if let Some(NodeState::Aggregate(state)) = ctx.memory.remove_state(self.id, tuple) {
            let pairs = state.facts().into_iter().map(|f| (tuple, Some(f))).collect();
            self.retract_and_free(ctx, pairs)?;
        }
        let facts = candidates(ctx, self.left, self.right, self.is_subnet, &[tuple])
            .into_iter()
            .flat_map(|(_, facts)| facts)
            .collect::<Vec<_>>();
        self.start(ctx, tuple, &facts)
    }

    /// Feed one delta to the tuple's aggregator and propagate its results.
    ///
    /// Returns the aggregate facts that were propagated.
    fn apply(
        &self,
        ctx: &mut ExecutionContext<'_>,
        tuple: TupleId,
        delta: Delta,
        facts: &[FactId],
    ) -> Result<AHashSet<FactId>> {
        let Some(NodeState::Aggregate(mut state)) = ctx.memory.remove_state(self.id, tuple) else {
            return Ok(AHashSet::new());
        };
        if state.is_faulted() {
            trace!(node = %self.id, tuple = %tuple, ?delta, "Ignoring delta for faulted aggregate");
            ctx.memory.set_state(self.id, tuple, NodeState::Aggregate(state));
            return Ok(AHashSet::new());
        }
        let Some(aggregator) = state.aggregator.as_mut() else {
            return Ok(AHashSet::new());
        };

        let (outcome, suppressed) = {
            let actx = AggregationContext::new(ctx.memory, ctx.errors, ctx.identity, self.id);
            let outcome = match delta {
                Delta::Add => aggregator.add(&actx, tuple, facts),
                Delta::Modify => aggregator.modify(&actx, tuple, facts),
                Delta::Remove => aggregator.remove(&actx, tuple, facts),
            };
            (outcome, actx.was_suppressed())
        };

        match outcome {
            Ok(results) => {
                let batches = self.record(ctx, &mut state, results);
                ctx.memory.set_state(self.id, tuple, NodeState::Aggregate(state));
                self.propagate(ctx, tuple, batches?)
            }
            Err(_) if suppressed => {
                self.fault(ctx, tuple, state)?;
                Ok(AHashSet::new())
            }
            Err(error) => {
                ctx.memory.set_state(self.id, tuple, NodeState::Aggregate(state));
                Err(error)
            }
        }
    }

    /// Apply results to the tuple's aggregate facts, grouped into runs of equal action
    fn record(
        &self,
        ctx: &mut ExecutionContext<'_>,
        state: &mut TupleAggregate,
        results: Vec<AggregationResult>,
    ) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = Vec::new();
        for result in results {
            let action = result.action;
            let fact = match action {
                AggregationAction::None => continue,
                AggregationAction::Added => {
                    if state.results.contains_key(&result.id) {
                        return Err(self.protocol(result.id, "was added twice"));
                    }
                    let fact_type = self.spec.result_type.clone();
                    let source = FactSource::Aggregate { facts: result.source };
                    let fact = ctx.memory.insert_with(|id| Fact::synthetic(id, fact_type, result.aggregate, source));
                    state.results.insert(result.id, fact);
                    fact
                }
                AggregationAction::Modified => {
                    let fact = *state.results.get(&result.id).ok_or_else(|| self.protocol(result.id, "was never added"))?;
                    if let Some(existing) = ctx.memory.fact_mut(fact) {
                        existing.value = result.aggregate;
                        existing.source = FactSource::Aggregate { facts: result.source };
                    }
                    fact
                }
                AggregationAction::Removed => {
                    state.results.remove(&result.id).ok_or_else(|| self.protocol(result.id, "was never added"))?
                }
            };
            match batches.last_mut() {
                Some((last, facts)) if *last == action => facts.push(fact),
                _ => batches.push((action, vec![fact])),
            }
        }
        Ok(batches)
    }

    fn propagate(&self, ctx: &mut ExecutionContext<'_>, tuple: TupleId, batches: Vec<Batch>) -> Result<AHashSet<FactId>> {
        let mut touched = AHashSet::new();
        for (action, facts) in batches {
            touched.extend(facts.iter().copied());
            let pairs = facts.iter().map(|f| (tuple, Some(*f))).collect();
            match action {
                AggregationAction::Added => memory_assert(ctx, self.memory, pairs)?,
                AggregationAction::Modified => memory_update(ctx, self.memory, pairs)?,
                AggregationAction::Removed => {
                    memory_retract(ctx, self.memory, pairs)?;
                    for fact in facts {
                        ctx.memory.remove_fact(fact);
                    }
                }
                AggregationAction::None => {}
            }
        }
        Ok(touched)
    }

    fn fault(&self, ctx: &mut ExecutionContext<'_>, tuple: TupleId, mut state: Box<TupleAggregate>) -> Result<()> {
        debug!(node = %self.id, tuple = %tuple, aggregator = %self.spec.aggregator, "Aggregate faulted");
        let pairs = state.facts().into_iter().map(|f| (tuple, Some(f))).collect();
        state.results.clear();
        state.aggregator = None;
        ctx.memory.set_state(self.id, tuple, NodeState::Aggregate(state));
        self.retract_and_free(ctx, pairs)
    }

    fn retract_and_free(&self, ctx: &mut ExecutionContext<'_>, pairs: Vec<Pair>) -> Result<()> {
        let facts: Vec<FactId> = pairs.iter().filter_map(|(_, f)| *f).collect();
        memory_retract(ctx, self.memory, pairs)?;
        for fact in facts {
            ctx.memory.remove_fact(fact);
        }
        Ok(())
    }

    fn protocol(&self, id: ResultId, problem: &str) -> ReteError {
        ReteError::protocol(&self.spec.aggregator, format!("result {id} {problem}"), None)
    }
}
