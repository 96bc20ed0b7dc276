//! Binding beta node
//!
//! Computes a value from the facts of each left tuple and binds it as a synthetic fact, the
//! right fact of the child tuple. The fact is cached per tuple and updated in place when the
//! tuple changes. A suppressed failure means the tuple has no binding: no child is produced,
//! and an existing child is retracted.

use crate::beta_network::{Pair, memory_assert, memory_retract, memory_update};
use crate::error::{ExpressionKind, Result, dispose};
use crate::expression::BoundExpression;
use crate::fact::{Fact, FactId, FactSource};
use crate::rete_network::{ExecutionContext, NodeId, NodeKind, ReteNetwork};
use crate::state::NodeState;
use crate::tuple::TupleId;
use reticle_types::{FactType, FactValue};
use tracing::trace;

pub(crate) struct BindingNode<'n> {
    id: NodeId,
    expression: &'n BoundExpression<FactValue>,
    result_type: &'n FactType,
    memory: NodeId,
}

impl<'n> BindingNode<'n> {
    pub(crate) fn of(network: &'n ReteNetwork, id: NodeId) -> Option<Self> {
        match &network.node(id).kind {
            NodeKind::Binding { expression, result_type, memory, .. } => {
                Some(Self { id, expression, result_type, memory: *memory })
            }
            _ => None,
        }
    }

    pub(crate) fn left_assert(&self, ctx: &mut ExecutionContext<'_>, tuples: &[TupleId]) -> Result<()> {
        let mut bound = Vec::with_capacity(tuples.len());
        for &tuple in tuples {
            if let Some(value) = self.evaluate(ctx, tuple)? {
                let fact = self.create(ctx, tuple, value);
                bound.push((tuple, Some(fact)));
            }
        }
        memory_assert(ctx, self.memory, bound)
    }

    pub(crate) fn left_update(&self, ctx: &mut ExecutionContext<'_>, tuples: &[TupleId]) -> Result<()> {
        let mut to_assert = Vec::new();
        let mut to_update = Vec::new();
        let mut to_retract: Vec<Pair> = Vec::new();
        for &tuple in tuples {
            let cached = match ctx.memory.state(self.id, tuple) {
                Some(NodeState::BindingFact(fact)) => Some(*fact),
                _ => None,
            };
            match (self.evaluate(ctx, tuple)?, cached) {
                (Some(value), Some(fact)) => {
                    ctx.memory.set_value(fact, value)?;
                    to_update.push((tuple, Some(fact)));
                }
                (Some(value), None) => {
                    let fact = self.create(ctx, tuple, value);
                    to_assert.push((tuple, Some(fact)));
                }
                (None, Some(fact)) => {
                    ctx.memory.remove_state(self.id, tuple);
                    to_retract.push((tuple, Some(fact)));
                }
                (None, None) => {}
            }
        }
        trace!(
            node = %self.id,
            asserted = to_assert.len(),
            updated = to_update.len(),
            retracted = to_retract.len(),
            "Binding update"
        );
        self.retract_and_free(ctx, to_retract)?;
        memory_update(ctx, self.memory, to_update)?;
        memory_assert(ctx, self.memory, to_assert)
    }

    pub(crate) fn left_retract(&self, ctx: &mut ExecutionContext<'_>, tuples: &[TupleId]) -> Result<()> {
        let pairs = tuples
            .iter()
            .filter_map(|&tuple| match ctx.memory.remove_state(self.id, tuple) {
                Some(NodeState::BindingFact(fact)) => Some((tuple, Some(fact))),
                _ => None,
            })
            .collect();
        self.retract_and_free(ctx, pairs)
    }

    /// `None` when a failure was suppressed
    fn evaluate(&self, ctx: &ExecutionContext<'_>, tuple: TupleId) -> Result<Option<FactValue>> {
        match self.expression.evaluate(ctx.memory, ExpressionKind::Binding, self.id, Some(tuple), None) {
            Ok(value) => Ok(Some(value)),
            Err(failure) => {
                dispose(ctx.errors, failure)?;
                Ok(None)
            }
        }
    }

    fn create(&self, ctx: &mut ExecutionContext<'_>, tuple: TupleId, value: FactValue) -> FactId {
        let fact_type = self.result_type.clone();
        let fact = ctx.memory.insert_with(|id| Fact::synthetic(id, fact_type, value, FactSource::None));
        ctx.memory.set_state(self.id, tuple, NodeState::BindingFact(fact));
        fact
    }

    fn retract_and_free(&self, ctx: &mut ExecutionContext<'_>, pairs: Vec<Pair>) -> Result<()> {
        let facts: Vec<FactId> = pairs.iter().filter_map(|(_, f)| *f).collect();
        memory_retract(ctx, self.memory, pairs)?;
        for fact in facts {
            ctx.memory.remove_fact(fact);
        }
        Ok(())
    }
}
