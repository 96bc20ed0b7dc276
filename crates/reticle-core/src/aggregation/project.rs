//! `project`: one aggregate per fact, computed by the `selector`.
//!
//! A projection whose value changes on modify is reported as the old value `Removed` and a
//! new result `Added`; an unchanged projection is `Modified`.

use super::{
    AggregateExpression, AggregateExpressions, AggregationContext, AggregationResult, Aggregator,
    AggregatorFactory, ResultId, duplicate_add, unknown_fact,
};
use crate::error::Result;
use crate::fact::FactId;
use crate::tuple::TupleId;
use ahash::AHashMap;
use reticle_types::FactValue;
use std::sync::Arc;

const NAME: &str = "project";

pub struct ProjectAggregator {
    selector: AggregateExpression,
    projections: AHashMap<FactId, (ResultId, FactValue)>,
    next_id: ResultId,
}

impl ProjectAggregator {
    pub fn new(expressions: &AggregateExpressions) -> Result<Self> {
        Ok(Self { selector: expressions.require(NAME, "selector")?.clone(), projections: AHashMap::new(), next_id: 0 })
    }

    fn allocate(&mut self) -> ResultId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Aggregator for ProjectAggregator {
    fn add(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::with_capacity(facts.len());
        for &fact in facts {
            if self.projections.contains_key(&fact) {
                return Err(duplicate_add(NAME, fact));
            }
            let value = ctx.evaluate(&self.selector, tuple, fact)?;
            let id = self.allocate();
            self.projections.insert(fact, (id, value.clone()));
            results.push(AggregationResult::added(id, value, vec![fact]));
        }
        Ok(results)
    }

    fn modify(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::with_capacity(facts.len());
        for &fact in facts {
            let (id, old) = self.projections.get(&fact).cloned().ok_or_else(|| unknown_fact(NAME, "modify", fact))?;
            let value = ctx.evaluate(&self.selector, tuple, fact)?;
            if value == old {
                results.push(AggregationResult::modified(id, value, old, vec![fact]));
            } else {
                let new_id = self.allocate();
                self.projections.insert(fact, (new_id, value.clone()));
                results.push(AggregationResult::removed(id, old, vec![fact]));
                results.push(AggregationResult::added(new_id, value, vec![fact]));
            }
        }
        Ok(results)
    }

    fn remove(&mut self, _ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::with_capacity(facts.len());
        for &fact in facts {
            let (id, old) = self.projections.remove(&fact).ok_or_else(|| unknown_fact(NAME, "remove", fact))?;
            results.push(AggregationResult::removed(id, old, vec![fact]));
        }
        Ok(results)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectFactory;

impl AggregatorFactory for ProjectFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(ProjectAggregator::new(expressions)?))
    }
}
