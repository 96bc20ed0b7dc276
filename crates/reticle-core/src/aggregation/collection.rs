//! `collect`: every matching fact's value in one array, in insertion order.
//!
//! Members are tracked by fact id, so two facts with equal values are two elements.

use super::{
    AggregateExpressions, AggregationContext, AggregationResult, Aggregator, AggregatorFactory, SingleResult,
    duplicate_add, unknown_fact,
};
use crate::error::Result;
use crate::fact::FactId;
use crate::tuple::TupleId;
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

const NAME: &str = "collect";

#[derive(Debug, Default)]
pub struct CollectionAggregator {
    members: BTreeMap<u64, FactId>,
    positions: AHashMap<FactId, u64>,
    next_position: u64,
    result: SingleResult,
}

impl CollectionAggregator {
    fn emit(&mut self, ctx: &AggregationContext<'_>) -> Result<Vec<AggregationResult>> {
        let source: Vec<FactId> = self.members.values().copied().collect();
        let aggregate = ctx.values(source.iter().copied())?.into();
        Ok(vec![self.result.emit(aggregate, source)])
    }
}

impl Aggregator for CollectionAggregator {
    fn add(&mut self, ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        for &fact in facts {
            if self.positions.contains_key(&fact) {
                return Err(duplicate_add(NAME, fact));
            }
            self.positions.insert(fact, self.next_position);
            self.members.insert(self.next_position, fact);
            self.next_position += 1;
        }
        self.emit(ctx)
    }

    fn modify(&mut self, ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        if let Some(&fact) = facts.iter().find(|f| !self.positions.contains_key(f)) {
            return Err(unknown_fact(NAME, "modify", fact));
        }
        self.emit(ctx)
    }

    fn remove(&mut self, ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        for &fact in facts {
            let position = self.positions.remove(&fact).ok_or_else(|| unknown_fact(NAME, "remove", fact))?;
            self.members.remove(&position);
        }
        self.emit(ctx)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CollectionFactory;

impl AggregatorFactory for CollectionFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, _expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(CollectionAggregator::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationAction;
    use crate::aggregation::test_support::*;
    use reticle_types::FactValue;

    #[test]
    fn test_empty_add_is_still_added() {
        let harness = Harness::new();
        let mut aggregator = CollectionAggregator::default();
        let results = aggregator.add(&harness.ctx(), harness.tuple, &[]).unwrap();
        assert_eq!(actions(&results), vec![AggregationAction::Added]);
        assert_eq!(results[0].aggregate, FactValue::Array(vec![]));
    }

    #[test]
    fn test_equal_values_are_distinct_members() {
        let mut harness = Harness::new();
        let a = harness.insert(item("x", 1));
        let b = harness.insert(item("x", 1));
        let mut aggregator = CollectionAggregator::default();

        aggregator.add(&harness.ctx(), harness.tuple, &[a, b]).unwrap();
        let results = aggregator.remove(&harness.ctx(), harness.tuple, &[a]).unwrap();
        assert_eq!(actions(&results), vec![AggregationAction::Modified]);
        assert_eq!(results[0].aggregate, FactValue::Array(vec![item("x", 1)]));
        assert_eq!(results[0].source, vec![b]);
    }

    #[test]
    fn test_modify_reflects_new_values() {
        let mut harness = Harness::new();
        let a = harness.insert(item("x", 1));
        let mut aggregator = CollectionAggregator::default();
        aggregator.add(&harness.ctx(), harness.tuple, &[a]).unwrap();

        harness.set(a, item("x", 2));
        let results = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap();
        assert_eq!(results[0].aggregate, FactValue::Array(vec![item("x", 2)]));
        assert_eq!(results[0].previous, Some(FactValue::Array(vec![item("x", 1)])));
    }

    #[test]
    fn test_add_then_remove_leaves_empty_collection() {
        let mut harness = Harness::new();
        let facts = [harness.insert(item("a", 1)), harness.insert(item("b", 2))];
        let mut aggregator = CollectionAggregator::default();
        aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        let results = aggregator.remove(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(actions(&results), vec![AggregationAction::Modified]);
        assert_eq!(results[0].aggregate, FactValue::Array(vec![]));
    }

    #[test]
    fn test_protocol_violations() {
        let mut harness = Harness::new();
        let a = harness.insert(item("a", 1));
        let mut aggregator = CollectionAggregator::default();

        let err = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
        assert!(aggregator.remove(&harness.ctx(), harness.tuple, &[a]).is_err());

        aggregator.add(&harness.ctx(), harness.tuple, &[a]).unwrap();
        assert!(aggregator.add(&harness.ctx(), harness.tuple, &[a]).is_err());
    }
}
