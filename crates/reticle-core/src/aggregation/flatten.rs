//! `flatten`: the `selector` expands each fact into zero or more elements, each its own
//! aggregate.
//!
//! Arrays expand element-wise, `null` expands to nothing and any other value to itself. On
//! modify the old and new expansions are diffed by value: dropped elements are `Removed`,
//! kept elements `Modified` and new elements `Added`, in that order.

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

const NAME: &str = "flatten";

pub struct FlattenAggregator {
    selector: AggregateExpression,
    expansions: AHashMap<FactId, Vec<(ResultId, FactValue)>>,
    next_id: ResultId,
}

fn expand(value: FactValue) -> Vec<FactValue> {
    match value {
        FactValue::Array(items) => items,
        FactValue::Null => Vec::new(),
        other => vec![other],
    }
}

impl FlattenAggregator {
    pub fn new(expressions: &AggregateExpressions) -> Result<Self> {
        Ok(Self { selector: expressions.require(NAME, "selector")?.clone(), expansions: AHashMap::new(), next_id: 0 })
    }

    fn allocate(&mut self) -> ResultId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Aggregator for FlattenAggregator {
    fn add(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::new();
        for &fact in facts {
            if self.expansions.contains_key(&fact) {
                return Err(duplicate_add(NAME, fact));
            }
            let mut elements = Vec::new();
            for element in expand(ctx.evaluate(&self.selector, tuple, fact)?) {
                let id = self.allocate();
                results.push(AggregationResult::added(id, element.clone(), vec![fact]));
                elements.push((id, element));
            }
            self.expansions.insert(fact, elements);
        }
        Ok(results)
    }

    fn modify(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::new();
        for &fact in facts {
            if !self.expansions.contains_key(&fact) {
                return Err(unknown_fact(NAME, "modify", fact));
            }
            let mut incoming: Vec<Option<FactValue>> =
                expand(ctx.evaluate(&self.selector, tuple, fact)?).into_iter().map(Some).collect();
            let old = self.expansions.remove(&fact).unwrap_or_default();

            let mut kept = Vec::new();
            let mut modified = Vec::new();
            for (id, value) in old {
                match incoming.iter_mut().find(|v| v.as_ref() == Some(&value)) {
                    Some(slot) => {
                        slot.take();
                        modified.push(AggregationResult::modified(id, value.clone(), value.clone(), vec![fact]));
                        kept.push((id, value));
                    }
                    None => results.push(AggregationResult::removed(id, value, vec![fact])),
                }
            }
            results.extend(modified);
            for value in incoming.into_iter().flatten() {
                let id = self.allocate();
                results.push(AggregationResult::added(id, value.clone(), vec![fact]));
                kept.push((id, value));
            }
            self.expansions.insert(fact, kept);
        }
        Ok(results)
    }

    fn remove(&mut self, _ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::new();
        for &fact in facts {
            let elements = self.expansions.remove(&fact).ok_or_else(|| unknown_fact(NAME, "remove", fact))?;
            for (id, value) in elements {
                results.push(AggregationResult::removed(id, value, vec![fact]));
            }
        }
        Ok(results)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlattenFactory;

impl AggregatorFactory for FlattenFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(FlattenAggregator::new(expressions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationAction::{Added, Modified, Removed};
    use crate::aggregation::test_support::*;

    fn order(lines: &[&str]) -> FactValue {
        FactValue::record([("lines", FactValue::Array(lines.iter().map(|l| FactValue::from(*l)).collect()))])
    }

    #[test]
    fn test_modify_diffs_expansions() {
        let mut harness = Harness::new();
        let fact = harness.insert(order(&["a", "b", "c"]));
        let expressions = AggregateExpressions::new(vec![harness.field("selector", "lines")]);
        let mut aggregator = FlattenAggregator::new(&expressions).unwrap();

        let results = aggregator.add(&harness.ctx(), harness.tuple, &[fact]).unwrap();
        assert_eq!(actions(&results), vec![Added, Added, Added]);
        let b_id = results[1].id;

        harness.set(fact, order(&["b", "d"]));
        let results = aggregator.modify(&harness.ctx(), harness.tuple, &[fact]).unwrap();
        assert_eq!(actions(&results), vec![Removed, Removed, Modified, Added]);
        assert_eq!(results[2].id, b_id);
        assert_eq!(results[3].aggregate, FactValue::from("d"));

        let results = aggregator.remove(&harness.ctx(), harness.tuple, &[fact]).unwrap();
        assert_eq!(actions(&results), vec![Removed, Removed]);
    }

    #[test]
    fn test_null_expands_to_nothing() {
        let mut harness = Harness::new();
        let fact = harness.insert(FactValue::record([("other", 1)]));
        let expressions = AggregateExpressions::new(vec![harness.field("selector", "lines")]);
        let mut aggregator = FlattenAggregator::new(&expressions).unwrap();
        assert!(aggregator.add(&harness.ctx(), harness.tuple, &[fact]).unwrap().is_empty());
        assert!(aggregator.remove(&harness.ctx(), harness.tuple, &[fact]).unwrap().is_empty());
    }

    #[test]
    fn test_add_then_remove_removes_every_element() {
        let mut harness = Harness::new();
        let facts = [harness.insert(order(&["a", "b"])), harness.insert(order(&["c"]))];
        let expressions = AggregateExpressions::new(vec![harness.field("selector", "lines")]);
        let mut aggregator = FlattenAggregator::new(&expressions).unwrap();

        let added = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        let results = aggregator.remove(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(actions(&results), vec![Removed, Removed, Removed]);
        let mut added_ids: Vec<_> = added.iter().map(|r| r.id).collect();
        let mut removed_ids: Vec<_> = results.iter().map(|r| r.id).collect();
        added_ids.sort_unstable();
        removed_ids.sort_unstable();
        assert_eq!(removed_ids, added_ids);
    }

    #[test]
    fn test_protocol_violations() {
        let mut harness = Harness::new();
        let fact = harness.insert(order(&["a"]));
        let expressions = AggregateExpressions::new(vec![harness.field("selector", "lines")]);
        let mut aggregator = FlattenAggregator::new(&expressions).unwrap();

        let err = aggregator.modify(&harness.ctx(), harness.tuple, &[fact]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
        let err = aggregator.remove(&harness.ctx(), harness.tuple, &[fact]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");

        aggregator.add(&harness.ctx(), harness.tuple, &[fact]).unwrap();
        let err = aggregator.add(&harness.ctx(), harness.tuple, &[fact]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
    }
}
