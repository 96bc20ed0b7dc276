//! `sort`: matching facts ordered by one or more keys.
//!
//! Each selector is named `asc` or `desc` and contributes one key component, compared in
//! declaration order until one differs. Facts with equal keys keep insertion order. A
//! modified fact is removed under its old key and re-inserted under its new one.

use super::{
    AggregateExpression, AggregateExpressions, AggregationContext, AggregationResult, Aggregator,
    AggregatorFactory, SingleResult, duplicate_add, unknown_fact,
};
use crate::error::{ReteError, Result};
use crate::fact::FactId;
use crate::tuple::TupleId;
use ahash::AHashMap;
use reticle_types::FactValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

const NAME: &str = "sort";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Parse a selector name
    pub fn from_selector(name: &str) -> Option<Self> {
        match name {
            "asc" | "key" => Some(SortDirection::Ascending),
            "desc" => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SortKey {
    values: Vec<FactValue>,
    directions: Arc<[SortDirection]>,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((left, right), direction) in self.values.iter().zip(&other.values).zip(self.directions.iter()) {
            let ordering = match direction {
                SortDirection::Ascending => left.total_cmp(right),
                SortDirection::Descending => right.total_cmp(left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

pub struct SortedAggregator {
    selectors: Vec<AggregateExpression>,
    directions: Arc<[SortDirection]>,
    sorted: BTreeMap<SortKey, Vec<FactId>>,
    keys: AHashMap<FactId, SortKey>,
    result: SingleResult,
}

impl SortedAggregator {
    pub fn new(expressions: &AggregateExpressions) -> Result<Self> {
        let mut selectors = Vec::new();
        let mut directions = Vec::new();
        for expression in expressions.iter() {
            let direction = SortDirection::from_selector(&expression.name).ok_or_else(|| {
                ReteError::configuration(format!(
                    "aggregator '{NAME}' accepts 'asc' and 'desc' selectors, got '{}'",
                    expression.name
                ))
            })?;
            selectors.push(expression.clone());
            directions.push(direction);
        }
        if selectors.is_empty() {
            return Err(ReteError::configuration(format!("aggregator '{NAME}' needs at least one key")));
        }
        Ok(Self {
            selectors,
            directions: directions.into(),
            sorted: BTreeMap::new(),
            keys: AHashMap::new(),
            result: SingleResult::default(),
        })
    }

    fn key(&self, ctx: &AggregationContext<'_>, tuple: TupleId, fact: FactId) -> Result<SortKey> {
        let values = self
            .selectors
            .iter()
            .map(|selector| ctx.evaluate(selector, tuple, fact))
            .collect::<Result<Vec<_>>>()?;
        Ok(SortKey { values, directions: Arc::clone(&self.directions) })
    }

    fn insert(&mut self, key: SortKey, fact: FactId) {
        self.sorted.entry(key.clone()).or_default().push(fact);
        self.keys.insert(fact, key);
    }

    fn detach(&mut self, fact: FactId, operation: &str) -> Result<()> {
        let key = self.keys.remove(&fact).ok_or_else(|| unknown_fact(NAME, operation, fact))?;
        if let Some(bucket) = self.sorted.get_mut(&key) {
            bucket.retain(|f| *f != fact);
            if bucket.is_empty() {
                self.sorted.remove(&key);
            }
        }
        Ok(())
    }

    fn emit(&mut self, ctx: &AggregationContext<'_>) -> Result<Vec<AggregationResult>> {
        let source: Vec<FactId> = self.sorted.values().flatten().copied().collect();
        let aggregate = ctx.values(source.iter().copied())?.into();
        Ok(vec![self.result.emit(aggregate, source)])
    }
}

impl Aggregator for SortedAggregator {
    fn add(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        for &fact in facts {
            if self.keys.contains_key(&fact) {
                return Err(duplicate_add(NAME, fact));
            }
            let key = self.key(ctx, tuple, fact)?;
            self.insert(key, fact);
        }
        self.emit(ctx)
    }

    fn modify(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        for &fact in facts {
            self.detach(fact, "modify")?;
            let key = self.key(ctx, tuple, fact)?;
            self.insert(key, fact);
        }
        self.emit(ctx)
    }

    fn remove(&mut self, ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        for &fact in facts {
            self.detach(fact, "remove")?;
        }
        self.emit(ctx)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SortedFactory;

impl AggregatorFactory for SortedFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(SortedAggregator::new(expressions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::test_support::*;
    use crate::aggregation::AggregationAction;

    fn sorted_values(results: &[AggregationResult]) -> Vec<i64> {
        results[0]
            .aggregate
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.field_i64("value").unwrap())
            .collect()
    }

    #[test]
    fn test_ascending_and_descending_single_key() {
        let mut harness = Harness::new();
        let facts: Vec<_> = [5, 1, 4].iter().map(|v| harness.insert(item("k", *v))).collect();

        let asc = AggregateExpressions::new(vec![harness.field("asc", "value")]);
        let mut aggregator = SortedAggregator::new(&asc).unwrap();
        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(sorted_values(&results), vec![1, 4, 5]);

        let desc = AggregateExpressions::new(vec![harness.field("desc", "value")]);
        let mut aggregator = SortedAggregator::new(&desc).unwrap();
        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(sorted_values(&results), vec![5, 4, 1]);
    }

    #[test]
    fn test_multi_key_with_mixed_directions() {
        let mut harness = Harness::new();
        let facts = vec![
            harness.insert(item("b", 1)),
            harness.insert(item("a", 1)),
            harness.insert(item("a", 3)),
            harness.insert(item("b", 2)),
        ];
        let expressions =
            AggregateExpressions::new(vec![harness.field("asc", "key"), harness.field("desc", "value")]);
        let mut aggregator = SortedAggregator::new(&expressions).unwrap();
        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(results[0].source, vec![facts[2], facts[1], facts[3], facts[0]]);
    }

    #[test]
    fn test_modify_resorts_under_new_key() {
        let mut harness = Harness::new();
        let a = harness.insert(item("a", 1));
        let b = harness.insert(item("b", 2));
        let expressions = AggregateExpressions::new(vec![harness.field("asc", "value")]);
        let mut aggregator = SortedAggregator::new(&expressions).unwrap();
        aggregator.add(&harness.ctx(), harness.tuple, &[a, b]).unwrap();

        harness.set(a, item("a", 10));
        let results = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap();
        assert_eq!(actions(&results), vec![AggregationAction::Modified]);
        assert_eq!(results[0].source, vec![b, a]);
    }

    #[test]
    fn test_equal_keys_keep_insertion_order() {
        let mut harness = Harness::new();
        let facts: Vec<_> = (0..3).map(|_| harness.insert(item("same", 7))).collect();
        let expressions = AggregateExpressions::new(vec![harness.field("asc", "value")]);
        let mut aggregator = SortedAggregator::new(&expressions).unwrap();
        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(results[0].source, facts);

        let results = aggregator.remove(&harness.ctx(), harness.tuple, &facts[1..2]).unwrap();
        assert_eq!(results[0].source, vec![facts[0], facts[2]]);
    }

    #[test]
    fn test_rejects_unknown_selector_names() {
        let harness = Harness::new();
        let expressions = AggregateExpressions::new(vec![harness.field("sideways", "value")]);
        assert!(SortedAggregator::new(&expressions).is_err());
        assert!(SortedAggregator::new(&AggregateExpressions::default()).is_err());
    }

    #[test]
    fn test_add_then_remove_leaves_empty_list() {
        let mut harness = Harness::new();
        let facts: Vec<_> = [3, 1, 2].iter().map(|v| harness.insert(item("k", *v))).collect();
        let expressions = AggregateExpressions::new(vec![harness.field("asc", "value")]);
        let mut aggregator = SortedAggregator::new(&expressions).unwrap();

        let added = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        let results = aggregator.remove(&harness.ctx(), harness.tuple, &added[0].source).unwrap();
        assert_eq!(actions(&results), vec![AggregationAction::Modified]);
        assert_eq!(results[0].aggregate, FactValue::Array(vec![]));
        assert!(results[0].source.is_empty());
    }

    #[test]
    fn test_protocol_violations() {
        let mut harness = Harness::new();
        let a = harness.insert(item("a", 1));
        let expressions = AggregateExpressions::new(vec![harness.field("asc", "value")]);
        let mut aggregator = SortedAggregator::new(&expressions).unwrap();

        let err = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
        let err = aggregator.remove(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");

        aggregator.add(&harness.ctx(), harness.tuple, &[a]).unwrap();
        let err = aggregator.add(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
    }
}
