//! `group_by`: one aggregate per distinct key.
//!
//! The `key` selector assigns each fact to a group and the optional `element` selector
//! picks what the group stores for it (the fact value by default). `null` is a valid key.
//! Every group is its own result: created groups are `Added`, emptied groups `Removed`,
//! others `Modified`. Results of one call are ordered by when each group was first touched
//! in that call.
//!
//! The same machinery backs `lookup`, which identifies groups by the identity of the key
//! rather than its full value and keeps the most recent key value as the group's key.

use super::{
    AggregateExpression, AggregateExpressions, AggregationContext, AggregationResult, Aggregator,
    AggregatorFactory, ResultId, duplicate_add, unknown_fact,
};
use crate::error::Result;
use crate::fact::FactId;
use crate::tuple::TupleId;
use ahash::{AHashMap, AHashSet};
use reticle_types::{FactValue, Grouping};
use std::collections::BTreeMap;
use std::sync::Arc;

const NAME: &str = "group_by";

/// How groups are told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyMode {
    /// By the full key value
    Value,
    /// By the key's identity token
    Identity,
}

#[derive(Debug)]
struct Group {
    key: FactValue,
    members: Vec<(FactId, FactValue)>,
}

impl Group {
    fn aggregate(&self) -> FactValue {
        Grouping::new(self.key.clone(), self.members.iter().map(|(_, e)| e.clone()).collect()).into()
    }

    fn source(&self) -> Vec<FactId> {
        self.members.iter().map(|(f, _)| *f).collect()
    }
}

/// Groups touched during one call, in first-touched order
#[derive(Default)]
struct Changes {
    order: Vec<ResultId>,
    seen: AHashSet<ResultId>,
    created: AHashSet<ResultId>,
    previous: AHashMap<ResultId, FactValue>,
    /// Members of each touched group before this call
    members: AHashMap<ResultId, Vec<FactId>>,
}

pub struct GroupByAggregator {
    name: &'static str,
    mode: KeyMode,
    key: AggregateExpression,
    element: Option<AggregateExpression>,
    groups: BTreeMap<ResultId, Group>,
    by_identity: AHashMap<FactValue, ResultId>,
    membership: AHashMap<FactId, ResultId>,
    next_id: ResultId,
}

impl GroupByAggregator {
    pub fn new(expressions: &AggregateExpressions) -> Result<Self> {
        Self::with_mode(NAME, KeyMode::Value, expressions)
    }

    pub(crate) fn with_mode(name: &'static str, mode: KeyMode, expressions: &AggregateExpressions) -> Result<Self> {
        Ok(Self {
            name,
            mode,
            key: expressions.require(name, "key")?.clone(),
            element: expressions.get("element").cloned(),
            groups: BTreeMap::new(),
            by_identity: AHashMap::new(),
            membership: AHashMap::new(),
            next_id: 0,
        })
    }

    fn identity(&self, ctx: &AggregationContext<'_>, key: &FactValue) -> FactValue {
        match self.mode {
            KeyMode::Value => key.clone(),
            KeyMode::Identity => ctx.key_identity(key),
        }
    }

    fn touch(&self, changes: &mut Changes, id: ResultId) {
        if changes.seen.insert(id) {
            changes.order.push(id);
            if let Some(group) = self.groups.get(&id) {
                changes.previous.insert(id, group.aggregate());
                changes.members.insert(id, group.source());
            }
        }
    }

    fn evaluate(&self, ctx: &AggregationContext<'_>, tuple: TupleId, fact: FactId) -> Result<(FactValue, FactValue)> {
        let key = ctx.evaluate(&self.key, tuple, fact)?;
        let element = match &self.element {
            Some(selector) => ctx.evaluate(selector, tuple, fact)?,
            None => ctx.value(fact)?.clone(),
        };
        Ok((key, element))
    }

    fn attach(&mut self, ctx: &AggregationContext<'_>, changes: &mut Changes, fact: FactId, key: FactValue, element: FactValue) {
        let identity = self.identity(ctx, &key);
        let id = match self.by_identity.get(&identity) {
            Some(&id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.by_identity.insert(identity, id);
                self.groups.insert(id, Group { key: key.clone(), members: Vec::new() });
                changes.created.insert(id);
                id
            }
        };
        self.touch(changes, id);
        if let Some(group) = self.groups.get_mut(&id) {
            group.key = key;
            group.members.push((fact, element));
        }
        self.membership.insert(fact, id);
    }

    fn detach(&mut self, changes: &mut Changes, fact: FactId, operation: &str) -> Result<ResultId> {
        let id = self.membership.remove(&fact).ok_or_else(|| unknown_fact(self.name, operation, fact))?;
        self.touch(changes, id);
        if let Some(group) = self.groups.get_mut(&id) {
            group.members.retain(|(f, _)| *f != fact);
        }
        Ok(id)
    }

    fn finish(&mut self, ctx: &AggregationContext<'_>, changes: Changes) -> Vec<AggregationResult> {
        let mut results = Vec::with_capacity(changes.order.len());
        for id in changes.order {
            let Some(group) = self.groups.get(&id) else { continue };
            let created = changes.created.contains(&id);
            if group.members.is_empty() {
                let identity = self.identity(ctx, &group.key);
                if !created {
                    if let Some(previous) = changes.previous.get(&id) {
                        let source = changes.members.get(&id).cloned().unwrap_or_default();
                        results.push(AggregationResult::removed(id, previous.clone(), source));
                    }
                }
                self.by_identity.remove(&identity);
                self.groups.remove(&id);
            } else if created {
                results.push(AggregationResult::added(id, group.aggregate(), group.source()));
            } else {
                let previous = changes.previous.get(&id).cloned().unwrap_or(FactValue::Null);
                results.push(AggregationResult::modified(id, group.aggregate(), previous, group.source()));
            }
        }
        results
    }
}

impl Aggregator for GroupByAggregator {
    fn add(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut changes = Changes::default();
        for &fact in facts {
            if self.membership.contains_key(&fact) {
                return Err(duplicate_add(self.name, fact));
            }
            let (key, element) = self.evaluate(ctx, tuple, fact)?;
            self.attach(ctx, &mut changes, fact, key, element);
        }
        Ok(self.finish(ctx, changes))
    }

    fn modify(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut changes = Changes::default();
        for &fact in facts {
            let current = *self.membership.get(&fact).ok_or_else(|| unknown_fact(self.name, "modify", fact))?;
            let (key, element) = self.evaluate(ctx, tuple, fact)?;
            let identity = self.identity(ctx, &key);
            if self.by_identity.get(&identity) == Some(&current) {
                self.touch(&mut changes, current);
                if let Some(group) = self.groups.get_mut(&current) {
                    group.key = key;
                    if let Some(member) = group.members.iter_mut().find(|(f, _)| *f == fact) {
                        member.1 = element;
                    }
                }
            } else {
                self.detach(&mut changes, fact, "modify")?;
                self.attach(ctx, &mut changes, fact, key, element);
            }
        }
        Ok(self.finish(ctx, changes))
    }

    fn remove(&mut self, ctx: &AggregationContext<'_>, _tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>> {
        let mut changes = Changes::default();
        for &fact in facts {
            self.detach(&mut changes, fact, "remove")?;
        }
        Ok(self.finish(ctx, changes))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GroupByFactory;

impl AggregatorFactory for GroupByFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(GroupByAggregator::new(expressions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationAction::{Added, Modified, Removed};
    use crate::aggregation::test_support::*;

    fn grouping(harness: &Harness) -> GroupByAggregator {
        GroupByAggregator::new(&AggregateExpressions::new(vec![harness.field("key", "key")])).unwrap()
    }

    fn keys(results: &[AggregationResult]) -> Vec<FactValue> {
        results.iter().map(|r| r.aggregate.as_group().unwrap().key.clone()).collect()
    }

    #[test]
    fn test_groups_follow_first_encountered_order() {
        let mut harness = Harness::new();
        let facts: Vec<_> = ["B", "A", "B", "C"].iter().map(|k| harness.insert(item(k, 0))).collect();
        let mut aggregator = grouping(&harness);

        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(actions(&results), vec![Added, Added, Added]);
        assert_eq!(keys(&results), vec!["B".into(), "A".into(), "C".into()]);
        assert_eq!(results[0].aggregate.as_group().unwrap().len(), 2);
    }

    #[test]
    fn test_key_change_moves_fact_between_groups() {
        let mut harness = Harness::new();
        let a = harness.insert(item("A", 1));
        let b = harness.insert(item("B", 2));
        let mut aggregator = grouping(&harness);
        aggregator.add(&harness.ctx(), harness.tuple, &[a, b]).unwrap();

        harness.set(a, item("C", 1));
        let results = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap();
        assert_eq!(actions(&results), vec![Removed, Added]);
        assert_eq!(keys(&results), vec!["A".into(), "C".into()]);

        harness.set(a, item("B", 1));
        let results = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap();
        assert_eq!(actions(&results), vec![Removed, Modified]);
        assert_eq!(results[1].source, vec![b, a]);
    }

    #[test]
    fn test_null_is_a_valid_key() {
        let mut harness = Harness::new();
        let fact = harness.insert(FactValue::record([("value", 1)]));
        let mut aggregator = grouping(&harness);
        let results = aggregator.add(&harness.ctx(), harness.tuple, &[fact]).unwrap();
        assert_eq!(keys(&results), vec![FactValue::Null]);
    }

    #[test]
    fn test_add_then_remove_removes_every_group() {
        let mut harness = Harness::new();
        let facts: Vec<_> = ["A", "B", "A"].iter().map(|k| harness.insert(item(k, 0))).collect();
        let mut aggregator = grouping(&harness);
        aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();

        let results = aggregator.remove(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(actions(&results), vec![Removed, Removed]);
        assert!(aggregator.groups.is_empty());

        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts[..1]).unwrap();
        assert_eq!(actions(&results), vec![Added]);
    }

    #[test]
    fn test_element_selector() {
        let mut harness = Harness::new();
        let facts = vec![harness.insert(item("A", 1)), harness.insert(item("A", 2))];
        let expressions =
            AggregateExpressions::new(vec![harness.field("key", "key"), harness.field("element", "value")]);
        let mut aggregator = GroupByAggregator::new(&expressions).unwrap();
        let results = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(results[0].aggregate.as_group().unwrap().elements, vec![1.into(), 2.into()]);
    }

    #[test]
    fn test_requires_key_selector() {
        assert!(GroupByAggregator::new(&AggregateExpressions::default()).is_err());
    }

    #[test]
    fn test_removed_group_carries_its_last_members() {
        let mut harness = Harness::new();
        let facts: Vec<_> = ["A", "B", "A"].iter().map(|k| harness.insert(item(k, 0))).collect();
        let mut aggregator = grouping(&harness);
        let added = aggregator.add(&harness.ctx(), harness.tuple, &facts).unwrap();

        let results = aggregator.remove(&harness.ctx(), harness.tuple, &facts).unwrap();
        assert_eq!(keys(&results), vec!["A".into(), "B".into()]);
        assert_eq!(results[0].id, added[0].id);
        assert_eq!(results[0].source, vec![facts[0], facts[2]]);
        assert_eq!(results[1].source, vec![facts[1]]);
    }

    #[test]
    fn test_protocol_violations() {
        let mut harness = Harness::new();
        let a = harness.insert(item("A", 1));
        let mut aggregator = grouping(&harness);

        let err = aggregator.modify(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
        let err = aggregator.remove(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");

        aggregator.add(&harness.ctx(), harness.tuple, &[a]).unwrap();
        let err = aggregator.add(&harness.ctx(), harness.tuple, &[a]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
    }
}
