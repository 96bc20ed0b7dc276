//! `lookup`: groups keyed by key identity.
//!
//! Keys are usually records standing for some entity (a customer, a product code). Two key
//! values belong to the same group when the session's identity comparer says they denote the
//! same thing, and the group always reports the latest key value seen for it, so payload
//! carried on the key (a label, a tier) stays current even when no group is created.

use super::group_by::{GroupByAggregator, KeyMode};
use super::{AggregateExpressions, Aggregator, AggregatorFactory};
use crate::error::Result;
use std::sync::Arc;

const NAME: &str = "lookup";

#[derive(Debug, Default, Clone, Copy)]
pub struct LookupFactory;

impl AggregatorFactory for LookupFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(GroupByAggregator::with_mode(NAME, KeyMode::Identity, expressions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationAction::{Added, Modified, Removed};
    use crate::aggregation::test_support::*;
    use crate::identity::IdentityComparer;
    use reticle_types::FactValue;

    fn line(code: &str, label: &str, qty: i64) -> FactValue {
        FactValue::record([
            ("product", FactValue::record([("code", code), ("label", label)])),
            ("qty", FactValue::from(qty)),
        ])
    }

    fn lookup(harness: &Harness) -> Box<dyn Aggregator> {
        let expressions = Arc::new(AggregateExpressions::new(vec![
            harness.field("key", "product"),
            harness.field("element", "qty"),
        ]));
        LookupFactory.create(&expressions).unwrap()
    }

    #[test]
    fn test_key_payload_is_refreshed_on_existing_group() {
        let mut harness = Harness::new();
        harness.identity = IdentityComparer::by_field("code");
        let first = harness.insert(line("P1", "Widget", 2));
        let second = harness.insert(line("P1", "Widget v2", 3));
        let mut aggregator = lookup(&harness);

        let results = aggregator.add(&harness.ctx(), harness.tuple, &[first]).unwrap();
        assert_eq!(actions(&results), vec![Added]);

        let results = aggregator.add(&harness.ctx(), harness.tuple, &[second]).unwrap();
        assert_eq!(actions(&results), vec![Modified]);
        let group = results[0].aggregate.as_group().unwrap();
        assert_eq!(group.key.field_str("label").unwrap(), "Widget v2");
        assert_eq!(group.elements, vec![2.into(), 3.into()]);

        harness.set(first, line("P1", "Widget v3", 5));
        let results = aggregator.modify(&harness.ctx(), harness.tuple, &[first]).unwrap();
        let group = results[0].aggregate.as_group().unwrap();
        assert_eq!(group.key.field_str("label").unwrap(), "Widget v3");
        assert_eq!(group.elements, vec![5.into(), 3.into()]);
    }

    #[test]
    fn test_groups_empty_to_removed() {
        let mut harness = Harness::new();
        harness.identity = IdentityComparer::by_field("code");
        let p1 = harness.insert(line("P1", "Widget", 1));
        let p2 = harness.insert(line("P2", "Gadget", 1));
        let mut aggregator = lookup(&harness);
        aggregator.add(&harness.ctx(), harness.tuple, &[p1, p2]).unwrap();

        let results = aggregator.remove(&harness.ctx(), harness.tuple, &[p2]).unwrap();
        assert_eq!(actions(&results), vec![Removed]);
        assert!(aggregator.modify(&harness.ctx(), harness.tuple, &[p2]).is_err());
    }

    #[test]
    fn test_add_then_remove_removes_every_group() {
        let mut harness = Harness::new();
        harness.identity = IdentityComparer::by_field("code");
        let p1 = harness.insert(line("P1", "Widget", 1));
        let p2 = harness.insert(line("P2", "Gadget", 4));
        let mut aggregator = lookup(&harness);

        let added = aggregator.add(&harness.ctx(), harness.tuple, &[p1, p2]).unwrap();
        assert_eq!(actions(&added), vec![Added, Added]);
        let results = aggregator.remove(&harness.ctx(), harness.tuple, &[p1, p2]).unwrap();
        assert_eq!(actions(&results), vec![Removed, Removed]);
        assert_eq!(results[0].source, vec![p1]);
        assert_eq!(results[1].source, vec![p2]);
    }

    #[test]
    fn test_protocol_violations() {
        let mut harness = Harness::new();
        harness.identity = IdentityComparer::by_field("code");
        let p1 = harness.insert(line("P1", "Widget", 1));
        let mut aggregator = lookup(&harness);

        let err = aggregator.remove(&harness.ctx(), harness.tuple, &[p1]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
        aggregator.add(&harness.ctx(), harness.tuple, &[p1]).unwrap();
        let err = aggregator.add(&harness.ctx(), harness.tuple, &[p1]).unwrap_err();
        assert_eq!(err.category(), "aggregation_protocol");
    }
}
