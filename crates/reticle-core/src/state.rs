//! Node-local state kept per `(node, tuple)` in working memory
//!
//! Each beta node that needs memory beyond its output beta memory stores it here, keyed by the
//! node and the left tuple it concerns. Variants are per concern, so lookups never downcast.

use crate::aggregation::{Aggregator, ResultId};
use crate::fact::FactId;
use std::collections::BTreeMap;
use std::fmt;

pub enum NodeState {
    /// Not/Exists: number of right facts matching the tuple
    Quantifier(usize),
    /// Binding: the synthetic fact holding the computed value
    BindingFact(FactId),
    /// Aggregate: the tuple's aggregator and its result facts
    Aggregate(Box<TupleAggregate>),
    /// Adapter: the wrapper fact published for the tuple
    WrapperFact(FactId),
}

impl NodeState {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeState::Quantifier(_) => "quantifier",
            NodeState::BindingFact(_) => "binding_fact",
            NodeState::Aggregate(_) => "aggregate",
            NodeState::WrapperFact(_) => "wrapper_fact",
        }
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Quantifier(count) => write!(f, "Quantifier({count})"),
            NodeState::BindingFact(fact) => write!(f, "BindingFact({fact})"),
            NodeState::Aggregate(aggregate) => write!(f, "Aggregate({:?})", aggregate.results),
            NodeState::WrapperFact(fact) => write!(f, "WrapperFact({fact})"),
        }
    }
}

/// Aggregation state for one left tuple
pub struct TupleAggregate {
    /// `None` while faulted by a suppressed expression failure
    pub aggregator: Option<Box<dyn Aggregator>>,
    /// Synthetic fact per live aggregate result
    pub results: BTreeMap<ResultId, FactId>,
}

impl TupleAggregate {
    pub fn new(aggregator: Box<dyn Aggregator>) -> Self {
        Self { aggregator: Some(aggregator), results: BTreeMap::new() }
    }

    pub fn is_faulted(&self) -> bool {
        self.aggregator.is_none()
    }

    pub fn facts(&self) -> Vec<FactId> {
        self.results.values().copied().collect()
    }
}
