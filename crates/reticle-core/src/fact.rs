//! Facts held by working memory
//!
//! A fact pairs a runtime [`FactType`] with a [`FactValue`] payload under a stable
//! [`FactId`]. The payload is replaced in place on update, the id never changes.
//!
//! Besides ordinary facts inserted by the caller there are two kinds the network creates for
//! itself: synthetic facts carrying binding and aggregation results, and wrapper facts that
//! lift a partial match out of a subnetwork so it can be joined like an ordinary fact.
//! Wrapper facts own no value; they delegate to the youngest non-null fact of the wrapped
//! tuple (see [`crate::working_memory::WorkingMemory::value_of`]).

use crate::tuple::TupleId;
use reticle_types::{FactType, FactValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique, strictly increasing fact identifier within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactId(pub u64);

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Where a fact came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactSource {
    /// Inserted directly by the caller
    None,
    /// Inserted by a rule action for the given activation tuple
    Linked { rule: String, tuple: TupleId },
    /// Produced by an aggregation over the given facts
    Aggregate { facts: Vec<FactId> },
}

/// Structural role of a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKind {
    /// Caller-visible fact
    Ordinary,
    /// Binding or aggregation result owned by a beta node
    Synthetic,
    /// Stand-in for a subnetwork tuple, owned by an adapter node
    Wrapper { tuple: TupleId },
}

#[derive(Debug, Clone)]
pub struct Fact {
    pub id: FactId,
    pub fact_type: FactType,
    pub value: FactValue,
    pub source: FactSource,
    pub kind: FactKind,
}

impl Fact {
    pub fn new(id: FactId, fact_type: FactType, value: FactValue) -> Self {
        Self { id, fact_type, value, source: FactSource::None, kind: FactKind::Ordinary }
    }

    pub(crate) fn synthetic(
        id: FactId,
        fact_type: FactType,
        value: FactValue,
        source: FactSource,
    ) -> Self {
        Self { id, fact_type, value, source, kind: FactKind::Synthetic }
    }

    pub(crate) fn wrapper(id: FactId, fact_type: FactType, tuple: TupleId) -> Self {
        Self { id, fact_type, value: FactValue::Null, source: FactSource::None, kind: FactKind::Wrapper { tuple } }
    }

    #[must_use]
    pub fn with_source(mut self, source: FactSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_ordinary(&self) -> bool {
        self.kind == FactKind::Ordinary
    }

    /// The tuple this fact stands in for, if it is a wrapper
    pub fn wrapped_tuple(&self) -> Option<TupleId> {
        match self.kind {
            FactKind::Wrapper { tuple } => Some(tuple),
            _ => None,
        }
    }
}
