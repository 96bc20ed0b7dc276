//! Aggregation framework
//!
//! An aggregate node keeps one [`Aggregator`] per left tuple and feeds it the right facts
//! joined with that tuple as deltas (`add`, `modify`, `remove`). The aggregator answers with
//! [`AggregationResult`]s describing which aggregate values appeared, changed or disappeared;
//! the node turns each result into a synthetic fact and propagates it as part of a tuple.
//!
//! ## Contract
//!
//! - Results carry a [`ResultId`] that is stable for the lifetime of the aggregate value it
//!   names. The node maps result ids to facts; it never compares aggregate values.
//! - Single-result kinds (`collect`, `sort`) answer the first `add` with exactly one `Added`,
//!   even for zero facts, and every later call with one `Modified`.
//! - Keyed kinds (`group_by`, `lookup`, `project`, `flatten`) emit one result per affected
//!   key in first-encountered order. A key whose last fact leaves is `Removed`.
//! - `modify` or `remove` of a fact never added, and `add` of a fact already present, are
//!   protocol violations and fail with [`ReteError::AggregationProtocol`].
//!
//! Aggregators are resolved by name through an [`AggregatorRegistry`] when the rule is
//! compiled; custom kinds are registered the same way as the built-ins.

use crate::error::{ExpressionKind, LhsErrorHandler, ReteError, Result, dispose};
use crate::expression::BoundExpression;
use crate::fact::FactId;
use crate::identity::IdentityComparer;
use crate::rete_network::NodeId;
use crate::tuple::TupleId;
use crate::working_memory::WorkingMemory;
use ahash::AHashMap;
use reticle_types::FactValue;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

mod collection;
mod flatten;
mod group_by;
mod lookup;
mod project;
mod sorted;

pub use collection::{CollectionAggregator, CollectionFactory};
pub use flatten::{FlattenAggregator, FlattenFactory};
pub use group_by::{GroupByAggregator, GroupByFactory};
pub use lookup::LookupFactory;
pub use project::{ProjectAggregator, ProjectFactory};
pub use sorted::{SortDirection, SortedAggregator, SortedFactory};

/// Identifier of one aggregate value within one aggregator instance
pub type ResultId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationAction {
    None,
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub action: AggregationAction,
    pub id: ResultId,
    /// Current value; for `Removed` the last value before removal
    pub aggregate: FactValue,
    /// Value before this change, for `Modified` and `Removed`
    pub previous: Option<FactValue>,
    /// Facts contributing to the aggregate
    pub source: Vec<FactId>,
}

impl AggregationResult {
    pub fn added(id: ResultId, aggregate: FactValue, source: Vec<FactId>) -> Self {
        Self { action: AggregationAction::Added, id, aggregate, previous: None, source }
    }

    pub fn modified(id: ResultId, aggregate: FactValue, previous: FactValue, source: Vec<FactId>) -> Self {
        Self { action: AggregationAction::Modified, id, aggregate, previous: Some(previous), source }
    }

    pub fn removed(id: ResultId, last: FactValue, source: Vec<FactId>) -> Self {
        Self { action: AggregationAction::Removed, id, previous: Some(last.clone()), aggregate: last, source }
    }
}

/// A compiled, named aggregate selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateExpression {
    pub name: String,
    pub expression: BoundExpression<FactValue>,
}

/// All selectors of one aggregate element, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateExpressions {
    expressions: Vec<AggregateExpression>,
}

impl AggregateExpressions {
    pub fn new(expressions: Vec<AggregateExpression>) -> Self {
        Self { expressions }
    }

    pub fn get(&self, name: &str) -> Option<&AggregateExpression> {
        self.expressions.iter().find(|e| e.name == name)
    }

    /// Look up a selector the aggregator cannot work without
    pub fn require(&self, aggregator: &str, name: &str) -> Result<&AggregateExpression> {
        self.get(name).ok_or_else(|| {
            ReteError::configuration(format!("aggregator '{aggregator}' requires a '{name}' selector"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregateExpression> {
        self.expressions.iter()
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }
}

/// Read access to working memory for aggregators
pub struct AggregationContext<'a> {
    memory: &'a WorkingMemory,
    errors: &'a dyn LhsErrorHandler,
    identity: &'a IdentityComparer,
    node: NodeId,
    suppressed: Cell<bool>,
}

impl<'a> AggregationContext<'a> {
    pub(crate) fn new(
        memory: &'a WorkingMemory,
        errors: &'a dyn LhsErrorHandler,
        identity: &'a IdentityComparer,
        node: NodeId,
    ) -> Self {
        Self { memory, errors, identity, node, suppressed: Cell::new(false) }
    }

    /// Current value of a fact, resolved through wrappers
    pub fn value(&self, fact: FactId) -> Result<&'a FactValue> {
        self.memory.value_of(fact).ok_or_else(|| ReteError::missing_fact(fact, "aggregation"))
    }

    /// Values of `facts` in the given order
    pub fn values(&self, facts: impl IntoIterator<Item = FactId>) -> Result<Vec<FactValue>> {
        facts.into_iter().map(|f| self.value(f).cloned()).collect()
    }

    /// Evaluate a selector for one right fact of `tuple`
    pub fn evaluate(&self, selector: &AggregateExpression, tuple: TupleId, fact: FactId) -> Result<FactValue> {
        match selector.expression.evaluate(self.memory, ExpressionKind::Aggregate, self.node, Some(tuple), Some(fact)) {
            Ok(value) => Ok(value),
            Err(failure) => {
                let error = ReteError::Evaluation(Box::new(failure.clone()));
                dispose(self.errors, failure)?;
                self.suppressed.set(true);
                Err(error)
            }
        }
    }

    /// Identity token for a free-standing key value
    pub fn key_identity(&self, key: &FactValue) -> FactValue {
        self.identity.key_identity(key)
    }

    /// Whether an evaluation failure was suppressed by the error handler
    pub(crate) fn was_suppressed(&self) -> bool {
        self.suppressed.get()
    }
}

pub trait Aggregator: Send {
    fn add(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>>;

    fn modify(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>>;

    fn remove(&mut self, ctx: &AggregationContext<'_>, tuple: TupleId, facts: &[FactId]) -> Result<Vec<AggregationResult>>;
}

/// Builds aggregator instances for one aggregator kind
pub trait AggregatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Create a fresh instance; also called once at compile time to validate selectors
    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>>;
}

type CreateFn = dyn Fn(&Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> + Send + Sync;

/// Factory backed by a closure, for custom aggregators
pub struct FnAggregatorFactory {
    name: String,
    create: Box<CreateFn>,
}

impl FnAggregatorFactory {
    pub fn new<F>(name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> + Send + Sync + 'static,
    {
        Self { name: name.into(), create: Box::new(create) }
    }
}

impl AggregatorFactory for FnAggregatorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, expressions: &Arc<AggregateExpressions>) -> Result<Box<dyn Aggregator>> {
        (self.create)(expressions)
    }
}

/// Aggregator factories by name
#[derive(Clone)]
pub struct AggregatorRegistry {
    factories: AHashMap<String, Arc<dyn AggregatorFactory>>,
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CollectionFactory);
        registry.register(SortedFactory);
        registry.register(GroupByFactory);
        registry.register(LookupFactory);
        registry.register(ProjectFactory);
        registry.register(FlattenFactory);
        registry
    }
}

impl fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("AggregatorRegistry").field("factories", &names).finish()
    }
}

impl AggregatorRegistry {
    /// Registry with the built-in aggregators
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without any aggregators
    pub fn empty() -> Self {
        Self { factories: AHashMap::new() }
    }

    /// Register a factory, replacing any previous one of the same name
    pub fn register(&mut self, factory: impl AggregatorFactory + 'static) -> &mut Self {
        self.factories.insert(factory.name().to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AggregatorFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| ReteError::UnknownAggregator { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Bookkeeping shared by the single-result aggregators
#[derive(Debug, Default, Clone)]
pub(crate) struct SingleResult {
    current: Option<FactValue>,
}

impl SingleResult {
    pub(crate) const ID: ResultId = 0;

    pub(crate) fn emit(&mut self, aggregate: FactValue, source: Vec<FactId>) -> AggregationResult {
        match self.current.replace(aggregate.clone()) {
            None => AggregationResult::added(Self::ID, aggregate, source),
            Some(previous) => AggregationResult::modified(Self::ID, aggregate, previous, source),
        }
    }
}

pub(crate) fn duplicate_add(aggregator: &str, fact: FactId) -> ReteError {
    ReteError::protocol(aggregator, format!("fact {fact} was already added"), Some(fact))
}

pub(crate) fn unknown_fact(aggregator: &str, operation: &str, fact: FactId) -> ReteError {
    ReteError::protocol(aggregator, format!("cannot {operation} fact {fact}: it was never added"), Some(fact))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Drives aggregators directly, outside of any network

    use super::*;
    use crate::error::FailFast;
    use crate::expression::{FactIndexMap, Lambda};
    use crate::model::Declaration;
    use reticle_types::FactType;

    pub struct Harness {
        pub memory: WorkingMemory,
        pub identity: IdentityComparer,
        pub tuple: TupleId,
        pub item: Declaration,
    }

    impl Harness {
        pub fn new() -> Self {
            let mut memory = WorkingMemory::new();
            let tuple = memory.create_root_tuple();
            Self {
                memory,
                identity: IdentityComparer::default(),
                tuple,
                item: Declaration::new("item", FactType::new("Item")),
            }
        }

        pub fn insert(&mut self, value: FactValue) -> FactId {
            self.memory.insert_fact(FactType::new("Item"), value)
        }

        pub fn set(&mut self, fact: FactId, value: FactValue) {
            self.memory.set_value(fact, value).unwrap();
        }

        pub fn ctx(&self) -> AggregationContext<'_> {
            AggregationContext::new(&self.memory, &FailFast, &self.identity, NodeId(0))
        }

        /// Selector over the item's field
        pub fn field(&self, name: &str, field: &'static str) -> AggregateExpression {
            let lambda = Lambda::new(format!("item.{field}"), vec![self.item.clone()], move |args| {
                Ok(args[0].get(field).cloned().unwrap_or(FactValue::Null))
            });
            AggregateExpression {
                name: name.to_string(),
                expression: BoundExpression::new(lambda, FactIndexMap::single(0)),
            }
        }

        /// Selector that returns the item itself
        pub fn identity_selector(&self, name: &str) -> AggregateExpression {
            let lambda = Lambda::new("item", vec![self.item.clone()], |args| Ok(args[0].clone()));
            AggregateExpression {
                name: name.to_string(),
                expression: BoundExpression::new(lambda, FactIndexMap::single(0)),
            }
        }
    }

    pub fn item(key: &str, value: i64) -> FactValue {
        FactValue::record([("key", FactValue::from(key)), ("value", value.into())])
    }

    pub fn actions(results: &[AggregationResult]) -> Vec<AggregationAction> {
        results.iter().map(|r| r.action).collect()
    }
}
