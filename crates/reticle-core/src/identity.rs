//! Fact identity
//!
//! Working memory never decides "same fact" by comparing payloads. The session resolves
//! identity through an [`IdentityComparer`]: either by reference (the `FactId` handle the
//! caller got back from `insert`), by a named identity field, or by a caller-supplied
//! function. Strategies can be overridden per fact type.

use ahash::AHashMap;
use reticle_types::{FactType, FactValue};
use std::fmt;
use std::sync::Arc;

type IdentityFn = dyn Fn(&FactValue) -> Option<FactValue> + Send + Sync;

/// How the identity of a value is determined
#[derive(Clone)]
pub enum IdentityStrategy {
    /// Identity is the fact handle; values never collide
    Reference,
    /// Identity is the value of the named record field
    Field(String),
    /// Identity is computed by a function; `None` falls back to reference identity
    Custom(Arc<IdentityFn>),
}

impl fmt::Debug for IdentityStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityStrategy::Reference => write!(f, "Reference"),
            IdentityStrategy::Field(name) => write!(f, "Field({name})"),
            IdentityStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityComparer {
    default: IdentityStrategy,
    per_type: AHashMap<String, IdentityStrategy>,
}

impl Default for IdentityComparer {
    fn default() -> Self {
        Self::new(IdentityStrategy::Reference)
    }
}

impl IdentityComparer {
    pub fn new(default: IdentityStrategy) -> Self {
        Self { default, per_type: AHashMap::new() }
    }

    /// Compare records of every type by the named field
    pub fn by_field(name: impl Into<String>) -> Self {
        Self::new(IdentityStrategy::Field(name.into()))
    }

    /// Override the strategy for one fact type
    #[must_use]
    pub fn with_type(mut self, fact_type: &FactType, strategy: IdentityStrategy) -> Self {
        self.per_type.insert(fact_type.name().to_string(), strategy);
        self
    }

    /// Override the strategy for one fact type with a custom function
    #[must_use]
    pub fn with_custom<F>(self, fact_type: &FactType, identity: F) -> Self
    where
        F: Fn(&FactValue) -> Option<FactValue> + Send + Sync + 'static,
    {
        self.with_type(fact_type, IdentityStrategy::Custom(Arc::new(identity)))
    }

    fn strategy(&self, fact_type: &FactType) -> &IdentityStrategy {
        self.per_type.get(fact_type.name()).unwrap_or(&self.default)
    }

    /// Identity token of a fact payload, or `None` when only the handle identifies it
    pub fn identity_of(&self, fact_type: &FactType, value: &FactValue) -> Option<FactValue> {
        Self::apply(self.strategy(fact_type), value)
    }

    /// Identity token of a free-standing value such as a lookup key.
    ///
    /// Values have no handle, so reference identity degrades to the whole value.
    pub fn key_identity(&self, value: &FactValue) -> FactValue {
        Self::apply(&self.default, value).unwrap_or_else(|| value.clone())
    }

    fn apply(strategy: &IdentityStrategy, value: &FactValue) -> Option<FactValue> {
        match strategy {
            IdentityStrategy::Reference => None,
            IdentityStrategy::Field(name) => value.get(name).cloned(),
            IdentityStrategy::Custom(identity) => identity(value),
        }
    }

    /// Whether two payloads of the same type denote the same fact
    pub fn same_identity(&self, fact_type: &FactType, left: &FactValue, right: &FactValue) -> bool {
        match (self.identity_of(fact_type, left), self.identity_of(fact_type, right)) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        }
    }
}
