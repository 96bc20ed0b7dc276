use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Runtime type of a fact.
///
/// Types are nominal: two `FactType`s are equal when their names are equal. A type may
/// declare supertypes, which makes facts of this type visible to patterns over any of
/// its supertypes. The supertype list is flattened at construction so assignability
/// checks never walk a chain.
#[derive(Clone, Serialize, Deserialize)]
pub struct FactType {
    inner: Arc<FactTypeInner>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FactTypeInner {
    name: String,
    supertypes: Vec<String>,
}

impl FactType {
    /// Create a root type with no supertypes
    pub fn new(name: impl Into<String>) -> Self {
        Self { inner: Arc::new(FactTypeInner { name: name.into(), supertypes: Vec::new() }) }
    }

    /// Return a copy of this type that also derives from `parent` and all of its supertypes
    #[must_use]
    pub fn with_supertype(&self, parent: &Self) -> Self {
        let mut supertypes = self.inner.supertypes.clone();
        for name in std::iter::once(&parent.inner.name).chain(parent.inner.supertypes.iter()) {
            if *name != self.inner.name && !supertypes.contains(name) {
                supertypes.push(name.clone());
            }
        }
        Self { inner: Arc::new(FactTypeInner { name: self.inner.name.clone(), supertypes }) }
    }

    /// Type name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// All transitive supertypes, nearest first
    #[must_use]
    pub fn supertypes(&self) -> &[String] {
        &self.inner.supertypes
    }

    /// Whether a fact of type `other` can be matched by a pattern over this type
    #[must_use]
    pub fn is_assignable_from(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name || other.inner.supertypes.contains(&self.inner.name)
    }
}

impl PartialEq for FactType {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for FactType {}

impl Hash for FactType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactType({})", self.inner.name)
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

impl From<&str> for FactType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
