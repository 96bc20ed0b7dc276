//! Alpha memories
//!
//! An [`AlphaMemory`] holds the facts that passed one alpha chain. Adapter nodes reuse it for
//! the wrapper facts they publish. Facts are ordered by id, which is also insertion order.

use crate::fact::FactId;
use std::collections::BTreeSet;

#[derive(Debug, Default, Clone)]
pub struct AlphaMemory {
    facts: BTreeSet<FactId>,
}

impl AlphaMemory {
    pub fn contains(&self, fact: FactId) -> bool {
        self.facts.contains(&fact)
    }

    pub fn add(&mut self, facts: &[FactId]) {
        self.facts.extend(facts.iter().copied());
    }

    pub fn remove(&mut self, facts: &[FactId]) {
        for fact in facts {
            self.facts.remove(fact);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = FactId> + '_ {
        self.facts.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}
