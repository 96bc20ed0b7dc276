//! Beta memories
//!
//! A [`BetaMemory`] holds the tuples produced by one beta node, plus an index from
//! `(parent tuple, right fact)` to the child tuple so that updates and retractions find their
//! tuple without walking the memory. Tuples are ordered by id.

use crate::fact::FactId;
use crate::tuple::TupleId;
use ahash::AHashMap;
use std::collections::BTreeSet;

#[derive(Debug, Default, Clone)]
pub struct BetaMemory {
    tuples: BTreeSet<TupleId>,
    index: AHashMap<(TupleId, Option<FactId>), TupleId>,
}

impl BetaMemory {
    /// Child tuple produced for `parent` extended with `fact`
    pub fn find(&self, parent: TupleId, fact: Option<FactId>) -> Option<TupleId> {
        self.index.get(&(parent, fact)).copied()
    }

    pub fn contains(&self, tuple: TupleId) -> bool {
        self.tuples.contains(&tuple)
    }

    pub fn add(&mut self, tuple: TupleId, parent: TupleId, fact: Option<FactId>) {
        self.tuples.insert(tuple);
        self.index.insert((parent, fact), tuple);
    }

    /// Root tuples have no parent and are only tracked in the ordered set
    pub fn add_root(&mut self, tuple: TupleId) {
        self.tuples.insert(tuple);
    }

    pub fn remove(&mut self, tuple: TupleId, parent: Option<TupleId>, fact: Option<FactId>) {
        self.tuples.remove(&tuple);
        if let Some(parent) = parent {
            self.index.remove(&(parent, fact));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = TupleId> + '_ {
        self.tuples.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beta_memory_index_by_parent_and_fact() {
        let mut memory = BetaMemory::default();
        memory.add(TupleId(5), TupleId(1), Some(FactId(7)));
        memory.add(TupleId(6), TupleId(1), None);

        assert_eq!(memory.find(TupleId(1), Some(FactId(7))), Some(TupleId(5)));
        assert_eq!(memory.find(TupleId(1), None), Some(TupleId(6)));
        assert_eq!(memory.find(TupleId(2), None), None);

        memory.remove(TupleId(5), Some(TupleId(1)), Some(FactId(7)));
        assert!(!memory.contains(TupleId(5)));
        assert_eq!(memory.find(TupleId(1), Some(FactId(7))), None);
        assert_eq!(memory.len(), 1);
    }
}
