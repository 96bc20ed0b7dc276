//! Partial matches
//!
//! A tuple is an immutable cons cell over its parent tuple and one right fact. Tuples live in
//! the session's tuple arena and refer to their parents by id, so a chain is shared by every
//! child that extends it. The root tuple has no parent and sits at level 0.
//!
//! Facts are enumerated youngest first. `count` only includes non-null facts, which is also
//! the number of declarations bound along the chain; Not/Exists nodes extend a tuple with a
//! null fact and do not change its count.

use crate::fact::FactId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique, strictly increasing tuple identifier within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId(pub u64);

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub id: TupleId,
    pub parent: Option<TupleId>,
    pub right: Option<FactId>,
    /// Number of non-null facts along the chain
    pub count: usize,
    /// Join depth; the root tuple is level 0
    pub level: usize,
}

impl Tuple {
    pub fn root(id: TupleId) -> Self {
        Self { id, parent: None, right: None, count: 0, level: 0 }
    }

    pub fn extend(id: TupleId, parent: &Tuple, right: Option<FactId>) -> Self {
        Self {
            id,
            parent: Some(parent.id),
            right,
            count: parent.count + usize::from(right.is_some()),
            level: parent.level + 1,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Strictly increasing id source for facts and tuples of one session
#[derive(Debug, Default, Clone)]
pub struct IdGenerator {
    next_fact: u64,
    next_tuple: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_fact_id(&mut self) -> FactId {
        self.next_fact += 1;
        FactId(self.next_fact)
    }

    pub fn next_tuple_id(&mut self) -> TupleId {
        self.next_tuple += 1;
        TupleId(self.next_tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_tracks_count_and_level() {
        let root = Tuple::root(TupleId(1));
        let a = Tuple::extend(TupleId(2), &root, Some(FactId(10)));
        let not = Tuple::extend(TupleId(3), &a, None);
        let b = Tuple::extend(TupleId(4), &not, Some(FactId(11)));

        assert!(root.is_root());
        assert_eq!((a.count, a.level), (1, 1));
        assert_eq!((not.count, not.level), (1, 2));
        assert_eq!((b.count, b.level), (2, 3));
        assert_eq!(b.parent, Some(TupleId(3)));
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut ids = IdGenerator::new();
        let first = ids.next_tuple_id();
        let second = ids.next_tuple_id();
        assert!(second > first);
        assert!(ids.next_fact_id() < ids.next_fact_id());
    }
}
