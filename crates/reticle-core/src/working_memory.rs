//! Per-session mutable state
//!
//! The compiled network is immutable and shared; everything a session changes lives here:
//! the fact and tuple arenas, the contents of every alpha and beta memory, node-local state
//! keyed by `(node, tuple)` and the id generator. Memories are created lazily the first time
//! a node touches them.

use crate::alpha_memory::AlphaMemory;
use crate::beta_memory::BetaMemory;
use crate::error::{ReteError, Result};
use crate::fact::{Fact, FactId, FactKind};
use crate::rete_network::NodeId;
use crate::state::NodeState;
use crate::tuple::{IdGenerator, Tuple, TupleId};
use ahash::AHashMap;
use reticle_types::{FactType, FactValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct WorkingMemory {
    ids: IdGenerator,
    facts: AHashMap<FactId, Fact>,
    tuples: AHashMap<TupleId, Tuple>,
    alpha_memories: AHashMap<NodeId, AlphaMemory>,
    beta_memories: AHashMap<NodeId, BetaMemory>,
    states: AHashMap<(NodeId, TupleId), NodeState>,
}

/// Snapshot of working memory sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub facts: usize,
    pub synthetic_facts: usize,
    pub wrapper_facts: usize,
    pub tuples: usize,
    pub alpha_memories: usize,
    pub alpha_entries: usize,
    pub beta_memories: usize,
    pub beta_entries: usize,
    pub node_states: usize,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------------------------
    // Facts
    // ---------------------------------------------------------------------------------------

    /// Allocate and store an ordinary fact
    pub fn insert_fact(&mut self, fact_type: FactType, value: FactValue) -> FactId {
        let id = self.ids.next_fact_id();
        self.facts.insert(id, Fact::new(id, fact_type, value));
        id
    }

    /// Store a fact built by the caller around a freshly allocated id
    pub(crate) fn insert_with<F>(&mut self, build: F) -> FactId
    where
        F: FnOnce(FactId) -> Fact,
    {
        let id = self.ids.next_fact_id();
        self.facts.insert(id, build(id));
        id
    }

    pub fn fact(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(&id)
    }

    pub(crate) fn fact_mut(&mut self, id: FactId) -> Option<&mut Fact> {
        self.facts.get_mut(&id)
    }

    /// Replace a fact's value in place, returning the previous value
    pub fn set_value(&mut self, id: FactId, value: FactValue) -> Result<FactValue> {
        let fact = self.facts.get_mut(&id).ok_or_else(|| ReteError::missing_fact(id, "update"))?;
        Ok(std::mem::replace(&mut fact.value, value))
    }

    pub fn remove_fact(&mut self, id: FactId) -> Option<Fact> {
        self.facts.remove(&id)
    }

    /// Follow wrapper facts down to the fact that carries the value
    pub fn resolve(&self, id: FactId) -> Option<FactId> {
        let mut current = id;
        loop {
            let fact = self.facts.get(&current)?;
            match fact.kind {
                FactKind::Wrapper { tuple } => current = self.youngest_fact(tuple)?,
                _ => return Some(current),
            }
        }
    }

    /// Value of a fact, resolved through wrappers
    pub fn value_of(&self, id: FactId) -> Option<&FactValue> {
        let resolved = self.resolve(id)?;
        self.facts.get(&resolved).map(|f| &f.value)
    }

    /// Ordinary facts in id order
    pub fn ordinary_facts(&self) -> Vec<&Fact> {
        let mut facts: Vec<&Fact> = self.facts.values().filter(|f| f.is_ordinary()).collect();
        facts.sort_by_key(|f| f.id);
        facts
    }

    // ---------------------------------------------------------------------------------------
    // Tuples
    // ---------------------------------------------------------------------------------------

    pub fn create_root_tuple(&mut self) -> TupleId {
        let id = self.ids.next_tuple_id();
        self.tuples.insert(id, Tuple::root(id));
        id
    }

    pub fn create_tuple(&mut self, parent: TupleId, right: Option<FactId>) -> Result<TupleId> {
        let parent = self
            .tuples
            .get(&parent)
            .ok_or_else(|| ReteError::missing_fact(format!("parent tuple {parent}"), "join"))?;
        let id = self.ids.next_tuple_id();
        let tuple = Tuple::extend(id, parent, right);
        self.tuples.insert(id, tuple);
        Ok(id)
    }

    pub fn tuple(&self, id: TupleId) -> Option<&Tuple> {
        self.tuples.get(&id)
    }

    pub(crate) fn remove_tuple(&mut self, id: TupleId) -> Option<Tuple> {
        self.tuples.remove(&id)
    }

    /// Non-null facts of a tuple in declaration order (oldest first)
    pub fn tuple_facts(&self, id: TupleId) -> Vec<FactId> {
        let mut facts = Vec::new();
        let mut current = self.tuples.get(&id);
        while let Some(tuple) = current {
            facts.extend(tuple.right);
            current = tuple.parent.and_then(|p| self.tuples.get(&p));
        }
        facts.reverse();
        facts
    }

    /// Youngest non-null fact of a tuple
    pub fn youngest_fact(&self, id: TupleId) -> Option<FactId> {
        let mut current = self.tuples.get(&id);
        while let Some(tuple) = current {
            if tuple.right.is_some() {
                return tuple.right;
            }
            current = tuple.parent.and_then(|p| self.tuples.get(&p));
        }
        None
    }

    /// Id of the ancestor of `id` (or `id` itself) at `level`
    pub fn ancestor_at(&self, id: TupleId, level: usize) -> Option<TupleId> {
        let mut current = self.tuples.get(&id)?;
        while current.level > level {
            current = self.tuples.get(&current.parent?)?;
        }
        (current.level == level).then_some(current.id)
    }

    // ---------------------------------------------------------------------------------------
    // Memories
    // ---------------------------------------------------------------------------------------

    pub fn alpha_memory(&self, node: NodeId) -> Option<&AlphaMemory> {
        self.alpha_memories.get(&node)
    }

    pub(crate) fn alpha_memory_mut(&mut self, node: NodeId) -> &mut AlphaMemory {
        self.alpha_memories.entry(node).or_default()
    }

    /// Facts of an alpha memory, or nothing if the memory was never touched
    pub fn alpha_facts(&self, node: NodeId) -> Vec<FactId> {
        self.alpha_memories.get(&node).map(|m| m.iter().collect()).unwrap_or_default()
    }

    pub fn beta_memory(&self, node: NodeId) -> Option<&BetaMemory> {
        self.beta_memories.get(&node)
    }

    pub(crate) fn beta_memory_mut(&mut self, node: NodeId) -> &mut BetaMemory {
        self.beta_memories.entry(node).or_default()
    }

    pub fn beta_tuples(&self, node: NodeId) -> Vec<TupleId> {
        self.beta_memories.get(&node).map(|m| m.iter().collect()).unwrap_or_default()
    }

    // ---------------------------------------------------------------------------------------
    // Node state
    // ---------------------------------------------------------------------------------------

    pub fn state(&self, node: NodeId, tuple: TupleId) -> Option<&NodeState> {
        self.states.get(&(node, tuple))
    }

    pub(crate) fn state_mut(&mut self, node: NodeId, tuple: TupleId) -> Option<&mut NodeState> {
        self.states.get_mut(&(node, tuple))
    }

    pub(crate) fn set_state(&mut self, node: NodeId, tuple: TupleId, state: NodeState) {
        self.states.insert((node, tuple), state);
    }

    pub(crate) fn remove_state(&mut self, node: NodeId, tuple: TupleId) -> Option<NodeState> {
        self.states.remove(&(node, tuple))
    }

    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            tuples: self.tuples.len(),
            alpha_memories: self.alpha_memories.len(),
            alpha_entries: self.alpha_memories.values().map(AlphaMemory::len).sum(),
            beta_memories: self.beta_memories.len(),
            beta_entries: self.beta_memories.values().map(BetaMemory::len).sum(),
            node_states: self.states.len(),
            ..MemoryStats::default()
        };
        for fact in self.facts.values() {
            match fact.kind {
                FactKind::Ordinary => stats.facts += 1,
                FactKind::Synthetic => stats.synthetic_facts += 1,
                FactKind::Wrapper { .. } => stats.wrapper_facts += 1,
            }
        }
        stats
    }
}
