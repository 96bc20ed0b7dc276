//! Matching session
//!
//! A session pairs a shared, immutable [`ReteNetwork`] with its own [`WorkingMemory`] and
//! [`Agenda`]. It is the place where caller-facing facts are identity-resolved before they
//! reach the network: an insert of a payload whose identity is already present is rejected, and
//! facts can be updated or retracted either by handle or by identity.
//!
//! Sessions are independent of one another; any number of them can run on different threads
//! against the same `Arc<ReteNetwork>`.

use crate::agenda::Agenda;
use crate::config::EngineConfig;
use crate::error::{LhsErrorHandler, ReteError, Result};
use crate::fact::{Fact, FactId};
use crate::identity::IdentityComparer;
use crate::rete_network::{ExecutionContext, NetworkStats, NodeId, ReteNetwork};
use crate::working_memory::{MemoryStats, WorkingMemory};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use reticle_types::{FactType, FactValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

type IdentityKey = (String, FactValue);

/// Statistics about a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub activations: usize,
    pub memory: MemoryStats,
    pub network: NetworkStats,
}

pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    network: Arc<ReteNetwork>,
    memory: WorkingMemory,
    agenda: Agenda,
    identity: IdentityComparer,
    errors: Box<dyn LhsErrorHandler>,
    /// Facts with a value identity, by type name and identity token
    by_identity: AHashMap<IdentityKey, FactId>,
}

impl Session {
    /// Session with default settings
    pub fn new(network: Arc<ReteNetwork>) -> Result<Self> {
        Self::from_config(network, &EngineConfig::default())
    }

    pub fn from_config(network: Arc<ReteNetwork>, config: &EngineConfig) -> Result<Self> {
        let agenda = if config.session.record_agenda_events { Agenda::recording() } else { Agenda::new() };
        Self::with_parts(network, config.identity_comparer(), config.error_handler(), agenda)
    }

    /// Create and activate a session. Rules whose left-hand side needs no facts match here.
    #[instrument(skip_all)]
    pub fn with_parts(
        network: Arc<ReteNetwork>,
        identity: IdentityComparer,
        errors: Box<dyn LhsErrorHandler>,
        agenda: Agenda,
    ) -> Result<Self> {
        let mut session = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            network,
            memory: WorkingMemory::new(),
            agenda,
            identity,
            errors,
            by_identity: AHashMap::new(),
        };
        session.run(|network, ctx| network.activate(ctx))?;
        info!(session_id = %session.id, rules = session.network.rules().len(), "Created session");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn network(&self) -> &Arc<ReteNetwork> {
        &self.network
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub fn agenda_mut(&mut self) -> &mut Agenda {
        &mut self.agenda
    }

    pub fn memory(&self) -> &WorkingMemory {
        &self.memory
    }

    // ============================================================================
    // MUTATIONS
    // ============================================================================

    #[instrument(skip(self, value), fields(session_id = %self.id))]
    pub fn insert(&mut self, fact_type: FactType, value: FactValue) -> Result<FactId> {
        let ids = self.insert_all(vec![(fact_type, value)])?;
        ids.into_iter().next().ok_or_else(|| ReteError::missing_fact("inserted fact", "insert"))
    }

    /// Insert a batch of facts and propagate them together
    #[instrument(skip(self, facts), fields(session_id = %self.id, facts = facts.len()))]
    pub fn insert_all(&mut self, facts: Vec<(FactType, FactValue)>) -> Result<Vec<FactId>> {
        let mut keys = Vec::with_capacity(facts.len());
        for (fact_type, value) in &facts {
            let key = self.identity_key(fact_type, value);
            if let Some(key) = &key {
                if self.by_identity.contains_key(key) || keys.iter().flatten().any(|k| k == key) {
                    return Err(ReteError::DuplicateFact {
                        fact_type: fact_type.name().to_string(),
                        identity: key.1.to_string(),
                    });
                }
            }
            keys.push(key);
        }

        let mut ids = Vec::with_capacity(facts.len());
        for ((fact_type, value), key) in facts.into_iter().zip(keys) {
            let id = self.memory.insert_fact(fact_type, value);
            if let Some(key) = key {
                self.by_identity.insert(key, id);
            }
            ids.push(id);
        }
        debug!(facts = ids.len(), "Inserting facts");
        self.run(|network, ctx| network.propagate_assert(ctx, &ids))?;
        Ok(ids)
    }

    #[instrument(skip(self, value), fields(session_id = %self.id))]
    pub fn update(&mut self, fact: FactId, value: FactValue) -> Result<()> {
        self.update_all(vec![(fact, value)])
    }

    /// Replace the payloads of a batch of facts and propagate them together.
    ///
    /// A new payload may change the fact's identity as long as it does not collide with another
    /// fact.
    #[instrument(skip(self, updates), fields(session_id = %self.id, facts = updates.len()))]
    pub fn update_all(&mut self, updates: Vec<(FactId, FactValue)>) -> Result<()> {
        let mut rekeyed: Vec<(FactId, Option<IdentityKey>, Option<IdentityKey>)> = Vec::new();
        for (i, (id, value)) in updates.iter().enumerate() {
            let fact = self.ordinary(*id, "update")?;
            if updates[..i].iter().any(|(other, _)| other == id) {
                return Err(ReteError::missing_fact(id, "update"));
            }
            let old_key = self.identity_key(&fact.fact_type, &fact.value);
            let new_key = self.identity_key(&fact.fact_type, value);
            if old_key != new_key {
                rekeyed.push((*id, old_key, new_key));
            }
        }

        // A key is free if its owner moves away in this batch and no earlier update claims it
        for (i, (id, _, new_key)) in rekeyed.iter().enumerate() {
            let Some(key) = new_key else { continue };
            let vacated = rekeyed.iter().any(|(_, old, _)| old.as_ref() == Some(key));
            let taken = !vacated && self.by_identity.get(key).is_some_and(|owner| owner != id);
            let claimed = rekeyed[..i].iter().any(|(_, _, other)| other.as_ref() == Some(key));
            if taken || claimed {
                return Err(ReteError::DuplicateFact { fact_type: key.0.clone(), identity: key.1.to_string() });
            }
        }

        for (_, old_key, _) in &rekeyed {
            if let Some(key) = old_key {
                self.by_identity.remove(key);
            }
        }
        for (id, _, new_key) in rekeyed {
            if let Some(key) = new_key {
                self.by_identity.insert(key, id);
            }
        }
        let mut ids = Vec::with_capacity(updates.len());
        for (id, value) in updates {
            self.memory.set_value(id, value)?;
            ids.push(id);
        }
        self.run(|network, ctx| network.propagate_update(ctx, &ids))
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn retract(&mut self, fact: FactId) -> Result<()> {
        self.retract_all(&[fact])
    }

    /// Retract a batch of facts. The facts stay readable until propagation has finished.
    #[instrument(skip(self, facts), fields(session_id = %self.id, facts = facts.len()))]
    pub fn retract_all(&mut self, facts: &[FactId]) -> Result<()> {
        for (i, id) in facts.iter().enumerate() {
            self.ordinary(*id, "retract")?;
            if facts[..i].contains(id) {
                return Err(ReteError::missing_fact(id, "retract"));
            }
        }
        self.run(|network, ctx| network.propagate_retract(ctx, facts))?;
        for id in facts {
            if let Some(fact) = self.memory.remove_fact(*id) {
                if let Some(key) = self.identity_key(&fact.fact_type, &fact.value) {
                    self.by_identity.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Update the fact with the same identity as `value`
    #[instrument(skip(self, value), fields(session_id = %self.id))]
    pub fn update_by_identity(&mut self, fact_type: &FactType, value: FactValue) -> Result<FactId> {
        let id = self.find(fact_type, &value).ok_or_else(|| Self::not_found(fact_type, &value, "update"))?;
        self.update(id, value)?;
        Ok(id)
    }

    /// Retract the fact with the same identity as `value`
    #[instrument(skip(self, value), fields(session_id = %self.id))]
    pub fn retract_by_identity(&mut self, fact_type: &FactType, value: &FactValue) -> Result<FactId> {
        let id = self.find(fact_type, value).ok_or_else(|| Self::not_found(fact_type, value, "retract"))?;
        self.retract(id)?;
        Ok(id)
    }

    // ============================================================================
    // QUERIES
    // ============================================================================

    /// Fact with the same identity as `value`; always `None` under reference identity
    pub fn find(&self, fact_type: &FactType, value: &FactValue) -> Option<FactId> {
        let key = self.identity_key(fact_type, value)?;
        self.by_identity.get(&key).copied()
    }

    pub fn fact(&self, id: FactId) -> Option<&Fact> {
        self.memory.fact(id)
    }

    pub fn value(&self, id: FactId) -> Option<&FactValue> {
        self.memory.value_of(id)
    }

    /// Number of facts in an alpha memory
    pub fn alpha_fact_count(&self, node: NodeId) -> usize {
        self.memory.alpha_memory(node).map_or(0, |memory| memory.len())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            created_at: self.created_at,
            activations: self.agenda.len(),
            memory: self.memory.stats(),
            network: self.network.stats(),
        }
    }

    // ============================================================================
    // HELPERS
    // ============================================================================

    fn run<F>(&mut self, propagate: F) -> Result<()>
    where
        F: FnOnce(&ReteNetwork, &mut ExecutionContext<'_>) -> Result<()>,
    {
        let network = &*self.network;
        let mut ctx =
            ExecutionContext::new(network, &mut self.memory, &mut self.agenda, self.errors.as_ref(), &self.identity);
        propagate(network, &mut ctx)
    }

    fn identity_key(&self, fact_type: &FactType, value: &FactValue) -> Option<IdentityKey> {
        let token = self.identity.identity_of(fact_type, value)?;
        Some((fact_type.name().to_string(), token))
    }

    fn ordinary(&self, id: FactId, operation: &'static str) -> Result<&Fact> {
        self.memory
            .fact(id)
            .filter(|fact| fact.is_ordinary())
            .ok_or_else(|| ReteError::missing_fact(id, operation))
    }

    fn not_found(fact_type: &FactType, value: &FactValue, operation: &'static str) -> ReteError {
        ReteError::missing_fact(format!("{fact_type} {value}"), operation)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("facts", &self.by_identity.len())
            .field("activations", &self.agenda.len())
            .finish()
    }
}
