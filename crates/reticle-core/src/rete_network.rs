//! Compiled Rete network
//!
//! The network is an arena of [`Node`]s addressed by [`NodeId`]. Every edge is stored as an id
//! on the node that propagates along it (children, sinks, output memory), so the graph is a
//! plain `Vec` with no shared ownership. Once built it is immutable: all mutable matching
//! state lives in a session's [`WorkingMemory`], which is what lets many sessions share one
//! network through an `Arc`.
//!
//! ## Network Architecture
//!
//! ```text
//! Root → Type → Selection* → AlphaMemory ─────────────┐ (right)
//!                                                     ▼
//! Dummy ──(left)──► Join / Not / Exists / Aggregate / Binding → BetaMemory → ... → Terminal
//!                                  ▲
//!   BetaMemory → Adapter ──────────┘ (right, subnet joins)
//! ```
//!
//! Propagation is synchronous and depth-first. Entry points are
//! [`ReteNetwork::propagate_assert`], [`ReteNetwork::propagate_update`],
//! [`ReteNetwork::propagate_retract`] and [`ReteNetwork::activate`].

use crate::aggregation::{AggregateExpressions, AggregatorFactory};
use crate::agenda::ActivationSink;
use crate::error::{ExpressionKind, LhsErrorHandler, Result, dispose};
use crate::expression::BoundExpression;
use crate::fact::FactId;
use crate::tuple::TupleId;
use crate::identity::IdentityComparer;
use crate::model::Declaration;
use crate::working_memory::WorkingMemory;
use crate::{alpha_network, beta_network};
use reticle_types::{FactType, FactValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{instrument, trace};

/// Index of a node in the network arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A join test between a tuple and a right fact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinCondition {
    Expression(BoundExpression<bool>),
    /// The tuple fact at `position` and the right fact are the same fact
    SameFact { position: usize },
}

impl JoinCondition {
    pub fn text(&self) -> String {
        match self {
            JoinCondition::Expression(expression) => expression.text().to_string(),
            JoinCondition::SameFact { position } => format!("same fact as #{position}"),
        }
    }
}

/// Compiled aggregate element
#[derive(Clone)]
pub struct AggregateSpec {
    pub aggregator: String,
    pub factory: Arc<dyn AggregatorFactory>,
    pub expressions: Arc<AggregateExpressions>,
    pub result_type: FactType,
}

impl PartialEq for AggregateSpec {
    fn eq(&self, other: &Self) -> bool {
        self.aggregator == other.aggregator
            && self.expressions == other.expressions
            && self.result_type == other.result_type
    }
}

impl fmt::Debug for AggregateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateSpec")
            .field("aggregator", &self.aggregator)
            .field("expressions", &self.expressions)
            .field("result_type", &self.result_type)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    // Alpha network
    Root { children: Vec<NodeId> },
    Type { fact_type: FactType, children: Vec<NodeId>, memory: Option<NodeId> },
    Selection { condition: BoundExpression<bool>, children: Vec<NodeId>, memory: Option<NodeId> },
    AlphaMemory { sinks: Vec<NodeId> },

    // Beta network
    /// Holds the single root tuple
    Dummy { sinks: Vec<NodeId> },
    BetaMemory { level: usize, sinks: Vec<NodeId> },
    Join { left: NodeId, right: NodeId, conditions: Vec<JoinCondition>, is_subnet: bool, memory: NodeId },
    Not { left: NodeId, right: NodeId, is_subnet: bool, memory: NodeId },
    Exists { left: NodeId, right: NodeId, is_subnet: bool, memory: NodeId },
    Aggregate { left: NodeId, right: NodeId, is_subnet: bool, memory: NodeId, spec: AggregateSpec },
    Binding { left: NodeId, expression: BoundExpression<FactValue>, result_type: FactType, memory: NodeId },
    /// Publishes the tuples of `source` as wrapper facts for subnet joins
    Adapter { source: NodeId, sinks: Vec<NodeId> },
    Terminal { rule: String, fact_map: Vec<Option<usize>>, declarations: Arc<Vec<Declaration>> },
}

impl NodeKind {
    /// Stable type tag used by schema export and statistics
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Root { .. } => "root",
            NodeKind::Type { .. } => "type",
            NodeKind::Selection { .. } => "selection",
            NodeKind::AlphaMemory { .. } => "alpha_memory",
            NodeKind::Dummy { .. } => "dummy",
            NodeKind::BetaMemory { .. } => "beta_memory",
            NodeKind::Join { .. } => "join",
            NodeKind::Not { .. } => "not",
            NodeKind::Exists { .. } => "exists",
            NodeKind::Aggregate { .. } => "aggregate",
            NodeKind::Binding { .. } => "binding",
            NodeKind::Adapter { .. } => "adapter",
            NodeKind::Terminal { .. } => "terminal",
        }
    }

    /// Output beta memory of a beta node
    pub fn output_memory(&self) -> Option<NodeId> {
        match self {
            NodeKind::Join { memory, .. }
            | NodeKind::Not { memory, .. }
            | NodeKind::Exists { memory, .. }
            | NodeKind::Aggregate { memory, .. }
            | NodeKind::Binding { memory, .. } => Some(*memory),
            _ => None,
        }
    }

    /// Nodes this node propagates to
    pub fn successors(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Root { children } => children.clone(),
            NodeKind::Type { children, memory, .. } | NodeKind::Selection { children, memory, .. } => {
                children.iter().copied().chain(*memory).collect()
            }
            NodeKind::AlphaMemory { sinks }
            | NodeKind::Dummy { sinks }
            | NodeKind::BetaMemory { sinks, .. }
            | NodeKind::Adapter { sinks, .. } => sinks.clone(),
            NodeKind::Terminal { .. } => Vec::new(),
            other => other.output_memory().into_iter().collect(),
        }
    }

    /// Expression texts evaluated at this node
    pub fn expressions(&self) -> Vec<String> {
        match self {
            NodeKind::Type { fact_type, .. } => vec![fact_type.name().to_string()],
            NodeKind::Selection { condition, .. } => vec![condition.text().to_string()],
            NodeKind::Join { conditions, .. } => conditions.iter().map(JoinCondition::text).collect(),
            NodeKind::Aggregate { spec, .. } => std::iter::once(spec.aggregator.clone())
                .chain(spec.expressions.iter().map(|e| format!("{}: {}", e.name, e.expression.text())))
                .collect(),
            NodeKind::Binding { expression, .. } => vec![expression.text().to_string()],
            NodeKind::Terminal { rule, .. } => vec![rule.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Rules whose left-hand side uses this node
    pub rules: Vec<String>,
}

/// A rule as compiled into the network
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    /// Declarations bound by any branch of the rule, in order of first appearance
    pub declarations: Arc<Vec<Declaration>>,
    /// One terminal per `Or` branch
    pub terminals: Vec<NodeId>,
}

/// Node counts of a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_nodes: usize,
    pub alpha_nodes: usize,
    pub alpha_memories: usize,
    pub beta_nodes: usize,
    pub beta_memories: usize,
    pub adapters: usize,
    pub terminals: usize,
    /// Nodes used by more than one rule
    pub shared_nodes: usize,
    pub rules: usize,
}

/// Everything propagation needs besides the graph itself
pub struct ExecutionContext<'a> {
    pub network: &'a ReteNetwork,
    pub memory: &'a mut WorkingMemory,
    pub sink: &'a mut dyn ActivationSink,
    pub errors: &'a dyn LhsErrorHandler,
    pub identity: &'a IdentityComparer,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        network: &'a ReteNetwork,
        memory: &'a mut WorkingMemory,
        sink: &'a mut dyn ActivationSink,
        errors: &'a dyn LhsErrorHandler,
        identity: &'a IdentityComparer,
    ) -> Self {
        Self { network, memory, sink, errors, identity }
    }

    /// Evaluate a boolean expression; a suppressed failure counts as `false`
    pub(crate) fn test(
        &self,
        expression: &BoundExpression<bool>,
        kind: ExpressionKind,
        node: NodeId,
        tuple: Option<TupleId>,
        fact: Option<FactId>,
    ) -> Result<bool> {
        match expression.evaluate(self.memory, kind, node, tuple, fact) {
            Ok(passed) => Ok(passed),
            Err(failure) => {
                dispose(self.errors, failure)?;
                Ok(false)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReteNetwork {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
    pub(crate) dummy: NodeId,
    pub(crate) rules: Vec<CompiledRule>,
}

impl ReteNetwork {
    pub(crate) fn from_parts(nodes: Vec<Node>, root: NodeId, dummy: NodeId, rules: Vec<CompiledRule>) -> Self {
        Self { nodes, root, dummy, rules }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn dummy(&self) -> NodeId {
        self.dummy
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Level of the tuples stored in a left source memory
    pub fn level_of(&self, memory: NodeId) -> usize {
        match self.node(memory).kind {
            NodeKind::BetaMemory { level, .. } => level,
            _ => 0,
        }
    }

    /// Nodes of the given type tag
    pub fn nodes_of(&self, tag: &str) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.kind.tag() == tag).map(|n| n.id).collect()
    }

    /// Alpha memories fed by alpha chains over `fact_type`
    pub fn alpha_memories_for(&self, fact_type: &FactType) -> Vec<NodeId> {
        let mut found = Vec::new();
        for node in &self.nodes {
            if let NodeKind::Type { fact_type: t, .. } = &node.kind {
                if t == fact_type {
                    self.collect_memories(node.id, &mut found);
                }
            }
        }
        found
    }

    fn collect_memories(&self, id: NodeId, found: &mut Vec<NodeId>) {
        match &self.node(id).kind {
            NodeKind::Type { children, memory, .. } | NodeKind::Selection { children, memory, .. } => {
                found.extend(*memory);
                for child in children {
                    self.collect_memories(*child, found);
                }
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats { total_nodes: self.nodes.len(), rules: self.rules.len(), ..Default::default() };
        for node in &self.nodes {
            match node.kind {
                NodeKind::Type { .. } | NodeKind::Selection { .. } => stats.alpha_nodes += 1,
                NodeKind::AlphaMemory { .. } => stats.alpha_memories += 1,
                NodeKind::Join { .. }
                | NodeKind::Not { .. }
                | NodeKind::Exists { .. }
                | NodeKind::Aggregate { .. }
                | NodeKind::Binding { .. } => stats.beta_nodes += 1,
                NodeKind::Dummy { .. } | NodeKind::BetaMemory { .. } => stats.beta_memories += 1,
                NodeKind::Adapter { .. } => stats.adapters += 1,
                NodeKind::Terminal { .. } => stats.terminals += 1,
                NodeKind::Root { .. } => {}
            }
            if node.rules.len() > 1 {
                stats.shared_nodes += 1;
            }
        }
        stats
    }

    // ============================================================================
    // PROPAGATION ENTRY POINTS
    // ============================================================================

    /// Seed the beta network with the root tuple. Call once per session, before any fact.
    #[instrument(skip(self, ctx))]
    pub fn activate(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        beta_network::activate(ctx, self.dummy)
    }

    #[instrument(skip(self, ctx), fields(facts = facts.len()))]
    pub fn propagate_assert(&self, ctx: &mut ExecutionContext<'_>, facts: &[FactId]) -> Result<()> {
        trace!("Asserting facts at root");
        alpha_network::assert(ctx, self.root, facts)
    }

    #[instrument(skip(self, ctx), fields(facts = facts.len()))]
    pub fn propagate_update(&self, ctx: &mut ExecutionContext<'_>, facts: &[FactId]) -> Result<()> {
        trace!("Updating facts at root");
        alpha_network::update(ctx, self.root, facts)
    }

    #[instrument(skip(self, ctx), fields(facts = facts.len()))]
    pub fn propagate_retract(&self, ctx: &mut ExecutionContext<'_>, facts: &[FactId]) -> Result<()> {
        trace!("Retracting facts at root");
        alpha_network::retract(ctx, self.root, facts)
    }
}
