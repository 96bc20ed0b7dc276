//! Network construction
//!
//! Rules are normalized into Or-free `And` branches (see [`crate::transform`]) and each branch
//! is compiled by a recursive descent that threads two open ends through the tree: the beta
//! memory holding the tuples built so far and a pending alpha source whose facts have not been
//! joined yet. The pending alpha source is flushed with an unconditional join before the next
//! element, or with the pattern's own join conditions when it has any.
//!
//! Nested groups under `Not`/`Exists` and the source pattern of an aggregate are built as a
//! subnet from the same beta memory. A subnet that only produced an alpha source feeds the
//! consumer directly; otherwise its output beta memory is wrapped by an adapter and the
//! consumer joins the adapter's wrapper facts grouped by left tuple.
//!
//! With node sharing enabled, a node is reused whenever an existing node has the same inputs
//! and structurally equal conditions, so identical prefixes of different rules share nodes
//! and memories.

use crate::aggregation::{AggregateExpression, AggregateExpressions, AggregatorRegistry};
use crate::config::EngineConfig;
use crate::error::{ReteError, Result};
use crate::expression::{BoundExpression, FactIndexMap, Lambda};
use crate::model::{
    AggregateElement, BindingElement, Condition, Declaration, PatternElement, PatternSource, RuleDefinition,
    RuleElement,
};
use crate::rete_network::{AggregateSpec, CompiledRule, JoinCondition, Node, NodeId, NodeKind, ReteNetwork};
use crate::transform::{desugar_forall, normalize};
use reticle_types::FactType;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Placeholder output memory of a beta node that has not been allocated yet
const UNALLOCATED: NodeId = NodeId(usize::MAX);

/// Open ends of the branch being compiled
#[derive(Debug, Clone, Default)]
struct BuildContext {
    /// Memory holding the tuples built so far; `None` is the dummy memory
    beta_source: Option<NodeId>,
    /// Facts waiting to be joined
    alpha_source: Option<NodeId>,
    /// Declarations bound by the tuples, in tuple position order
    declarations: Vec<Declaration>,
    /// The pending alpha source is an adapter over a subnet
    has_subnet: bool,
}

impl BuildContext {
    fn subnet(&self) -> Self {
        Self {
            beta_source: self.beta_source,
            alpha_source: None,
            declarations: self.declarations.clone(),
            has_subnet: false,
        }
    }
}

pub struct NetworkBuilder {
    nodes: Vec<Node>,
    root: NodeId,
    dummy: NodeId,
    rules: Vec<CompiledRule>,
    registry: AggregatorRegistry,
    node_sharing: bool,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkBuilder {
    pub fn new() -> Self {
        let nodes = vec![
            Node { id: NodeId(0), kind: NodeKind::Root { children: Vec::new() }, rules: Vec::new() },
            Node { id: NodeId(1), kind: NodeKind::Dummy { sinks: Vec::new() }, rules: Vec::new() },
        ];
        Self {
            nodes,
            root: NodeId(0),
            dummy: NodeId(1),
            rules: Vec::new(),
            registry: AggregatorRegistry::default(),
            node_sharing: true,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new().with_node_sharing(config.node_sharing)
    }

    #[must_use]
    pub fn with_registry(mut self, registry: AggregatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_node_sharing(mut self, enabled: bool) -> Self {
        self.node_sharing = enabled;
        self
    }

    pub fn registry_mut(&mut self) -> &mut AggregatorRegistry {
        &mut self.registry
    }

    /// Compile a set of rules with the default builder
    pub fn compile(rules: &[RuleDefinition]) -> Result<ReteNetwork> {
        let mut builder = Self::new();
        builder.add_rules(rules)?;
        Ok(builder.build())
    }

    pub fn add_rules(&mut self, rules: &[RuleDefinition]) -> Result<()> {
        for rule in rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    /// Compile one rule into the network.
    ///
    /// On error the network is left as it was before the call.
    #[instrument(skip(self, rule), fields(rule = %rule.name))]
    pub fn add_rule(&mut self, rule: &RuleDefinition) -> Result<()> {
        info!("Adding rule to network");
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(ReteError::compilation(&rule.name, "a rule with this name already exists"));
        }
        let checkpoint = self.nodes.clone();
        match self.compile_rule(rule) {
            Ok(compiled) => {
                debug!(terminals = compiled.terminals.len(), nodes = self.nodes.len(), "Rule compiled");
                self.rules.push(compiled);
                Ok(())
            }
            Err(error) => {
                self.nodes = checkpoint;
                Err(error)
            }
        }
    }

    pub fn build(self) -> ReteNetwork {
        info!(nodes = self.nodes.len(), rules = self.rules.len(), "Built network");
        ReteNetwork::from_parts(self.nodes, self.root, self.dummy, self.rules)
    }

    fn compile_rule(&mut self, rule: &RuleDefinition) -> Result<CompiledRule> {
        let name = rule.name.as_str();
        let mut ends = Vec::new();
        let mut rule_declarations: Vec<Declaration> = Vec::new();
        for branch in normalize(rule)? {
            if matches!(&branch, RuleElement::And(children) if children.is_empty()) {
                return Err(ReteError::compilation(name, "left-hand side is empty"));
            }
            let mut ctx = BuildContext::default();
            self.visit(&mut ctx, name, &branch)?;
            if ctx.alpha_source.is_some() {
                self.build_join(&mut ctx, name, &[])?;
            }
            for declaration in &ctx.declarations {
                if !rule_declarations.contains(declaration) {
                    rule_declarations.push(declaration.clone());
                }
            }
            ends.push((ctx.beta_source.unwrap_or(self.dummy), ctx.declarations));
        }

        let declarations = Arc::new(rule_declarations);
        let mut terminals = Vec::with_capacity(ends.len());
        for (source, branch_declarations) in ends {
            let fact_map = branch_declarations.iter().map(|d| declarations.iter().position(|r| r == d)).collect();
            let terminal = self.push(
                NodeKind::Terminal { rule: name.to_string(), fact_map, declarations: Arc::clone(&declarations) },
                name,
            );
            self.add_sink(source, terminal);
            terminals.push(terminal);
        }
        Ok(CompiledRule { name: name.to_string(), declarations, terminals })
    }

    // ============================================================================
    // RULE ELEMENTS
    // ============================================================================

    fn visit(&mut self, ctx: &mut BuildContext, rule: &str, element: &RuleElement) -> Result<()> {
        match element {
            RuleElement::Pattern(pattern) => self.visit_pattern(ctx, rule, pattern),
            RuleElement::And(children) => {
                for child in children {
                    if ctx.alpha_source.is_some() {
                        self.build_join(ctx, rule, &[])?;
                    }
                    self.visit(ctx, rule, child)?;
                }
                Ok(())
            }
            RuleElement::Or(_) => Err(ReteError::compilation(rule, "'or' must be normalized before building")),
            RuleElement::Not(child) => {
                self.build_subnet(ctx, rule, |builder, sub| builder.visit(sub, rule, child))?;
                self.build_quantifier(ctx, rule, true)
            }
            RuleElement::Exists(child) => {
                self.build_subnet(ctx, rule, |builder, sub| builder.visit(sub, rule, child))?;
                self.build_quantifier(ctx, rule, false)
            }
            RuleElement::ForAll { base, patterns } => self.visit(ctx, rule, &desugar_forall(base, patterns)),
        }
    }

    fn visit_pattern(&mut self, ctx: &mut BuildContext, rule: &str, pattern: &PatternElement) -> Result<()> {
        match &pattern.source {
            None => {
                ctx.declarations.push(pattern.declaration.clone());
                let (alpha, beta): (Vec<&Condition>, Vec<&Condition>) =
                    pattern.conditions.iter().partition(|c| c.is_alpha_for(&pattern.declaration));

                let mut current = self.type_node(pattern.declaration.fact_type(), rule);
                for condition in alpha {
                    current = self.selection_node(current, condition, &pattern.declaration, rule)?;
                }
                ctx.alpha_source = Some(self.alpha_memory(current, rule));

                if !beta.is_empty() {
                    let beta: Vec<Condition> = beta.into_iter().cloned().collect();
                    self.build_join(ctx, rule, &beta)?;
                }
                Ok(())
            }
            Some(source) if !pattern.conditions.is_empty() => {
                self.build_subnet(ctx, rule, |builder, sub| builder.visit_source(sub, rule, source))?;
                ctx.declarations.push(pattern.declaration.clone());
                self.build_join(ctx, rule, &pattern.conditions)
            }
            Some(source) => {
                self.visit_source(ctx, rule, source)?;
                ctx.declarations.push(pattern.declaration.clone());
                Ok(())
            }
        }
    }

    fn visit_source(&mut self, ctx: &mut BuildContext, rule: &str, source: &PatternSource) -> Result<()> {
        if ctx.alpha_source.is_some() {
            self.build_join(ctx, rule, &[])?;
        }
        match source {
            PatternSource::Aggregate(aggregate) => {
                self.build_subnet(ctx, rule, |builder, sub| builder.visit_pattern(sub, rule, &aggregate.source))?;
                self.build_aggregate(ctx, rule, aggregate)
            }
            PatternSource::Binding(binding) => self.build_binding(ctx, rule, binding),
        }
    }

    /// Build a nested group from the current beta source and make its output the pending
    /// alpha source
    fn build_subnet<F>(&mut self, ctx: &mut BuildContext, rule: &str, visit: F) -> Result<()>
    where
        F: FnOnce(&mut Self, &mut BuildContext) -> Result<()>,
    {
        let mut sub = ctx.subnet();
        visit(self, &mut sub)?;

        if sub.alpha_source.is_some() && sub.beta_source == ctx.beta_source {
            ctx.alpha_source = sub.alpha_source;
            return Ok(());
        }
        if sub.alpha_source.is_some() {
            self.build_join(&mut sub, rule, &[])?;
        }
        let source = sub.beta_source.unwrap_or(self.dummy);
        ctx.alpha_source = Some(self.adapter(source, rule));
        ctx.has_subnet = true;
        Ok(())
    }

    // ============================================================================
    // ALPHA NODES
    // ============================================================================

    fn type_node(&mut self, fact_type: &FactType, rule: &str) -> NodeId {
        let existing = match &self.nodes[self.root.0].kind {
            NodeKind::Root { children } if self.node_sharing => children
                .iter()
                .copied()
                .find(|c| matches!(&self.nodes[c.0].kind, NodeKind::Type { fact_type: t, .. } if t == fact_type)),
            _ => None,
        };
        if let Some(id) = existing {
            return self.reuse(id, rule);
        }
        let id = self.push(NodeKind::Type { fact_type: fact_type.clone(), children: Vec::new(), memory: None }, rule);
        if let NodeKind::Root { children } = &mut self.nodes[self.root.0].kind {
            children.push(id);
        }
        id
    }

    fn selection_node(
        &mut self,
        parent: NodeId,
        condition: &Condition,
        declaration: &Declaration,
        rule: &str,
    ) -> Result<NodeId> {
        let Condition::Expression(lambda) = condition else {
            return Err(ReteError::compilation(rule, format!("'{}' is not a single-fact condition", condition.text())));
        };
        let condition = bind(rule, lambda, std::slice::from_ref(declaration))?;

        let existing = match &self.nodes[parent.0].kind {
            NodeKind::Type { children, .. } | NodeKind::Selection { children, .. } if self.node_sharing => {
                children.iter().copied().find(
                    |c| matches!(&self.nodes[c.0].kind, NodeKind::Selection { condition: e, .. } if *e == condition),
                )
            }
            _ => None,
        };
        if let Some(id) = existing {
            return Ok(self.reuse(id, rule));
        }
        let id = self.push(NodeKind::Selection { condition, children: Vec::new(), memory: None }, rule);
        if let NodeKind::Type { children, .. } | NodeKind::Selection { children, .. } = &mut self.nodes[parent.0].kind {
            children.push(id);
        }
        Ok(id)
    }

    fn alpha_memory(&mut self, parent: NodeId, rule: &str) -> NodeId {
        let existing = match &self.nodes[parent.0].kind {
            NodeKind::Type { memory, .. } | NodeKind::Selection { memory, .. } if self.node_sharing => *memory,
            _ => None,
        };
        if let Some(id) = existing {
            return self.reuse(id, rule);
        }
        let id = self.push(NodeKind::AlphaMemory { sinks: Vec::new() }, rule);
        if let NodeKind::Type { memory, .. } | NodeKind::Selection { memory, .. } = &mut self.nodes[parent.0].kind {
            *memory = Some(id);
        }
        id
    }

    // ============================================================================
    // BETA NODES
    // ============================================================================

    fn build_join(&mut self, ctx: &mut BuildContext, rule: &str, conditions: &[Condition]) -> Result<()> {
        let right = take_alpha_source(ctx, rule)?;
        let conditions = join_conditions(rule, conditions, &ctx.declarations)?;
        let left = ctx.beta_source.unwrap_or(self.dummy);
        let kind = NodeKind::Join { left, right, conditions, is_subnet: ctx.has_subnet, memory: UNALLOCATED };
        ctx.beta_source = Some(self.beta_node(kind, left, Some(right), rule));
        ctx.has_subnet = false;
        Ok(())
    }

    fn build_quantifier(&mut self, ctx: &mut BuildContext, rule: &str, negated: bool) -> Result<()> {
        let right = take_alpha_source(ctx, rule)?;
        let left = ctx.beta_source.unwrap_or(self.dummy);
        let is_subnet = ctx.has_subnet;
        let kind = if negated {
            NodeKind::Not { left, right, is_subnet, memory: UNALLOCATED }
        } else {
            NodeKind::Exists { left, right, is_subnet, memory: UNALLOCATED }
        };
        ctx.beta_source = Some(self.beta_node(kind, left, Some(right), rule));
        ctx.has_subnet = false;
        Ok(())
    }

    fn build_aggregate(&mut self, ctx: &mut BuildContext, rule: &str, aggregate: &AggregateElement) -> Result<()> {
        let right = take_alpha_source(ctx, rule)?;
        let factory = self
            .registry
            .get(&aggregate.aggregator)
            .map_err(|e| ReteError::compilation(rule, e.to_string()))?;

        let mut scope = ctx.declarations.clone();
        scope.push(aggregate.source.declaration.clone());
        let mut expressions = Vec::with_capacity(aggregate.selectors.len());
        for selector in &aggregate.selectors {
            expressions.push(AggregateExpression {
                name: selector.name.clone(),
                expression: bind(rule, &selector.lambda, &scope)?,
            });
        }
        let expressions = Arc::new(AggregateExpressions::new(expressions));
        factory
            .create(&expressions)
            .map_err(|e| ReteError::compilation(rule, format!("invalid '{}' aggregate: {e}", aggregate.aggregator)))?;

        let left = ctx.beta_source.unwrap_or(self.dummy);
        let spec = AggregateSpec {
            aggregator: aggregate.aggregator.clone(),
            factory,
            expressions,
            result_type: aggregate.result_type.clone(),
        };
        let kind = NodeKind::Aggregate { left, right, is_subnet: ctx.has_subnet, memory: UNALLOCATED, spec };
        ctx.beta_source = Some(self.beta_node(kind, left, Some(right), rule));
        ctx.has_subnet = false;
        Ok(())
    }

    fn build_binding(&mut self, ctx: &mut BuildContext, rule: &str, binding: &BindingElement) -> Result<()> {
        let expression = bind(rule, &binding.expression, &ctx.declarations)?;
        let left = ctx.beta_source.unwrap_or(self.dummy);
        let kind = NodeKind::Binding {
            left,
            expression,
            result_type: binding.result_type.clone(),
            memory: UNALLOCATED,
        };
        ctx.beta_source = Some(self.beta_node(kind, left, None, rule));
        Ok(())
    }

    /// Find or create a beta node and its output memory; returns the memory
    fn beta_node(&mut self, mut kind: NodeKind, left: NodeId, right: Option<NodeId>, rule: &str) -> NodeId {
        if self.node_sharing {
            let existing = self.sinks_of(left).iter().copied().find(|s| same_beta_node(&self.nodes[s.0].kind, &kind));
            if let Some(id) = existing {
                self.reuse(id, rule);
                if let Some(memory) = self.nodes[id.0].kind.output_memory() {
                    return self.reuse(memory, rule);
                }
            }
        }

        let node = NodeId(self.nodes.len());
        let memory = NodeId(node.0 + 1);
        set_output_memory(&mut kind, memory);
        let level = self.level_of(left) + 1;
        self.push(kind, rule);
        self.push(NodeKind::BetaMemory { level, sinks: Vec::new() }, rule);
        self.add_sink(left, node);
        if let Some(right) = right {
            self.add_sink(right, node);
        }
        memory
    }

    fn adapter(&mut self, source: NodeId, rule: &str) -> NodeId {
        if self.node_sharing {
            let existing = self
                .sinks_of(source)
                .iter()
                .copied()
                .find(|s| matches!(self.nodes[s.0].kind, NodeKind::Adapter { .. }));
            if let Some(id) = existing {
                return self.reuse(id, rule);
            }
        }
        let id = self.push(NodeKind::Adapter { source, sinks: Vec::new() }, rule);
        self.add_sink(source, id);
        id
    }

    // ============================================================================
    // GRAPH HELPERS
    // ============================================================================

    fn push(&mut self, kind: NodeKind, rule: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug!(node = %id, kind = kind.tag(), rule, "Created node");
        self.nodes.push(Node { id, kind, rules: vec![rule.to_string()] });
        id
    }

    fn reuse(&mut self, id: NodeId, rule: &str) -> NodeId {
        let node = &mut self.nodes[id.0];
        if !node.rules.iter().any(|r| r == rule) {
            debug!(node = %id, kind = node.kind.tag(), rule, "Reusing node");
            node.rules.push(rule.to_string());
        }
        id
    }

    fn add_sink(&mut self, source: NodeId, sink: NodeId) {
        match &mut self.nodes[source.0].kind {
            NodeKind::AlphaMemory { sinks }
            | NodeKind::Dummy { sinks }
            | NodeKind::BetaMemory { sinks, .. }
            | NodeKind::Adapter { sinks, .. } => sinks.push(sink),
            _ => {}
        }
    }

    fn sinks_of(&self, source: NodeId) -> &[NodeId] {
        match &self.nodes[source.0].kind {
            NodeKind::AlphaMemory { sinks }
            | NodeKind::Dummy { sinks }
            | NodeKind::BetaMemory { sinks, .. }
            | NodeKind::Adapter { sinks, .. } => sinks,
            _ => &[],
        }
    }

    fn level_of(&self, memory: NodeId) -> usize {
        match self.nodes[memory.0].kind {
            NodeKind::BetaMemory { level, .. } => level,
            _ => 0,
        }
    }
}

fn take_alpha_source(ctx: &mut BuildContext, rule: &str) -> Result<NodeId> {
    ctx.alpha_source.take().ok_or_else(|| ReteError::compilation(rule, "nothing to join: no pending fact source"))
}

fn bind<R>(rule: &str, lambda: &Lambda<R>, declarations: &[Declaration]) -> Result<BoundExpression<R>> {
    let map = FactIndexMap::new(lambda.parameters(), declarations).map_err(|unbound| {
        ReteError::compilation(rule, format!("'{}' refers to unbound declaration '{}'", lambda.text(), unbound.name()))
    })?;
    Ok(BoundExpression::new(lambda.clone(), map))
}

/// Compile pattern conditions against `declarations`, whose last entry is the right fact
fn join_conditions(rule: &str, conditions: &[Condition], declarations: &[Declaration]) -> Result<Vec<JoinCondition>> {
    let Some((current, tuple)) = declarations.split_last() else {
        return if conditions.is_empty() {
            Ok(Vec::new())
        } else {
            Err(ReteError::compilation(rule, "join conditions without a declaration"))
        };
    };
    conditions
        .iter()
        .map(|condition| match condition {
            Condition::Expression(lambda) => Ok(JoinCondition::Expression(bind(rule, lambda, declarations)?)),
            Condition::SameFact { left, right } => {
                let other = if right == current {
                    left
                } else if left == current {
                    right
                } else {
                    return Err(ReteError::compilation(
                        rule,
                        format!("'{}' must refer to the pattern's own declaration", condition.text()),
                    ));
                };
                let position = tuple.iter().position(|d| d == other).ok_or_else(|| {
                    ReteError::compilation(rule, format!("'{}' refers to unbound declaration '{}'", condition.text(), other.name()))
                })?;
                Ok(JoinCondition::SameFact { position })
            }
        })
        .collect()
}

fn set_output_memory(kind: &mut NodeKind, output: NodeId) {
    match kind {
        NodeKind::Join { memory, .. }
        | NodeKind::Not { memory, .. }
        | NodeKind::Exists { memory, .. }
        | NodeKind::Aggregate { memory, .. }
        | NodeKind::Binding { memory, .. } => *memory = output,
        _ => {}
    }
}

/// Structural equality of two beta nodes, ignoring their output memories
fn same_beta_node(existing: &NodeKind, candidate: &NodeKind) -> bool {
    match (existing, candidate) {
        (
            NodeKind::Join { left: l1, right: r1, conditions: c1, is_subnet: s1, .. },
            NodeKind::Join { left: l2, right: r2, conditions: c2, is_subnet: s2, .. },
        ) => l1 == l2 && r1 == r2 && c1 == c2 && s1 == s2,
        (
            NodeKind::Not { left: l1, right: r1, is_subnet: s1, .. },
            NodeKind::Not { left: l2, right: r2, is_subnet: s2, .. },
        )
        | (
            NodeKind::Exists { left: l1, right: r1, is_subnet: s1, .. },
            NodeKind::Exists { left: l2, right: r2, is_subnet: s2, .. },
        ) => l1 == l2 && r1 == r2 && s1 == s2,
        (
            NodeKind::Aggregate { left: l1, right: r1, is_subnet: s1, spec: a1, .. },
            NodeKind::Aggregate { left: l2, right: r2, is_subnet: s2, spec: a2, .. },
        ) => l1 == l2 && r1 == r2 && s1 == s2 && a1 == a2,
        (
            NodeKind::Binding { left: l1, expression: e1, result_type: t1, .. },
            NodeKind::Binding { left: l2, expression: e2, result_type: t2, .. },
        ) => l1 == l2 && e1 == e2 && t1 == t2,
        _ => false,
    }
}
