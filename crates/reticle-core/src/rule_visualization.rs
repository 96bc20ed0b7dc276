//! Network schema export
//!
//! A read-only snapshot of a compiled network's topology for diagnostics tooling: every node
//! with its type tag, the rules that use it and the expression text it evaluates, plus typed
//! links between nodes. The snapshot serializes to JSON and renders to Graphviz DOT or Mermaid.

use crate::rete_network::{NodeId, NodeKind, ReteNetwork};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing::debug;

/// Role of an edge in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Alpha node to a more specific alpha node
    Child,
    /// Alpha node to the memory collecting its facts
    Memory,
    /// Tuple source to the left input of a beta node
    Left,
    /// Fact source to the right input of a beta node
    Right,
    /// Beta node to its output memory
    Output,
    /// Beta memory to the adapter publishing its tuples
    Subnet,
    /// Beta memory to a rule terminal
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaNode {
    pub id: NodeId,
    pub tag: String,
    pub rules: Vec<String>,
    pub expressions: Vec<String>,
    /// Tuple level of beta memories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<usize>,
    /// Whether the node takes its right input from a subnet adapter
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub subnet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLink {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: LinkKind,
}

/// Visualization output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizationFormat {
    /// Graphviz DOT format
    Graphviz,
    /// Mermaid diagram format
    Mermaid,
    /// Pretty-printed JSON
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSchema {
    pub nodes: Vec<SchemaNode>,
    pub links: Vec<SchemaLink>,
}

impl NetworkSchema {
    pub fn from_network(network: &ReteNetwork) -> Self {
        let mut schema = Self::default();
        for node in network.nodes() {
            let (level, subnet) = match &node.kind {
                NodeKind::BetaMemory { level, .. } => (Some(*level), false),
                NodeKind::Join { is_subnet, .. }
                | NodeKind::Not { is_subnet, .. }
                | NodeKind::Exists { is_subnet, .. }
                | NodeKind::Aggregate { is_subnet, .. } => (None, *is_subnet),
                _ => (None, false),
            };
            schema.nodes.push(SchemaNode {
                id: node.id,
                tag: node.kind.tag().to_string(),
                rules: node.rules.clone(),
                expressions: node.kind.expressions(),
                level,
                subnet,
            });
            for target in node.kind.successors() {
                let kind = link_kind(&node.kind, &network.node(target).kind, target);
                schema.links.push(SchemaLink { source: node.id, target, kind });
            }
        }
        debug!(nodes = schema.nodes.len(), links = schema.links.len(), "Exported network schema");
        schema
    }

    pub fn node(&self, id: NodeId) -> Option<&SchemaNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Links leaving `id`
    pub fn links_from(&self, id: NodeId) -> impl Iterator<Item = &SchemaLink> {
        self.links.iter().filter(move |l| l.source == id)
    }

    pub fn generate(&self, format: VisualizationFormat) -> anyhow::Result<String> {
        match format {
            VisualizationFormat::Graphviz => self.to_dot(),
            VisualizationFormat::Mermaid => self.to_mermaid(),
            VisualizationFormat::Json => Ok(serde_json::to_string_pretty(self)?),
        }
    }

    /// Generate Graphviz DOT format
    pub fn to_dot(&self) -> anyhow::Result<String> {
        let mut dot = String::new();

        writeln!(dot, "digraph ReteNetwork {{")?;
        writeln!(dot, "  rankdir=TB;")?;
        writeln!(dot, "  node [shape=box, style=\"rounded,filled\"];")?;

        for node in &self.nodes {
            let color = match node.tag.as_str() {
                "root" | "type" | "selection" => "lightblue",
                "alpha_memory" | "beta_memory" | "dummy" => "lightgray",
                "terminal" => "lightgreen",
                "adapter" => "orange",
                _ => "khaki",
            };
            let mut label = format!("{} {}", node.id, node.tag);
            for expression in &node.expressions {
                write!(label, "\\n{}", escape(expression))?;
            }
            writeln!(dot, "  {} [label=\"{label}\", fillcolor={color}];", node.id)?;
        }

        for link in &self.links {
            let style = match link.kind {
                LinkKind::Right => "style=dashed",
                LinkKind::Subnet => "style=dotted",
                _ => "style=solid",
            };
            writeln!(dot, "  {} -> {} [{style}];", link.source, link.target)?;
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }

    /// Generate Mermaid diagram format
    pub fn to_mermaid(&self) -> anyhow::Result<String> {
        let mut mermaid = String::new();

        writeln!(mermaid, "graph TD")?;
        for node in &self.nodes {
            writeln!(mermaid, "  {}[\"{} {}\"]", node.id, node.id, node.tag)?;
        }
        for link in &self.links {
            let arrow = if link.kind == LinkKind::Right { "-.->" } else { "-->" };
            writeln!(mermaid, "  {} {arrow} {}", link.source, link.target)?;
        }
        Ok(mermaid)
    }
}

impl ReteNetwork {
    pub fn schema(&self) -> NetworkSchema {
        NetworkSchema::from_network(self)
    }
}

fn link_kind(source: &NodeKind, target: &NodeKind, target_id: NodeId) -> LinkKind {
    match source {
        NodeKind::Root { .. } => LinkKind::Child,
        NodeKind::Type { memory, .. } | NodeKind::Selection { memory, .. } => {
            if *memory == Some(target_id) {
                LinkKind::Memory
            } else {
                LinkKind::Child
            }
        }
        NodeKind::AlphaMemory { .. } | NodeKind::Adapter { .. } => LinkKind::Right,
        NodeKind::Dummy { .. } | NodeKind::BetaMemory { .. } => match target {
            NodeKind::Adapter { .. } => LinkKind::Subnet,
            NodeKind::Terminal { .. } => LinkKind::Terminal,
            _ => LinkKind::Left,
        },
        _ => LinkKind::Output,
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PatternElement, RuleDefinition, RuleElement};
    use crate::network_builder::NetworkBuilder;
    use reticle_types::FactType;

    fn network() -> ReteNetwork {
        let account = FactType::new("Account");
        let hold = FactType::new("Hold");
        let a = PatternElement::of("a", &account);
        let a_decl = a.declaration.clone();
        let a = a.filter("a.balance < 0", vec![a_decl.clone()], |args| Ok(args[0].field_i64("balance")? < 0));
        let h = PatternElement::of("h", &hold);
        let h_decl = h.declaration.clone();
        let h = h.filter("h.account_id == a.id", vec![h_decl, a_decl], |args| {
            Ok(args[0].get("account_id") == args[1].get("id"))
        });
        let lhs = RuleElement::And(vec![a.into(), RuleElement::not(h.into())]);
        NetworkBuilder::compile(&[RuleDefinition::new("overdraft", lhs)]).unwrap()
    }

    #[test]
    fn test_schema_covers_every_node() {
        let network = network();
        let schema = network.schema();
        assert_eq!(schema.nodes.len(), network.nodes().len());

        let not = network.nodes_of("not")[0];
        let node = schema.node(not).unwrap();
        assert!(node.subnet);
        assert_eq!(node.rules, vec!["overdraft".to_string()]);

        let kinds: Vec<LinkKind> = schema.links_from(not).map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LinkKind::Output]);
        assert!(schema.links.iter().any(|l| l.kind == LinkKind::Subnet));
        assert!(schema.links.iter().any(|l| l.kind == LinkKind::Terminal));
    }

    #[test]
    fn test_json_round_trip() {
        let schema = network().schema();
        let json = schema.generate(VisualizationFormat::Json).unwrap();
        let parsed: NetworkSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, schema);
        assert!(json.contains("h.account_id == a.id"));
    }

    #[test]
    fn test_dot_output() {
        let dot = network().schema().generate(VisualizationFormat::Graphviz).unwrap();
        assert!(dot.starts_with("digraph ReteNetwork {"));
        assert!(dot.contains("n0 -> n2"));
        assert!(dot.contains("style=dashed"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
