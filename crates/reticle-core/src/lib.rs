#![warn(clippy::all)]
#![allow(missing_docs)]
//! Core of the Reticle forward-chaining rules engine.
//!
//! This crate compiles rules into a Rete network and keeps the network's matches current as
//! facts are inserted, updated and retracted. It provides the alpha and beta networks, an
//! aggregation framework (collect, sort, group-by, lookup, project, flatten and custom
//! aggregators), the network builder with node sharing, per-session working memory and a
//! session harness that reports rule matches to an agenda.
//!
//! ```text
//! RuleDefinition ─► NetworkBuilder ─► Arc<ReteNetwork> ─► Session (WorkingMemory + Agenda)
//! ```
//!
//! The rule-firing loop, conflict resolution and rule actions are outside this crate.

/// Terminal notifications and the recording agenda
pub mod agenda;
/// Aggregator protocol and built-in aggregators
pub mod aggregation;
/// Alpha memory contents
pub mod alpha_memory;
/// Beta memory contents
pub mod beta_memory;
/// Engine configuration
pub mod config;
/// Error types and expression failure handling
pub mod error;
/// Compiled rule expressions
pub mod expression;
/// Facts held by working memory
pub mod fact;
/// Fact identity strategies
pub mod identity;
/// Canonical rule model
pub mod model;
/// Rule compilation into the network
pub mod network_builder;
/// Compiled network and propagation entry points
pub mod rete_network;
/// Network schema export
pub mod rule_visualization;
/// Matching sessions
pub mod session;
/// Node-local state
pub mod state;
/// Fixtures for tests and benchmarks
pub mod test_utils;
/// Rule tree rewrites
pub mod transform;
/// Tuples and id generation
pub mod tuple;
/// Per-session mutable state
pub mod working_memory;

mod aggregate_node;
mod alpha_network;
mod beta_network;
mod binding_node;

pub use agenda::{Activation, ActivationSink, Agenda, AgendaEvent};
pub use aggregation::{AggregationAction, AggregationResult, Aggregator, AggregatorFactory, AggregatorRegistry};
pub use config::EngineConfig;
pub use error::{ExpressionFailure, FailureDisposition, LhsErrorHandler, ReteError, Result};
pub use expression::Lambda;
pub use fact::{Fact, FactId};
pub use identity::{IdentityComparer, IdentityStrategy};
pub use model::{Condition, Declaration, PatternElement, RuleDefinition, RuleElement};
pub use network_builder::NetworkBuilder;
pub use rete_network::{NetworkStats, NodeId, ReteNetwork};
pub use rule_visualization::NetworkSchema;
pub use session::Session;
pub use tuple::TupleId;

pub use reticle_types::{FactType, FactValue, Grouping};
