//! Error handling for the Reticle core
//!
//! Failures fall into three groups:
//!
//! - **Expression failures**: a user predicate, binding or aggregate selector returned an error.
//!   The failure is offered to the session's [`LhsErrorHandler`]; if the handler does not
//!   suppress it, it surfaces as [`ReteError::Evaluation`] and aborts the triggering mutation.
//! - **Protocol violations**: an aggregator was asked to modify or remove something it never
//!   saw. These always surface as [`ReteError::AggregationProtocol`].
//! - **Working memory misuse**: duplicate inserts and retracts of unknown facts.
//!
//! A mutation that returns an error may have partially propagated; the session should be
//! discarded or compensated by the caller.

use crate::fact::FactId;
use crate::rete_network::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Error type for all core network operations
#[derive(Error, Debug, Clone)]
pub enum ReteError {
    /// A user expression failed and the failure was not suppressed
    #[error("{0}")]
    Evaluation(Box<ExpressionFailure>),

    /// An aggregator received a delta inconsistent with its state
    #[error("Aggregation protocol violation in '{aggregator}': {message}")]
    AggregationProtocol { aggregator: String, message: String, fact: Option<FactId> },

    /// A rule could not be compiled into the network
    #[error("Rule compilation error in '{rule}': {message}")]
    Compilation { rule: String, message: String },

    /// A fact with the same identity is already in working memory
    #[error("Fact of type '{fact_type}' with identity {identity} is already present")]
    DuplicateFact { fact_type: String, identity: String },

    /// The fact is not (or no longer) in working memory
    #[error("Fact {fact} not found in working memory during {operation}")]
    MissingFact { fact: String, operation: &'static str },

    /// No aggregator factory is registered under the requested name
    #[error("Unknown aggregator '{name}'")]
    UnknownAggregator { name: String },

    /// Invalid engine configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String, setting: Option<String> },
}

impl ReteError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ReteError::Evaluation(_) => "evaluation",
            ReteError::AggregationProtocol { .. } => "aggregation_protocol",
            ReteError::Compilation { .. } => "compilation",
            ReteError::DuplicateFact { .. } => "duplicate_fact",
            ReteError::MissingFact { .. } => "missing_fact",
            ReteError::UnknownAggregator { .. } => "unknown_aggregator",
            ReteError::Configuration { .. } => "configuration",
        }
    }

    /// Create a compilation error for a rule
    pub fn compilation(rule: &str, message: impl Into<String>) -> Self {
        Self::Compilation { rule: rule.to_string(), message: message.into() }
    }

    /// Create an aggregation protocol error
    pub fn protocol(aggregator: &str, message: impl Into<String>, fact: Option<FactId>) -> Self {
        Self::AggregationProtocol { aggregator: aggregator.to_string(), message: message.into(), fact }
    }

    /// Create a missing fact error
    pub fn missing_fact(fact: impl fmt::Display, operation: &'static str) -> Self {
        Self::MissingFact { fact: fact.to_string(), operation }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into(), setting: None }
    }

    /// The expression failure behind an evaluation error, if any
    pub fn expression_failure(&self) -> Option<&ExpressionFailure> {
        match self {
            ReteError::Evaluation(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, ReteError>;

/// Where in the network an expression was evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpressionKind {
    /// Single-fact selection condition
    Selection,
    /// Join condition between a tuple and a fact
    Join,
    /// Binding expression
    Binding,
    /// Aggregate key, element or projection selector
    Aggregate,
}

impl fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionKind::Selection => write!(f, "selection"),
            ExpressionKind::Join => write!(f, "join"),
            ExpressionKind::Binding => write!(f, "binding"),
            ExpressionKind::Aggregate => write!(f, "aggregate"),
        }
    }
}

/// Details of a failed user expression
#[derive(Debug, Clone)]
pub struct ExpressionFailure {
    pub kind: ExpressionKind,
    pub expression: String,
    pub node: NodeId,
    /// Facts the expression was evaluated against, oldest first
    pub facts: Vec<FactId>,
    pub message: String,
}

impl ExpressionFailure {
    pub(crate) fn new(
        kind: ExpressionKind,
        expression: &str,
        node: NodeId,
        facts: Vec<FactId>,
        error: &anyhow::Error,
    ) -> Self {
        Self { kind, expression: expression.to_string(), node, facts, message: format!("{error:#}") }
    }
}

impl fmt::Display for ExpressionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to evaluate {} expression '{}' at node {}: {}",
            self.kind, self.expression, self.node, self.message
        )
    }
}

/// Decision returned by an [`LhsErrorHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Continue as if the expression did not match
    Handled,
    /// Abort the mutation with [`ReteError::Evaluation`]
    Fatal,
}

/// Hook consulted whenever a left-hand-side expression fails.
///
/// A handled failure means: selection and join conditions evaluate to false, a binding
/// produces no fact, and an aggregate is faulted for the owning tuple until that tuple is
/// updated again.
pub trait LhsErrorHandler: Send + Sync {
    fn on_expression_failed(&self, failure: &ExpressionFailure) -> FailureDisposition;
}

/// Propagates every failure
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl LhsErrorHandler for FailFast {
    fn on_expression_failed(&self, _failure: &ExpressionFailure) -> FailureDisposition {
        FailureDisposition::Fatal
    }
}

/// Suppresses every failure, logging it at warn level
#[derive(Debug, Default, Clone, Copy)]
pub struct SuppressFailures;

impl LhsErrorHandler for SuppressFailures {
    fn on_expression_failed(&self, failure: &ExpressionFailure) -> FailureDisposition {
        warn!(
            node = %failure.node,
            kind = %failure.kind,
            expression = %failure.expression,
            "Suppressed expression failure: {}",
            failure.message
        );
        FailureDisposition::Handled
    }
}

impl<F> LhsErrorHandler for F
where
    F: Fn(&ExpressionFailure) -> FailureDisposition + Send + Sync,
{
    fn on_expression_failed(&self, failure: &ExpressionFailure) -> FailureDisposition {
        self(failure)
    }
}

/// Route a failure through the handler. `Ok(())` means it was suppressed.
pub(crate) fn dispose(handler: &dyn LhsErrorHandler, failure: ExpressionFailure) -> Result<()> {
    match handler.on_expression_failed(&failure) {
        FailureDisposition::Handled => Ok(()),
        FailureDisposition::Fatal => Err(ReteError::Evaluation(Box::new(failure))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> ExpressionFailure {
        ExpressionFailure::new(
            ExpressionKind::Join,
            "h.account_id == a.id",
            NodeId(4),
            vec![FactId(1), FactId(2)],
            &anyhow::anyhow!("field 'account_id' not found"),
        )
    }

    #[test]
    fn test_error_categories() {
        let err = ReteError::compilation("overdraft", "unbound declaration 'x'");
        assert_eq!(err.category(), "compilation");
        assert!(err.to_string().contains("overdraft"));

        let err = ReteError::protocol("collect", "fact was never added", Some(FactId(9)));
        assert_eq!(err.category(), "aggregation_protocol");
    }

    #[test]
    fn test_evaluation_error_carries_expression_text() {
        let err = dispose(&FailFast, failure()).unwrap_err();
        assert_eq!(err.category(), "evaluation");
        assert!(err.to_string().contains("h.account_id == a.id"));
        assert_eq!(err.expression_failure().unwrap().facts, vec![FactId(1), FactId(2)]);
    }

    #[test]
    fn test_handlers_decide_disposition() {
        assert!(dispose(&SuppressFailures, failure()).is_ok());

        let only_joins = |f: &ExpressionFailure| {
            if f.kind == ExpressionKind::Join {
                FailureDisposition::Handled
            } else {
                FailureDisposition::Fatal
            }
        };
        assert!(dispose(&only_joins, failure()).is_ok());
    }
}
