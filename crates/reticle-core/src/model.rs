//! Canonical rule model
//!
//! The network consumes rules in this already-validated form: a tree of rule elements over
//! named declarations, with every condition and selector supplied as a [`Lambda`]. Front-ends
//! that produce the tree (DSLs, builders, expression compilers) live outside this crate.

use crate::expression::Lambda;
use reticle_types::{FactType, FactValue};
use std::fmt;

/// A named variable bound to one fact of a pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Declaration {
    name: String,
    fact_type: FactType,
}

impl Declaration {
    pub fn new(name: impl Into<String>, fact_type: FactType) -> Self {
        Self { name: name.into(), fact_type }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fact_type(&self) -> &FactType {
        &self.fact_type
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.fact_type)
    }
}

/// A boolean test inside a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// User predicate over one or more declarations
    Expression(Lambda<bool>),
    /// Both declarations bind the very same fact
    SameFact { left: Declaration, right: Declaration },
}

impl Condition {
    pub fn expression<F>(text: impl Into<String>, parameters: Vec<Declaration>, func: F) -> Self
    where
        F: Fn(&[&FactValue]) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::Expression(Lambda::new(text, parameters, func))
    }

    pub fn references(&self) -> Vec<&Declaration> {
        match self {
            Condition::Expression(lambda) => lambda.parameters().iter().collect(),
            Condition::SameFact { left, right } => vec![left, right],
        }
    }

    /// Whether the condition can be tested on `declaration` alone
    pub fn is_alpha_for(&self, declaration: &Declaration) -> bool {
        match self {
            Condition::Expression(lambda) => lambda.references_only(declaration),
            Condition::SameFact { .. } => false,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Condition::Expression(lambda) => lambda.text().to_string(),
            Condition::SameFact { left, right } => format!("{} is {}", left.name(), right.name()),
        }
    }
}

/// A named selector passed to an aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSelector {
    pub name: String,
    pub lambda: Lambda<FactValue>,
}

impl AggregateSelector {
    pub fn new(name: impl Into<String>, lambda: Lambda<FactValue>) -> Self {
        Self { name: name.into(), lambda }
    }
}

/// Aggregation of the facts matched by a source pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateElement {
    /// Registered aggregator name, e.g. `collect` or `group_by`
    pub aggregator: String,
    pub source: Box<PatternElement>,
    pub selectors: Vec<AggregateSelector>,
    pub result_type: FactType,
}

impl AggregateElement {
    pub fn new(aggregator: impl Into<String>, source: PatternElement, result_type: FactType) -> Self {
        Self { aggregator: aggregator.into(), source: Box::new(source), selectors: Vec::new(), result_type }
    }

    #[must_use]
    pub fn with_selector(mut self, name: impl Into<String>, lambda: Lambda<FactValue>) -> Self {
        self.selectors.push(AggregateSelector::new(name, lambda));
        self
    }
}

/// A value computed from the declarations bound so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingElement {
    pub expression: Lambda<FactValue>,
    pub result_type: FactType,
}

/// Where a pattern draws its facts from when not from working memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    Aggregate(AggregateElement),
    Binding(BindingElement),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternElement {
    pub declaration: Declaration,
    pub conditions: Vec<Condition>,
    pub source: Option<PatternSource>,
}

impl PatternElement {
    pub fn new(declaration: Declaration) -> Self {
        Self { declaration, conditions: Vec::new(), source: None }
    }

    /// Shorthand for a pattern over `fact_type` bound to `name`
    pub fn of(name: &str, fact_type: &FactType) -> Self {
        Self::new(Declaration::new(name, fact_type.clone()))
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add a predicate over the listed declarations
    #[must_use]
    pub fn filter<F>(self, text: &str, parameters: Vec<Declaration>, func: F) -> Self
    where
        F: Fn(&[&FactValue]) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.with_condition(Condition::expression(text, parameters, func))
    }

    #[must_use]
    pub fn from_aggregate(mut self, aggregate: AggregateElement) -> Self {
        self.source = Some(PatternSource::Aggregate(aggregate));
        self
    }

    #[must_use]
    pub fn from_binding(mut self, expression: Lambda<FactValue>) -> Self {
        let result_type = self.declaration.fact_type().clone();
        self.source = Some(PatternSource::Binding(BindingElement { expression, result_type }));
        self
    }
}

/// Left-hand-side element tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleElement {
    Pattern(PatternElement),
    And(Vec<RuleElement>),
    Or(Vec<RuleElement>),
    Not(Box<RuleElement>),
    Exists(Box<RuleElement>),
    /// Every fact matching `base` also matches each of `patterns`
    ForAll { base: PatternElement, patterns: Vec<PatternElement> },
}

impl RuleElement {
    pub fn not(element: RuleElement) -> Self {
        Self::Not(Box::new(element))
    }

    pub fn exists(element: RuleElement) -> Self {
        Self::Exists(Box::new(element))
    }

    /// Short name used in logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            RuleElement::Pattern(_) => "pattern",
            RuleElement::And(_) => "and",
            RuleElement::Or(_) => "or",
            RuleElement::Not(_) => "not",
            RuleElement::Exists(_) => "exists",
            RuleElement::ForAll { .. } => "forall",
        }
    }
}

impl From<PatternElement> for RuleElement {
    fn from(pattern: PatternElement) -> Self {
        Self::Pattern(pattern)
    }
}

#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub name: String,
    pub lhs: RuleElement,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, lhs: RuleElement) -> Self {
        Self { name: name.into(), lhs }
    }
}
