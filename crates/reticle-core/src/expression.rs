//! Compiled rule expressions
//!
//! Conditions, bindings and aggregate selectors reach the network as opaque callables
//! ([`Lambda`]) that take their arguments positionally. The network binds each callable to
//! the facts of a tuple through a [`FactIndexMap`], built once when the rule is compiled.
//!
//! Two lambdas are equal when their source text and parameter declarations are equal; node
//! sharing relies on this, closure identity is never compared.

use crate::error::{ExpressionFailure, ExpressionKind};
use crate::fact::FactId;
use crate::model::Declaration;
use crate::rete_network::NodeId;
use crate::tuple::TupleId;
use crate::working_memory::WorkingMemory;
use reticle_types::FactValue;
use std::fmt;
use std::sync::Arc;

type LambdaFn<R> = dyn Fn(&[&FactValue]) -> anyhow::Result<R> + Send + Sync;

/// A user-supplied function over the values bound to its parameters
pub struct Lambda<R> {
    text: String,
    parameters: Vec<Declaration>,
    func: Arc<LambdaFn<R>>,
}

impl<R> Lambda<R> {
    pub fn new<F>(text: impl Into<String>, parameters: Vec<Declaration>, func: F) -> Self
    where
        F: Fn(&[&FactValue]) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self { text: text.into(), parameters, func: Arc::new(func) }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &[Declaration] {
        &self.parameters
    }

    /// Whether every parameter refers to `declaration`
    pub fn references_only(&self, declaration: &Declaration) -> bool {
        self.parameters.iter().all(|p| p == declaration)
    }

    pub fn invoke(&self, args: &[&FactValue]) -> anyhow::Result<R> {
        (self.func)(args)
    }
}

impl<R> Clone for Lambda<R> {
    fn clone(&self) -> Self {
        Self { text: self.text.clone(), parameters: self.parameters.clone(), func: Arc::clone(&self.func) }
    }
}

impl<R> PartialEq for Lambda<R> {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.parameters == other.parameters
    }
}

impl<R> Eq for Lambda<R> {}

impl<R> fmt::Debug for Lambda<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("text", &self.text)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl<R> fmt::Display for Lambda<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Maps tuple positions to lambda argument slots.
///
/// Position `i` is the `i`-th fact of the tuple in declaration order (oldest first); the
/// position after the last tuple fact is the right fact of the node, if any. `None` marks a
/// fact the lambda does not use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FactIndexMap {
    slots: Vec<Option<usize>>,
}

impl FactIndexMap {
    /// Build the map for `parameters` given the declarations visible at a node.
    ///
    /// Returns the first parameter that is not among `declarations` as the error.
    pub fn new(parameters: &[Declaration], declarations: &[Declaration]) -> Result<Self, Declaration> {
        if let Some(unbound) = parameters.iter().find(|p| !declarations.contains(p)) {
            return Err(unbound.clone());
        }
        let slots = declarations
            .iter()
            .map(|d| parameters.iter().position(|p| p == d))
            .collect();
        Ok(Self { slots })
    }

    /// Map to a single slot at `position`
    pub fn single(position: usize) -> Self {
        let mut slots = vec![None; position + 1];
        slots[position] = Some(0);
        Self { slots }
    }

    pub fn slot(&self, position: usize) -> Option<usize> {
        self.slots.get(position).copied().flatten()
    }

    pub fn positions(&self) -> usize {
        self.slots.len()
    }

    /// Reorder `facts` (declaration order) into argument order
    pub fn arguments<T: Copy>(&self, facts: &[T], arity: usize) -> Option<Vec<T>> {
        let mut args: Vec<Option<T>> = vec![None; arity];
        for (position, fact) in facts.iter().enumerate() {
            if let Some(slot) = self.slot(position) {
                if slot < arity {
                    args[slot] = Some(*fact);
                }
            }
        }
        args.into_iter().collect()
    }
}

/// A lambda bound to tuple positions for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundExpression<R> {
    pub lambda: Lambda<R>,
    pub map: FactIndexMap,
}

impl<R> BoundExpression<R> {
    pub fn new(lambda: Lambda<R>, map: FactIndexMap) -> Self {
        Self { lambda, map }
    }

    pub fn text(&self) -> &str {
        self.lambda.text()
    }

    /// Evaluate against a tuple and an optional right fact.
    ///
    /// Fact values are resolved through wrappers. Any failure, including a missing
    /// argument, is reported as an [`ExpressionFailure`] for the caller to dispose of.
    pub(crate) fn evaluate(
        &self,
        memory: &WorkingMemory,
        kind: ExpressionKind,
        node: NodeId,
        tuple: Option<TupleId>,
        right: Option<FactId>,
    ) -> Result<R, ExpressionFailure> {
        let mut facts = tuple.map(|t| memory.tuple_facts(t)).unwrap_or_default();
        facts.extend(right);

        let fail = |facts: Vec<FactId>, error: anyhow::Error| {
            ExpressionFailure::new(kind, self.lambda.text(), node, facts, &error)
        };

        let arity = self.lambda.parameters().len();
        let Some(arg_facts) = self.map.arguments(&facts, arity) else {
            let error = anyhow::anyhow!("expected {arity} bound arguments");
            return Err(fail(facts, error));
        };
        let mut values = Vec::with_capacity(arity);
        for fact in &arg_facts {
            match memory.value_of(*fact) {
                Some(value) => values.push(value),
                None => {
                    let error = anyhow::anyhow!("fact {fact} is not in working memory");
                    return Err(fail(facts, error));
                }
            }
        }
        self.lambda.invoke(&values).map_err(|error| fail(facts.clone(), error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reticle_types::FactType;

    fn decl(name: &str) -> Declaration {
        Declaration::new(name, FactType::new("T"))
    }

    #[test]
    fn test_lambda_equality_ignores_closure() {
        let a = Lambda::new("x > 1", vec![decl("x")], |_| Ok(true));
        let b = Lambda::new("x > 1", vec![decl("x")], |_| Ok(false));
        let c = Lambda::new("x > 1", vec![decl("y")], |_| Ok(true));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_index_map_orders_arguments() {
        let declarations = [decl("a"), decl("b"), decl("c")];
        let map = FactIndexMap::new(&[decl("c"), decl("a")], &declarations).unwrap();
        assert_eq!(map.slot(0), Some(1));
        assert_eq!(map.slot(1), None);
        assert_eq!(map.slot(2), Some(0));
        assert_eq!(map.arguments(&[10, 20, 30], 2), Some(vec![30, 10]));
        assert_eq!(map.arguments(&[10, 20], 2), None);
    }

    #[test]
    fn test_index_map_rejects_unbound_parameter() {
        let err = FactIndexMap::new(&[decl("z")], &[decl("a")]).unwrap_err();
        assert_eq!(err.name(), "z");
    }
}
