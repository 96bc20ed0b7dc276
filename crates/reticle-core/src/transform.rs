//! Rule tree rewrites applied before network construction
//!
//! The beta network has no node for disjunction and no node for universal quantification.
//! Both are rewritten away here:
//!
//! ```text
//! ForAll(base, p1, p2)  =>  Not(And(base, Not(And(p1 + [p1 is base], p2 + [p2 is base]))))
//! And(a, Or(b, c))      =>  Or(And(a, b), And(a, c))
//! Not(Or(a, b))         =>  And(Not(a), Not(b))
//! ```
//!
//! The result of [`normalize`] is the list of `And` branches of the top-level `Or`; each
//! branch gets its own terminal node.

use crate::error::{ReteError, Result};
use crate::model::{Condition, PatternElement, RuleDefinition, RuleElement};
use tracing::debug;

/// Rewrite a rule's left-hand side into Or-free `And` branches
pub fn normalize(rule: &RuleDefinition) -> Result<Vec<RuleElement>> {
    let branches = alternatives(&rule.name, &rule.lhs)?;
    if branches.is_empty() {
        return Err(ReteError::compilation(&rule.name, "left-hand side has no alternatives"));
    }
    debug!(rule = %rule.name, branches = branches.len(), "Normalized rule");
    Ok(branches
        .into_iter()
        .map(|branch| match branch {
            RuleElement::And(_) => branch,
            other => RuleElement::And(vec![other]),
        })
        .collect())
}

/// Desugar a universal quantifier into nested negations
pub fn desugar_forall(base: &PatternElement, patterns: &[PatternElement]) -> RuleElement {
    let constrained = patterns
        .iter()
        .map(|pattern| {
            let identity = Condition::SameFact {
                left: base.declaration.clone(),
                right: pattern.declaration.clone(),
            };
            RuleElement::Pattern(pattern.clone().with_condition(identity))
        })
        .collect();
    RuleElement::not(RuleElement::And(vec![
        RuleElement::Pattern(base.clone()),
        RuleElement::not(RuleElement::And(constrained)),
    ]))
}

fn alternatives(rule: &str, element: &RuleElement) -> Result<Vec<RuleElement>> {
    match element {
        RuleElement::Pattern(_) => Ok(vec![element.clone()]),
        RuleElement::And(children) => {
            let mut product: Vec<Vec<RuleElement>> = vec![Vec::new()];
            for child in children {
                let options = alternatives(rule, child)?;
                let mut next = Vec::with_capacity(product.len() * options.len());
                for prefix in &product {
                    for option in &options {
                        let mut combined = prefix.clone();
                        match option {
                            RuleElement::And(inner) => combined.extend(inner.iter().cloned()),
                            other => combined.push(other.clone()),
                        }
                        next.push(combined);
                    }
                }
                product = next;
            }
            Ok(product.into_iter().map(RuleElement::And).collect())
        }
        RuleElement::Or(children) => {
            let mut result = Vec::new();
            for child in children {
                result.extend(alternatives(rule, child)?);
            }
            Ok(result)
        }
        RuleElement::Not(child) => {
            let options = alternatives(rule, child)?;
            match options.len() {
                0 => Err(ReteError::compilation(rule, "empty group under 'not'")),
                1 => Ok(options.into_iter().map(RuleElement::not).collect()),
                _ => Ok(vec![RuleElement::And(options.into_iter().map(RuleElement::not).collect())]),
            }
        }
        RuleElement::Exists(child) => {
            let mut options = alternatives(rule, child)?;
            match options.len() {
                1 => Ok(vec![RuleElement::exists(options.remove(0))]),
                0 => Err(ReteError::compilation(rule, "empty group under 'exists'")),
                _ => Err(ReteError::compilation(rule, "'or' is not supported under 'exists'")),
            }
        }
        RuleElement::ForAll { base, patterns } => {
            if patterns.is_empty() {
                return Err(ReteError::compilation(rule, "'forall' needs at least one pattern"));
            }
            alternatives(rule, &desugar_forall(base, patterns))
        }
    }
}
