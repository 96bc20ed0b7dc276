//! Reticle Types
//!
//! Value and type definitions shared by the Reticle crates. Facts carry a `FactValue`
//! payload and a nominal `FactType`; aggregation results reuse the same value model so
//! that downstream patterns can match on them like any other fact.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod fact_type;
mod types;

pub use fact_type::FactType;
pub use types::{FactValue, Grouping};
