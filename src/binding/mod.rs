//! # Binding Rules
//!
//! Turns a BindingConfig's rule set plus one instance into derived binding data.
//!
//! - `path.rs` - field path parsing and evaluation
//! - `rule.rs` - rule grammar (literal, `path=`, reference)
//! - `evaluate.rs` - evaluates one rule, including object lookups
//! - `materialize.rs` - evaluates a rule set and persists the artifact Secret

mod error;
pub mod evaluate;
pub mod materialize;
pub mod path;
pub mod rule;

pub use error::EvalError;
pub use evaluate::{evaluate, evaluate_expr, Bindings};
pub use materialize::{materialize, persist, DerivedArtifact, PersistOutcome};
pub use path::{FieldPath, PathError};
pub use rule::{ObjectType, ReferenceRule, Rule};
