//! Rule evaluation errors.

use super::path::PathError;
use crate::store::StoreError;
use thiserror::Error;

/// Failure evaluating one binding rule
///
/// A failing rule is skipped; it never aborts the rest of the rule set.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("{object_type} {namespace}/{name} not found")]
    ReferenceNotFound {
        object_type: String,
        namespace: String,
        name: String,
    },

    #[error("key '{key}' not found in {object_type} {namespace}/{name}")]
    MissingReferenceKey {
        object_type: String,
        namespace: String,
        name: String,
        key: String,
    },

    #[error("invalid objectType '{object_type}' in rule '{rule}' (expected Secret or ConfigMap)")]
    InvalidObjectType { rule: String, object_type: String },

    #[error(transparent)]
    PathEval(#[from] PathError),

    #[error("malformed rule '{rule}': {reason}")]
    MalformedRule { rule: String, reason: String },

    #[error("lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl EvalError {
    /// Metric label for this error
    pub fn reason(&self) -> &'static str {
        match self {
            EvalError::ReferenceNotFound { .. } | EvalError::MissingReferenceKey { .. } => {
                "reference_not_found"
            }
            EvalError::InvalidObjectType { .. } => "invalid_object_type",
            EvalError::PathEval(_) => "path_eval",
            EvalError::MalformedRule { .. } => "malformed_rule",
            EvalError::Store(_) => "store",
        }
    }

    /// Whether the referenced object (or its key) was absent
    pub fn is_reference_not_found(&self) -> bool {
        matches!(
            self,
            EvalError::ReferenceNotFound { .. } | EvalError::MissingReferenceKey { .. }
        )
    }
}
