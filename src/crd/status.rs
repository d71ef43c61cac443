//! # Status Types
//!
//! Status recorded on BindingConfig resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a BindingConfig
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// Every discovered instance was materialized
    Ready,
    /// The pass completed but some instances failed
    Degraded,
    /// The pass could not run (kind resolution or store failure)
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Ready => "Ready",
            Phase::Degraded => "Degraded",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Status of a BindingConfig resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq)]
pub struct BindingConfigStatus {
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Number of InstanceProxies materialized by the last pass
    #[serde(default)]
    pub instances: Option<i32>,
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition in the usual Kubernetes shape
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Build the `Ready` condition for a phase
    pub fn ready(phase: Phase, message: &str, now: &str) -> Self {
        Self {
            r#type: "Ready".to_string(),
            status: if phase == Phase::Ready { "True" } else { "False" }.to_string(),
            last_transition_time: Some(now.to_string()),
            reason: Some(phase.to_string()),
            message: Some(message.to_string()),
        }
    }
}
