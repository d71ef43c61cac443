//! # Configuration
//!
//! Controller configuration loaded from environment variables.
//! Environment variables are populated from a ConfigMap using `envFrom` in the deployment.

mod controller;

pub use controller::{ControllerConfig, LogFormat};
