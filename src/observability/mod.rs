//! # Observability
//!
//! - `metrics`: Prometheus metrics collection
//! - `logging`: log subscriber setup

pub mod logging;
pub mod metrics;

pub use logging::init_tracing;
