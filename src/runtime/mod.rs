//! # Runtime
//!
//! Process-level wiring of the controller.
//!
//! - `initialization`: rustls, tracing, metrics, HTTP server, client and reconciler setup
//! - `watch_loop`: the BindingConfig control loop
//! - `error_policy`: Fibonacci backoff for failed reconciliations
//! - `dispatcher`: consumer of instance watch events

pub mod dispatcher;
pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
