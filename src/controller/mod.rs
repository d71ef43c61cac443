//! # Controller
//!
//! Core controller modules for the Service Mapper Controller.
//!
//! - `backoff`: Fibonacci backoff mechanism for retries
//! - `reconciler`: Cascade reconciliation of configs, proxies and artifacts
//! - `server`: HTTP server for metrics and health checks
//! - `watch_manager`: One shared instance watch per target kind

pub mod backoff;
pub mod reconciler;
pub mod server;
pub mod watch_manager;
