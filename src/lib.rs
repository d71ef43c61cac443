//! Service Mapper Controller Library
//!
//! Discovers instances of arbitrary resource kinds named by BindingConfig
//! resources, keeps one InstanceProxy per (config, instance) pair and derives
//! a binding Secret for each proxy from the config's rule set.
//!
//! ## Layout
//!
//! - `binding`: rule grammar, field paths and artifact materialization
//! - `store`: object store abstraction with Kubernetes and in-memory backends
//! - `controller`: watch manager, cascade reconciler, HTTP server
//! - `runtime`: process wiring (initialization, control loop, event dispatch)

pub mod binding;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;
pub mod store;
