//! # Custom Resource Definitions
//!
//! CRD types for the Service Mapper Controller.
//!
//! ## Module Structure
//!
//! - `binding_config.rs` - BindingConfig: target kind reference and rule set
//! - `instance_proxy.rs` - InstanceProxy: one record per (config, instance) pair,
//!   plus deterministic naming and the field indexes over it
//! - `status.rs` - Status types shared by both resources

mod binding_config;
mod instance_proxy;
mod status;

pub use binding_config::{BindingConfig, BindingConfigSpec, TargetKind};
pub use instance_proxy::{
    artifact_name, instance_index_value, proxy_indexers, proxy_name, InstanceProxy,
    InstanceProxySpec, InstanceProxyStatus, InstanceRef, CONFIG_INDEX, INSTANCE_INDEX,
};
pub use status::{BindingConfigStatus, Condition, Phase};
