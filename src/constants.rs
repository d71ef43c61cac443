//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable (see [`crate::config`]).

/// API group for the controller's custom resources
pub const API_GROUP: &str = "binding.operators.coreos.com";

/// Name the controller uses as field manager and in the managed-by label
pub const CONTROLLER_NAME: &str = "service-mapper-controller";

/// Finalizer placed on BindingConfig resources so deletion runs the cascade
pub const CONFIG_FINALIZER: &str = "binding.operators.coreos.com/cleanup";

/// Standard label marking objects created by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label prefix used by the Kubernetes store to materialize field indexes
pub const INDEX_LABEL_PREFIX: &str = "index.binding.operators.coreos.com";

/// Suffix appended to a proxy name to build its derived artifact name
pub const ARTIFACT_SUFFIX: &str = "-sed";

/// Maximum length of a Kubernetes object name (DNS subdomain)
pub const MAX_OBJECT_NAME_LEN: usize = 253;

/// Number of attempts made when an update hits an optimistic-lock conflict
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 5;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default Fibonacci backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default Fibonacci backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default delay before re-opening a watch stream after it ended or failed (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting the BindingConfig controller stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default periodic resync interval for healthy BindingConfigs (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Default requeue delay for a BindingConfig whose pass left some instances failed (seconds)
pub const DEFAULT_DEGRADED_REQUEUE_SECS: u64 = 30;

/// Default bound on concurrently running (config, instance) reconciliations
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 10;

/// Default number of attempts for one instance event unit
pub const DEFAULT_INSTANCE_RETRY_ATTEMPTS: u32 = 3;

/// Default delay between instance event unit attempts (milliseconds)
pub const DEFAULT_INSTANCE_RETRY_DELAY_MS: u64 = 2000;

/// Default capacity of the instance event channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
