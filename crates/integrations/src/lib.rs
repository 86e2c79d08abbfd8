//! Observability and code-host integrations.
//!
//! A workspace configures integrations (Loki, Prometheus, GitHub, …);
//! each serves a set of [`Capability`]s. The [`IntegrationRegistry`]
//! resolves credentials per workspace, excludes unhealthy integrations,
//! and opens short-lived adapter handles for one tool invocation at a
//! time.

pub mod adapter;
pub mod capability;
pub mod datadog;
pub mod github;
pub mod loki;
pub mod prometheus;
pub mod registry;

pub use adapter::{
    AdapterHandle, CodeAdapter, CodeMatch, CommitInfo, Credentials, LogEntry, LogsAdapter,
    MetricPoint, MetricSeries, MetricsAdapter, RepoInfo, TimeRange,
};
pub use capability::{Capability, CapabilityGroup};
pub use registry::{IntegrationRecord, IntegrationRegistry, IntegrationSource};
