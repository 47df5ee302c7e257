//! JustNews Platform - Distributed News-Processing Coordination Fabric
//!
//! The platform crate ties the subsystem crates together: the MCP bus
//! (service registry and call routing), the GPU orchestrator (leases,
//! worker pools, durable jobs), the crawl scheduler and the ingestion
//! pipeline. It owns the cross-cutting pieces every process shares: the
//! configuration layer, the service runtime, the agent shell, the
//! transparency archive, audit logging and rate limiting.

pub mod agents;
pub mod archive;
pub mod audit_logging;
pub mod platform;
pub mod rate_limiting;
pub mod services;

pub use agents::{AgentShell, HeldLease, ToolError, ToolHandler, ToolRequest};
pub use archive::ArchiveWriter;
pub use platform::config::PlatformConfig;
pub use platform::context::PlatformContext;
pub use platform::runtime::{Platform, PlatformRuntime};
pub use platform::service::ServiceRegistration;

/// Version of the platform crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
