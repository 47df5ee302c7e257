//! Platform runtime: configuration, shared context, service lifecycle and
//! the telemetry server.

pub mod config;
pub mod context;
pub mod runtime;
pub mod service;
pub mod telemetry;

pub use config::PlatformConfig;
pub use context::PlatformContext;
pub use runtime::{Platform, PlatformRuntime};
pub use service::ServiceRegistration;
pub use telemetry::telemetry_service;
