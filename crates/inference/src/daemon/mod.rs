//! Model-serving daemon: HTTP client and process supervisor

mod client;
mod supervisor;

pub use client::DaemonClient;
pub use supervisor::{DaemonSupervisor, HealthCheckResult};
