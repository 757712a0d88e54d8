//! Resilience supervisor of a WiFi sensor agent.
//!
//! The core is hardware-agnostic and runs on the host; the `esp` module binds
//! it to ESP-IDF.

pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod net;
pub mod remote_config;
pub mod scheduler;
pub mod status;
pub mod telemetry;
pub mod watchdog;

#[cfg(target_os = "espidf")]
pub mod esp;

#[cfg(test)]
mod testing;

pub use config::{AgentConfig, Thresholds};
pub use error::{ConfigError, FetchError, LinkUnavailable, PublishError, WatchdogTimeout};
pub use scheduler::{Collaborator, CycleScheduler, SensorSource};
pub use status::StatusSnapshot;
pub use telemetry::Reading;
