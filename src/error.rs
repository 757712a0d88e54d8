//! Failure taxonomy of the supervisor.
//!
//! Transport and status failures stay inside the component that saw them;
//! only [`WatchdogTimeout`] is allowed to end the process.

use crate::clock::Millis;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("network link unavailable")]
pub struct LinkUnavailable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("config request failed: {0}")]
    Transport(String),
    #[error("config service answered HTTP {0}")]
    HttpStatus(u16),
    #[error("config body unparseable: {0}")]
    Parse(String),
    #[error("config incomplete: {0}")]
    IncompleteData(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("no collector endpoint resolved")]
    NoEndpoint,
    #[error("link down while posting")]
    LinkUnavailable,
    #[error("post failed: {0}")]
    Transport(String),
    #[error("collector answered HTTP {0}")]
    HttpStatus(u16),
    #[error("reading value is not a finite number")]
    InvalidValue,
}

impl From<LinkUnavailable> for PublishError {
    fn from(_: LinkUnavailable) -> Self {
        PublishError::LinkUnavailable
    }
}

/// Which liveness rule tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogCause {
    /// Config fetch kept failing with the link up.
    ConfigFetch { failing_for: Millis },
    /// No fully successful batch since the last one.
    NoPost { since_last_post: Millis },
    /// Link stayed down.
    WifiDown { down_for: Millis },
}

impl core::fmt::Display for WatchdogCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WatchdogCause::ConfigFetch { failing_for } => {
                write!(f, "config fetch failing for {}s", failing_for / 1000)
            }
            WatchdogCause::NoPost { since_last_post } => {
                write!(f, "no successful post for {}s", since_last_post / 1000)
            }
            WatchdogCause::WifiDown { down_for } => {
                write!(f, "wifi down for {}s", down_for / 1000)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("watchdog timeout: {cause}")]
pub struct WatchdogTimeout {
    pub cause: WatchdogCause,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("wifi ssid is empty")]
    EmptySsid,
    #[error("wifi ssid too long ({0} bytes)")]
    SsidTooLong(usize),
    #[error("wifi password too long ({0} bytes)")]
    PasswordTooLong(usize),
    #[error("device id is empty")]
    MissingDeviceId,
    #[error("config url must be http(s): {0}")]
    BadConfigUrl(String),
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
    #[error("probe timeout {timeout}ms must be shorter than probe interval {interval}ms")]
    ProbeTimeoutTooLong { timeout: Millis, interval: Millis },
}
