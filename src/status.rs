//! Read-only view of the supervisor for the diagnostic status server.

use std::net::Ipv4Addr;

use log::info;
use serde_json::{json, Value};

use crate::clock::{is_due, Millis};
use crate::link::ProbeOutcome;
use crate::net::LinkStatus;
use crate::scheduler::Collaborator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub cycles: u32,
    pub readings_posted: u32,
    pub readings_failed: u32,
    pub config_fetches: u32,
    pub reconnect_requests: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub uptime_ms: Millis,
    pub link: LinkStatus,
    pub ip: Option<Ipv4Addr>,
    pub endpoint: Option<String>,
    pub last_post_age_ms: Option<Millis>,
    pub last_transition_age_ms: Millis,
    pub config_failure_age_ms: Option<Millis>,
    pub last_probe: Option<ProbeOutcome>,
    pub counters: Counters,
}

impl StatusSnapshot {
    /// Body for the board health check. The collector treats exactly
    /// `"healthy"` as up.
    pub fn health_text(&self) -> &'static str {
        if self.link.is_up() {
            "healthy"
        } else {
            "degraded"
        }
    }

    pub fn to_json(&self) -> Value {
        let probe = match self.last_probe {
            None => Value::Null,
            Some(ProbeOutcome::Healthy) => json!("healthy"),
            Some(ProbeOutcome::Status(code)) => json!(format!("http {}", code)),
            Some(ProbeOutcome::Unreachable) => json!("unreachable"),
        };
        json!({
            "health": self.health_text(),
            "uptime_ms": self.uptime_ms,
            "link": self.link.as_str(),
            "ip": self.ip.map(|ip| ip.to_string()),
            "endpoint": self.endpoint,
            "last_post_age_ms": self.last_post_age_ms,
            "last_transition_age_ms": self.last_transition_age_ms,
            "config_failure_age_ms": self.config_failure_age_ms,
            "last_probe": probe,
            "counters": {
                "cycles": self.counters.cycles,
                "readings_posted": self.counters.readings_posted,
                "readings_failed": self.counters.readings_failed,
                "config_fetches": self.counters.config_fetches,
                "reconnect_requests": self.counters.reconnect_requests,
            },
        })
    }
}

/// Logs the status document at a fixed period.
pub struct StatusReporter {
    period: Millis,
    last_report_at: Option<Millis>,
    reports: u32,
}

impl StatusReporter {
    pub fn new(period: Millis) -> Self {
        Self { period, last_report_at: None, reports: 0 }
    }

    pub fn reports(&self) -> u32 {
        self.reports
    }
}

impl Collaborator for StatusReporter {
    fn service(&mut self, now: Millis, status: &StatusSnapshot) {
        if !is_due(now, self.last_report_at, self.period) {
            return;
        }
        self.last_report_at = Some(now);
        self.reports += 1;
        info!("status {}", status.to_json());
    }
}
