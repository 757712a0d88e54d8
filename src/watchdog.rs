//! Liveness supervision. Decides, never acts: the outer driver performs the
//! actual restart.

use log::error;

use crate::clock::{elapsed, Millis};
use crate::config::Thresholds;
use crate::error::{WatchdogCause, WatchdogTimeout};
use crate::remote_config::ConfigFetchFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessMarks {
    pub last_successful_post_at: Option<Millis>,
    /// Last time the link went up or down; boot counts as one.
    pub last_wifi_transition_at: Millis,
}

impl LivenessMarks {
    pub fn new(boot: Millis) -> Self {
        Self { last_successful_post_at: None, last_wifi_transition_at: boot }
    }

    pub fn record_post(&mut self, now: Millis) {
        let last = self.last_successful_post_at.unwrap_or(0);
        self.last_successful_post_at = Some(last.max(now));
    }

    pub fn record_wifi_transition(&mut self, now: Millis) {
        self.last_wifi_transition_at = self.last_wifi_transition_at.max(now);
    }
}

/// Everything the watchdog looks at, copied out of the agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogView {
    pub link_up: bool,
    pub endpoint_valid: bool,
    pub fetch_pending: bool,
    pub config_failure: ConfigFetchFailure,
    pub liveness: LivenessMarks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Continue,
    Restart(WatchdogTimeout),
}

impl RestartDecision {
    pub fn is_restart(&self) -> bool {
        matches!(self, RestartDecision::Restart(_))
    }

    pub fn into_result(self) -> Result<(), WatchdogTimeout> {
        match self {
            RestartDecision::Continue => Ok(()),
            RestartDecision::Restart(timeout) => Err(timeout),
        }
    }
}

pub struct WatchdogSupervisor {
    max_no_post_interval: Millis,
    max_wifi_down_interval: Millis,
    max_config_fail_interval: Millis,
}

impl WatchdogSupervisor {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self {
            max_no_post_interval: thresholds.max_no_post_interval,
            max_wifi_down_interval: thresholds.max_wifi_down_interval,
            max_config_fail_interval: thresholds.max_config_fail_interval,
        }
    }

    /// Pure apart from logging the decision. A rule whose state was never
    /// established does not fire.
    pub fn evaluate(&self, now: Millis, view: &WatchdogView) -> RestartDecision {
        match self.first_tripped(now, view) {
            Some(cause) => {
                error!("watchdog: {}, restart required", cause);
                RestartDecision::Restart(WatchdogTimeout { cause })
            }
            None => RestartDecision::Continue,
        }
    }

    fn first_tripped(&self, now: Millis, view: &WatchdogView) -> Option<WatchdogCause> {
        if view.link_up && !view.endpoint_valid && view.fetch_pending {
            if let Some(first) = view.config_failure.first_failure_at {
                let failing_for = elapsed(now, first);
                if failing_for > self.max_config_fail_interval {
                    return Some(WatchdogCause::ConfigFetch { failing_for });
                }
            }
        }

        if let Some(last_post) = view.liveness.last_successful_post_at {
            let since_last_post = elapsed(now, last_post);
            if since_last_post > self.max_no_post_interval {
                return Some(WatchdogCause::NoPost { since_last_post });
            }
        }

        if !view.link_up {
            let down_for = elapsed(now, view.liveness.last_wifi_transition_at);
            if down_for > self.max_wifi_down_interval {
                return Some(WatchdogCause::WifiDown { down_for });
            }
        }

        None
    }
}
