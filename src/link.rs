//! Link supervision: non-blocking reconnect with backoff and a diagnostic
//! reachability probe against the collector.

use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::clock::{elapsed, is_due, wait_until, Clock, Millis};
use crate::config::{Thresholds, PROBE_PATH};
use crate::error::LinkUnavailable;
use crate::net::{HttpRequest, HttpTransport, LinkStatus, Method, WifiLink};
use crate::remote_config::RemoteEndpoint;

const LINK_POLL_MS: Millis = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Lost,
    Restored,
    IpAcquired(Ipv4Addr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub status: LinkStatus,
    pub last_transition_at: Millis,
    /// When the link last came up.
    pub last_reconnect_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Status(u16),
    Unreachable,
}

pub struct ConnectivityMonitor {
    thresholds: Thresholds,
    state: LinkState,
    ip: Option<Ipv4Addr>,
    last_check_at: Option<Millis>,
    last_reconnect_attempt_at: Option<Millis>,
    last_probe_at: Option<Millis>,
    last_probe_report_at: Option<Millis>,
    last_probe: Option<ProbeOutcome>,
    reconnect_requests: u32,
    probe_reports: u32,
    events: Vec<LinkEvent>,
}

impl ConnectivityMonitor {
    pub fn new(now: Millis, thresholds: &Thresholds) -> Self {
        Self {
            thresholds: thresholds.clone(),
            state: LinkState {
                status: LinkStatus::Disconnected,
                last_transition_at: now,
                last_reconnect_at: now,
            },
            ip: None,
            last_check_at: None,
            last_reconnect_attempt_at: None,
            last_probe_at: None,
            last_probe_report_at: None,
            last_probe: None,
            reconnect_requests: 0,
            probe_reports: 0,
            events: Vec::new(),
        }
    }

    /// Refreshes the link view and does at most one unit of recovery or
    /// probing work. Cheap to call on every scheduler tick.
    pub fn tick<L, T>(
        &mut self,
        now: Millis,
        link: &mut L,
        transport: &mut T,
        collector: Option<&RemoteEndpoint>,
    ) -> bool
    where
        L: WifiLink + ?Sized,
        T: HttpTransport + ?Sized,
    {
        if !is_due(now, self.last_check_at, self.thresholds.connectivity_check_interval) {
            return self.is_up();
        }
        self.last_check_at = Some(now);

        self.observe(now, link);
        match self.state.status {
            LinkStatus::Connected => {
                if let Some(endpoint) = collector {
                    self.maybe_probe(now, transport, endpoint);
                }
            }
            // An association in progress is left alone.
            LinkStatus::Connecting => {}
            LinkStatus::Disconnected => self.maybe_reconnect(now, link),
        }
        self.is_up()
    }

    pub fn is_up(&self) -> bool {
        self.state.status.is_up()
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    pub fn last_probe(&self) -> Option<ProbeOutcome> {
        self.last_probe
    }

    pub fn reconnect_requests(&self) -> u32 {
        self.reconnect_requests
    }

    /// Probe failures actually reported, after rate limiting.
    pub fn probe_reports(&self) -> u32 {
        self.probe_reports
    }

    /// Transition events observed since the previous drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        core::mem::take(&mut self.events)
    }

    fn observe<L: WifiLink + ?Sized>(&mut self, now: Millis, link: &L) {
        let status = link.status();
        if status != self.state.status {
            let was_up = self.state.status.is_up();
            self.state.status = status;
            self.state.last_transition_at = now;
            match (was_up, status.is_up()) {
                (false, true) => {
                    self.state.last_reconnect_at = now;
                    self.events.push(LinkEvent::Restored);
                    info!("link restored");
                }
                (true, false) => {
                    self.ip = None;
                    self.events.push(LinkEvent::Lost);
                    warn!("link lost ({})", status.as_str());
                }
                _ => debug!("link {}", status.as_str()),
            }
        }

        if status.is_up() {
            if let Some(ip) = link.ip() {
                if self.ip != Some(ip) {
                    self.ip = Some(ip);
                    self.events.push(LinkEvent::IpAcquired(ip));
                    info!("link ip {}", ip);
                }
            }
        }
    }

    fn maybe_reconnect<L: WifiLink + ?Sized>(&mut self, now: Millis, link: &mut L) {
        if !is_due(now, self.last_reconnect_attempt_at, self.thresholds.reconnect_backoff_interval) {
            return;
        }
        self.last_reconnect_attempt_at = Some(now);
        self.reconnect_requests += 1;
        match link.request_reconnect() {
            Ok(()) => info!(
                "link {}, reconnect requested (#{})",
                self.state.status.as_str(),
                self.reconnect_requests
            ),
            Err(e) => warn!("reconnect request failed: {:?}", e),
        }
    }

    // Diagnostic only: the outcome never changes the link state.
    fn maybe_probe<T: HttpTransport + ?Sized>(
        &mut self,
        now: Millis,
        transport: &mut T,
        endpoint: &RemoteEndpoint,
    ) {
        if elapsed(now, self.state.last_reconnect_at) <= self.thresholds.probe_grace {
            return;
        }
        if !is_due(now, self.last_probe_at, self.thresholds.probe_interval) {
            return;
        }
        self.last_probe_at = Some(now);

        let url = endpoint.url(PROBE_PATH);
        let request = HttpRequest {
            method: Method::Get,
            url: &url,
            headers: &[],
            body: &[],
            timeout: self.thresholds.probe_timeout,
        };
        let outcome = match transport.request(&request) {
            Ok(response) if response.status == 200 => ProbeOutcome::Healthy,
            Ok(response) => ProbeOutcome::Status(response.status),
            Err(e) => {
                debug!("probe {} failed: {:?}", url, e);
                ProbeOutcome::Unreachable
            }
        };
        self.last_probe = Some(outcome);

        if outcome != ProbeOutcome::Healthy
            && is_due(now, self.last_probe_report_at, self.thresholds.probe_report_interval)
        {
            self.last_probe_report_at = Some(now);
            self.probe_reports += 1;
            warn!("collector probe {:?} at {}, link kept up", outcome, url);
        }
    }
}

/// Blocks until the link is up or `timeout` ms have passed.
pub fn wait_for_link<C, L>(clock: &C, link: &L, timeout: Millis) -> Result<Millis, LinkUnavailable>
where
    C: Clock + ?Sized,
    L: WifiLink + ?Sized,
{
    let started = clock.now_ms();
    wait_until(clock, timeout, LINK_POLL_MS, || {
        link.status().is_up().then(|| elapsed(clock.now_ms(), started))
    })
    .ok_or(LinkUnavailable)
}
