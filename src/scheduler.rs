//! The control loop. One cooperative pass per tick, always in the order
//! collaborators, link, config, send, watchdog.

use log::{info, warn};

use crate::clock::{elapsed, is_due, Clock, Millis};
use crate::config::{AgentConfig, Thresholds};
use crate::error::{LinkUnavailable, WatchdogTimeout};
use crate::link::{wait_for_link, ConnectivityMonitor, LinkEvent};
use crate::net::{HttpTransport, WifiLink};
use crate::remote_config::{ConfigFetcher, ConfigStore};
use crate::status::{Counters, StatusSnapshot};
use crate::telemetry::{Reading, TelemetryPublisher};
use crate::watchdog::{LivenessMarks, RestartDecision, WatchdogSupervisor, WatchdogView};

/// Sensor acquisition, outside the supervisor.
pub trait SensorSource {
    fn read(&mut self) -> Vec<Reading>;
}

/// Serviced at the start of every tick, before any network work.
pub trait Collaborator {
    fn service(&mut self, now: Millis, status: &StatusSnapshot);
}

/// All mutable supervisor state. Lives exactly as long as one boot.
pub struct AgentState {
    pub boot_at: Millis,
    pub monitor: ConnectivityMonitor,
    pub store: ConfigStore,
    pub liveness: LivenessMarks,
    pub fetch_pending: bool,
    pub last_fetch_attempt_at: Option<Millis>,
    pub last_sent_at: Option<Millis>,
    pub counters: Counters,
}

impl AgentState {
    fn new(now: Millis, thresholds: &Thresholds) -> Self {
        Self {
            boot_at: now,
            monitor: ConnectivityMonitor::new(now, thresholds),
            store: ConfigStore::default(),
            liveness: LivenessMarks::new(now),
            fetch_pending: true,
            last_fetch_attempt_at: None,
            last_sent_at: None,
            counters: Counters::default(),
        }
    }
}

pub struct CycleScheduler<L, T, C, S> {
    thresholds: Thresholds,
    fetcher: ConfigFetcher,
    publisher: TelemetryPublisher,
    watchdog: WatchdogSupervisor,
    state: AgentState,
    link: L,
    transport: T,
    clock: C,
    sensors: S,
    collaborators: Vec<Box<dyn Collaborator>>,
}

impl<L, T, C, S> CycleScheduler<L, T, C, S>
where
    L: WifiLink,
    T: HttpTransport,
    C: Clock,
    S: SensorSource,
{
    pub fn new(config: &AgentConfig, link: L, transport: T, clock: C, sensors: S) -> Self {
        let thresholds = config.thresholds.clone();
        let state = AgentState::new(clock.now_ms(), &thresholds);
        Self {
            fetcher: ConfigFetcher::new(config),
            publisher: TelemetryPublisher::new(config),
            watchdog: WatchdogSupervisor::new(&thresholds),
            thresholds,
            state,
            link,
            transport,
            clock,
            sensors,
            collaborators: Vec::new(),
        }
    }

    pub fn with_collaborator(mut self, collaborator: Box<dyn Collaborator>) -> Self {
        self.collaborators.push(collaborator);
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Bounded wait for the first link, then an immediate config fetch.
    /// Failing to connect is not fatal; the loop keeps reconnecting and the
    /// watchdog decides when to give up.
    pub fn boot(&mut self) -> Result<(), LinkUnavailable> {
        info!(
            "waiting up to {}ms for link",
            self.thresholds.startup_link_timeout
        );
        let waited = wait_for_link(&self.clock, &self.link, self.thresholds.startup_link_timeout);
        let now = self.clock.now_ms();
        match waited {
            Ok(ms) => {
                info!("link up after {}ms", ms);
                if self.refresh_link(now) {
                    self.maybe_fetch(now);
                }
                Ok(())
            }
            Err(e) => {
                warn!("{} after {}ms, continuing unconnected", e, self.thresholds.startup_link_timeout);
                Err(e)
            }
        }
    }

    /// One cooperative pass. The watchdog runs last and always.
    pub fn tick(&mut self) -> RestartDecision {
        let now = self.clock.now_ms();

        let snapshot = self.status_at(now);
        for collaborator in self.collaborators.iter_mut() {
            collaborator.service(now, &snapshot);
        }

        let connected = self.refresh_link(now);
        if connected {
            self.maybe_fetch(now);
        }
        if connected && is_due(now, self.state.last_sent_at, self.thresholds.send_interval) {
            self.run_cycle(now);
        }

        let now = self.clock.now_ms();
        self.watchdog.evaluate(now, &self.watchdog_view())
    }

    /// Ticks until the watchdog asks for a restart.
    pub fn run(&mut self) -> WatchdogTimeout {
        loop {
            if let RestartDecision::Restart(timeout) = self.tick() {
                return timeout;
            }
            self.clock.sleep_ms(self.thresholds.tick_interval);
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_at(self.clock.now_ms())
    }

    fn status_at(&self, now: Millis) -> StatusSnapshot {
        let state = &self.state;
        StatusSnapshot {
            uptime_ms: elapsed(now, state.boot_at),
            link: state.monitor.state().status,
            ip: state.monitor.ip(),
            endpoint: state.store.endpoint().map(|e| e.address()),
            last_post_age_ms: state
                .liveness
                .last_successful_post_at
                .map(|at| elapsed(now, at)),
            last_transition_age_ms: elapsed(now, state.liveness.last_wifi_transition_at),
            config_failure_age_ms: state
                .store
                .failure()
                .first_failure_at
                .map(|at| elapsed(now, at)),
            last_probe: state.monitor.last_probe(),
            counters: state.counters,
        }
    }

    fn watchdog_view(&self) -> WatchdogView {
        WatchdogView {
            link_up: self.state.monitor.is_up(),
            endpoint_valid: self.state.store.is_valid(),
            fetch_pending: self.state.fetch_pending,
            config_failure: self.state.store.failure(),
            liveness: self.state.liveness,
        }
    }

    fn refresh_link(&mut self, now: Millis) -> bool {
        let state = &mut self.state;
        let connected =
            state
                .monitor
                .tick(now, &mut self.link, &mut self.transport, state.store.endpoint());

        for event in state.monitor.drain_events() {
            match event {
                LinkEvent::Lost => state.liveness.record_wifi_transition(now),
                LinkEvent::Restored => {
                    state.liveness.record_wifi_transition(now);
                    if !state.store.is_valid() {
                        // Fresh failure episode, fetch on this very tick.
                        state.store.clear_failure();
                        state.fetch_pending = true;
                        state.last_fetch_attempt_at = None;
                    }
                }
                LinkEvent::IpAcquired(_) => {}
            }
        }
        state.counters.reconnect_requests = state.monitor.reconnect_requests();
        connected
    }

    fn maybe_fetch(&mut self, now: Millis) {
        let state = &mut self.state;
        if !state.fetch_pending
            || !is_due(now, state.last_fetch_attempt_at, self.thresholds.config_fetch_retry_interval)
        {
            return;
        }
        state.last_fetch_attempt_at = Some(now);
        state.counters.config_fetches += 1;
        if self.fetcher.fetch(now, &mut self.transport, &mut state.store).is_ok() {
            state.fetch_pending = false;
        }
    }

    fn run_cycle(&mut self, now: Millis) {
        let state = &mut self.state;
        state.last_sent_at = Some(now);
        state.counters.cycles += 1;

        let readings = self.sensors.read();
        if readings.is_empty() {
            warn!("cycle {}: no readings acquired", state.counters.cycles);
            return;
        }

        let report = self.publisher.publish(
            &readings,
            state.store.endpoint(),
            &self.link,
            &mut self.transport,
            &self.clock,
        );
        state.counters.readings_posted += report.delivered() as u32;
        state.counters.readings_failed += report.dropped() as u32;

        if report.all_succeeded() {
            state.liveness.record_post(self.clock.now_ms());
            info!("cycle {}: {} readings delivered", state.counters.cycles, report.delivered());
        } else {
            warn!(
                "cycle {}: {}/{} readings delivered",
                state.counters.cycles,
                report.delivered(),
                report.outcomes.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthPlacement, WifiCredentials, PROBE_PATH, INGEST_PATH};
    use crate::error::WatchdogCause;
    use crate::net::{LinkStatus, Method};
    use crate::testing::{
        config_body, respond, FakeClock, FakeLink, FakeSensors, FakeTransport,
        RecordingCollaborator,
    };
    use std::cell::Cell;
    use std::rc::Rc;

    const CONFIG_PATH: &str = "device-configs";

    type Agent = CycleScheduler<FakeLink, FakeTransport, FakeClock, FakeSensors>;

    fn config() -> AgentConfig {
        AgentConfig {
            wifi: WifiCredentials::new("home", "pw").unwrap(),
            device_id: "3".to_string(),
            config_url: "https://cfg.example/api/admin/device-configs".to_string(),
            auth_token: "s3cret".to_string(),
            auth_placement: AuthPlacement::Header,
            ingest_token: None,
            thresholds: Thresholds::default(),
        }
    }

    /// Config service plus collector on one fake transport.
    fn backend(config_ok: bool, post_status: u16) -> FakeTransport {
        FakeTransport::new(move |req| match req.method {
            Method::Get if req.url.contains(CONFIG_PATH) => {
                if config_ok {
                    Ok(respond(200, &config_body("10.0.0.5", 3000)))
                } else {
                    Ok(respond(500, ""))
                }
            }
            Method::Get => Ok(respond(200, "")),
            Method::Post => Ok(respond(post_status, "")),
        })
    }

    struct Rig {
        agent: Agent,
        link: FakeLink,
        transport: FakeTransport,
        clock: FakeClock,
        sensors: FakeSensors,
    }

    fn rig(status: LinkStatus, transport: FakeTransport) -> Rig {
        let link = FakeLink::new(status);
        let clock = FakeClock::new(0);
        let sensors = FakeSensors::new(&[("dht22-temp", 21.5), ("dht22-humidity", 40.0)]);
        let agent = CycleScheduler::new(
            &config(),
            link.clone(),
            transport.clone(),
            clock.clone(),
            sensors.clone(),
        );
        Rig { agent, link, transport, clock, sensors }
    }

    impl Rig {
        fn tick_for(&mut self, duration: Millis) {
            let until = self.clock.now_ms() + duration;
            while self.clock.now_ms() < until {
                assert!(!self.agent.tick().is_restart());
                self.clock.advance(Thresholds::default().tick_interval);
            }
        }
    }

    #[test]
    fn boot_fetches_config_and_first_tick_publishes() {
        let mut rig = rig(LinkStatus::Connected, backend(true, 200));
        rig.agent.boot().unwrap();
        assert_eq!(rig.transport.count(Method::Get, CONFIG_PATH), 1);
        assert!(!rig.agent.state().fetch_pending);

        assert!(!rig.agent.tick().is_restart());
        assert_eq!(rig.transport.count(Method::Post, INGEST_PATH), 2);
        assert_eq!(rig.sensors.reads(), 1);

        let status = rig.agent.status();
        assert_eq!(status.link, LinkStatus::Connected);
        assert_eq!(status.endpoint.as_deref(), Some("10.0.0.5:3000"));
        assert_eq!(status.counters.readings_posted, 2);
        assert_eq!(status.config_failure_age_ms, None);
        assert!(rig.agent.state().liveness.last_successful_post_at.is_some());
    }

    #[test]
    fn restored_link_is_visible_to_same_tick_fetch_and_send() {
        let mut rig = rig(LinkStatus::Disconnected, backend(true, 200));
        assert_eq!(rig.agent.boot(), Err(LinkUnavailable));
        assert!(!rig.agent.tick().is_restart());
        assert!(rig.transport.requests().is_empty());
        assert_eq!(rig.link.reconnects(), 1);

        rig.link.set(LinkStatus::Connected);
        rig.clock.advance(Thresholds::default().connectivity_check_interval);
        assert!(!rig.agent.tick().is_restart());

        assert_eq!(rig.transport.count(Method::Get, CONFIG_PATH), 1);
        assert_eq!(rig.transport.count(Method::Post, INGEST_PATH), 2);
        assert!(rig.agent.state().liveness.last_successful_post_at.is_some());
    }

    #[test]
    fn config_retries_are_gated_while_pending() {
        let mut rig = rig(LinkStatus::Connected, backend(false, 200));
        rig.agent.boot().unwrap();
        rig.tick_for(120_000);

        // boot, then every config_fetch_retry_interval
        assert_eq!(rig.transport.count(Method::Get, CONFIG_PATH), 4);
        assert_eq!(rig.agent.state().store.failure().first_failure_at, Some(0));
        assert_eq!(rig.transport.count(Method::Post, INGEST_PATH), 0);
        assert_eq!(rig.agent.state().counters.config_fetches, 4);
    }

    #[test]
    fn link_restore_refetches_immediately_and_restarts_failure_age() {
        let mut rig = rig(LinkStatus::Connected, backend(false, 200));
        rig.agent.boot().unwrap();
        rig.tick_for(5_000);
        rig.link.set(LinkStatus::Disconnected);
        rig.tick_for(2_000);
        rig.link.set(LinkStatus::Connected);
        rig.tick_for(1_000);

        assert_eq!(rig.transport.count(Method::Get, CONFIG_PATH), 2);
        assert_eq!(rig.agent.state().store.failure().first_failure_at, Some(7_000));
    }

    #[test]
    fn sends_once_per_interval_and_never_while_down() {
        let send_interval = Thresholds::default().send_interval;
        let mut rig = rig(LinkStatus::Connected, backend(true, 200));
        rig.agent.boot().unwrap();
        rig.tick_for(1_000);
        assert_eq!(rig.sensors.reads(), 1);

        rig.link.set(LinkStatus::Disconnected);
        rig.tick_for(send_interval - 500);
        assert_eq!(rig.sensors.reads(), 1);

        rig.link.set(LinkStatus::Connected);
        rig.tick_for(2_000);
        assert_eq!(rig.sensors.reads(), 2);
        assert_eq!(rig.transport.count(Method::Post, INGEST_PATH), 4);
    }

    #[test]
    fn failing_probe_does_not_hold_back_a_due_cycle() {
        let send_interval = Thresholds::default().send_interval;
        let transport = FakeTransport::new(|req| match req.method {
            Method::Get if req.url.contains(CONFIG_PATH) => {
                Ok(respond(200, &config_body("10.0.0.5", 3000)))
            }
            Method::Get => Err(anyhow::anyhow!("probe timed out")),
            Method::Post => Ok(respond(200, "")),
        });
        let mut rig = rig(LinkStatus::Connected, transport);
        rig.agent.boot().unwrap();
        rig.tick_for(send_interval + 1_000);

        assert!(rig.transport.count(Method::Get, PROBE_PATH) > 0);
        assert_eq!(rig.sensors.reads(), 2);
        assert_eq!(rig.agent.status().link, LinkStatus::Connected);
        assert_eq!(rig.link.reconnects(), 0);
    }

    #[test]
    fn collaborators_are_serviced_before_the_link_refresh() {
        let collaborator = RecordingCollaborator::default();
        let seen = collaborator.seen.clone();
        let rig = rig(LinkStatus::Connected, backend(true, 200));
        let mut agent = rig.agent.with_collaborator(Box::new(collaborator));

        assert!(!agent.tick().is_restart());
        assert!(!agent.tick().is_restart());
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1.link, LinkStatus::Disconnected);
        assert_eq!(seen[1].1.link, LinkStatus::Connected);
    }

    #[test]
    fn stuck_config_fetch_ends_in_restart() {
        let max = Thresholds::default().max_config_fail_interval;
        let mut rig = rig(LinkStatus::Connected, backend(false, 200));
        rig.agent.boot().unwrap();

        let timeout = rig.agent.run();
        match timeout.cause {
            WatchdogCause::ConfigFetch { failing_for } => assert!(failing_for > max),
            other => panic!("unexpected cause {other:?}"),
        }
        assert_eq!(rig.clock.now_ms(), max + Thresholds::default().tick_interval);
    }

    #[test]
    fn collector_outage_after_first_post_ends_in_restart() {
        let max = Thresholds::default().max_no_post_interval;
        let posts = Rc::new(Cell::new(0));
        let counted = posts.clone();
        let transport = FakeTransport::new(move |req| match req.method {
            Method::Get if req.url.contains(CONFIG_PATH) => {
                Ok(respond(200, &config_body("10.0.0.5", 3000)))
            }
            Method::Get => Ok(respond(200, "")),
            Method::Post => {
                counted.set(counted.get() + 1);
                Ok(respond(if counted.get() <= 2 { 200 } else { 502 }, ""))
            }
        });
        let mut rig = rig(LinkStatus::Connected, transport);
        rig.agent.boot().unwrap();

        let timeout = rig.agent.run();
        assert!(matches!(timeout.cause, WatchdogCause::NoPost { .. }));
        assert!(rig.clock.now_ms() > max);
        assert!(posts.get() > 2);
    }

    #[test]
    fn never_posting_device_is_not_restarted_for_missing_posts() {
        let mut rig = rig(LinkStatus::Connected, backend(true, 500));
        rig.agent.boot().unwrap();
        rig.tick_for(2 * Thresholds::default().max_no_post_interval);
        assert!(rig.agent.state().liveness.last_successful_post_at.is_none());
        assert!(rig.agent.state().counters.readings_failed > 0);
    }

    #[test]
    fn link_that_never_comes_up_ends_in_restart() {
        let thresholds = Thresholds::default();
        let mut rig = rig(LinkStatus::Disconnected, backend(true, 200));
        assert!(rig.agent.boot().is_err());

        let timeout = rig.agent.run();
        assert!(matches!(timeout.cause, WatchdogCause::WifiDown { .. }));
        let now = rig.clock.now_ms();
        assert_eq!(now, thresholds.max_wifi_down_interval + thresholds.tick_interval);
        assert!(u64::from(rig.link.reconnects()) <= now / thresholds.reconnect_backoff_interval + 1);
        assert!(rig.transport.requests().is_empty());
    }
}
