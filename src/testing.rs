//! Host-side fakes for the hardware seams.

use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

use anyhow::anyhow;

use crate::clock::{Clock, Millis};
use crate::net::{HttpRequest, HttpResponse, HttpTransport, LinkStatus, Method, WifiLink};
use crate::scheduler::{Collaborator, SensorSource};
use crate::status::StatusSnapshot;
use crate::telemetry::Reading;

#[derive(Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<Millis>>,
}

impl FakeClock {
    pub fn new(start: Millis) -> Self {
        Self { now: Rc::new(Cell::new(start)) }
    }

    pub fn advance(&self, ms: Millis) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> Millis {
        self.now.get()
    }

    fn sleep_ms(&self, ms: Millis) {
        self.advance(ms);
    }
}

#[derive(Clone)]
pub struct FakeLink {
    status: Rc<Cell<LinkStatus>>,
    reconnects: Rc<Cell<u32>>,
    fail_reconnect: Rc<Cell<bool>>,
}

impl FakeLink {
    pub fn new(status: LinkStatus) -> Self {
        Self {
            status: Rc::new(Cell::new(status)),
            reconnects: Rc::new(Cell::new(0)),
            fail_reconnect: Rc::new(Cell::new(false)),
        }
    }

    pub fn set(&self, status: LinkStatus) {
        self.status.set(status);
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.get()
    }

    pub fn fail_reconnects(&self, fail: bool) {
        self.fail_reconnect.set(fail);
    }
}

impl WifiLink for FakeLink {
    fn status(&self) -> LinkStatus {
        self.status.get()
    }

    fn ip(&self) -> Option<Ipv4Addr> {
        self.status.get().is_up().then(|| Ipv4Addr::new(192, 168, 1, 42))
    }

    fn request_reconnect(&mut self) -> anyhow::Result<()> {
        self.reconnects.set(self.reconnects.get() + 1);
        if self.fail_reconnect.get() {
            return Err(anyhow!("station busy"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout: Millis,
}

type Handler = Box<dyn FnMut(&Recorded) -> anyhow::Result<HttpResponse>>;

/// Records every request and answers through a swappable handler.
#[derive(Clone)]
pub struct FakeTransport {
    log: Rc<RefCell<Vec<Recorded>>>,
    handler: Rc<RefCell<Handler>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Recorded) -> anyhow::Result<HttpResponse> + 'static,
    {
        Self {
            log: Rc::new(RefCell::new(Vec::new())),
            handler: Rc::new(RefCell::new(Box::new(handler))),
        }
    }

    /// Answers every request with `status` and an empty body.
    pub fn status(status: u16) -> Self {
        Self::new(move |_| Ok(respond(status, "")))
    }

    pub fn unreachable() -> Self {
        Self::new(|_| Err(anyhow!("connection refused")))
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(&Recorded) -> anyhow::Result<HttpResponse> + 'static,
    {
        *self.handler.borrow_mut() = Box::new(handler);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.borrow().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|r| r.method == method && r.url.contains(path))
            .count()
    }
}

impl HttpTransport for FakeTransport {
    fn request(&mut self, request: &HttpRequest<'_>) -> anyhow::Result<HttpResponse> {
        let recorded = Recorded {
            method: request.method,
            url: request.url.to_string(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: String::from_utf8_lossy(request.body).into_owned(),
            timeout: request.timeout,
        };
        self.log.borrow_mut().push(recorded.clone());
        let mut handler = self.handler.borrow_mut();
        (*handler)(&recorded)
    }
}

pub fn respond(status: u16, body: &str) -> HttpResponse {
    HttpResponse { status, body: body.as_bytes().to_vec() }
}

/// Config service body resolving to `ip:port` in the `prod` environment.
pub fn config_body(ip: &str, port: u16) -> String {
    serde_json::json!({
        "success": true,
        "status": 200,
        "value": {
            "data": [{
                "id": 1,
                "device_id": "3",
                "config": {
                    "defaultEnv": "prod",
                    "environments": { "prod": { "ip": ip, "port": port } }
                }
            }]
        }
    })
    .to_string()
}

#[derive(Clone, Default)]
pub struct FakeSensors {
    readings: Rc<RefCell<Vec<Reading>>>,
    reads: Rc<Cell<u32>>,
}

impl FakeSensors {
    pub fn new(readings: &[(&str, f32)]) -> Self {
        let sensors = Self::default();
        sensors.set(readings);
        sensors
    }

    pub fn set(&self, readings: &[(&str, f32)]) {
        *self.readings.borrow_mut() = readings
            .iter()
            .map(|(name, value)| Reading::new(*name, *value))
            .collect();
    }

    pub fn reads(&self) -> u32 {
        self.reads.get()
    }
}

impl SensorSource for FakeSensors {
    fn read(&mut self) -> Vec<Reading> {
        self.reads.set(self.reads.get() + 1);
        self.readings.borrow().clone()
    }
}

/// Keeps every status snapshot it is handed.
#[derive(Clone, Default)]
pub struct RecordingCollaborator {
    pub seen: Rc<RefCell<Vec<(Millis, StatusSnapshot)>>>,
}

impl Collaborator for RecordingCollaborator {
    fn service(&mut self, now: Millis, status: &StatusSnapshot) {
        self.seen.borrow_mut().push((now, status.clone()));
    }
}
