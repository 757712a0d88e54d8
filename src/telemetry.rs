//! Reading delivery: one POST per reading, bounded retries per reading,
//! failures independent across a batch.

use log::{error, info, warn};
use serde_json::json;

use crate::clock::{wait_until, Clock, Millis};
use crate::config::{AgentConfig, INGEST_PATH};
use crate::error::{LinkUnavailable, PublishError};
use crate::net::{HttpRequest, HttpTransport, Method, WifiLink};
use crate::remote_config::RemoteEndpoint;

const LINK_POLL_MS: Millis = 250;

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub name: String,
    pub value: f32,
}

impl Reading {
    pub fn new(name: impl Into<String>, value: f32) -> Self {
        Self { name: name.into(), value }
    }

    /// Collector payload, value rounded to two decimals.
    pub fn payload(&self) -> String {
        let value = (f64::from(self.value) * 100.0).round() / 100.0;
        json!({ "sensor": self.name, "value": value }).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    pub sensor_name: String,
    pub succeeded: bool,
    pub attempts_used: u32,
    pub error: Option<PublishError>,
}

impl PublishOutcome {
    fn failed(reading: &Reading, attempts_used: u32, error: PublishError) -> Self {
        Self {
            sensor_name: reading.name.clone(),
            succeeded: false,
            attempts_used,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub outcomes: Vec<PublishOutcome>,
}

impl PublishReport {
    /// True only for a non-empty batch where every reading was delivered.
    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.succeeded)
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded).count()
    }

    pub fn dropped(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

pub struct TelemetryPublisher {
    max_attempts: u32,
    link_wait: Millis,
    retry_delay: Millis,
    inter_reading_delay: Millis,
    request_timeout: Millis,
    auth: Option<String>,
}

impl TelemetryPublisher {
    pub fn new(config: &AgentConfig) -> Self {
        let thresholds = &config.thresholds;
        Self {
            max_attempts: thresholds.max_publish_attempts.max(1),
            link_wait: thresholds.publish_link_wait,
            retry_delay: thresholds.publish_retry_delay,
            inter_reading_delay: thresholds.inter_reading_delay,
            request_timeout: thresholds.request_timeout,
            auth: config.ingest_token.clone(),
        }
    }

    /// Posts `readings` in order. A reading that exhausts its attempts is
    /// reported failed and the rest of the batch still goes out.
    pub fn publish<L, T, C>(
        &self,
        readings: &[Reading],
        endpoint: Option<&RemoteEndpoint>,
        link: &L,
        transport: &mut T,
        clock: &C,
    ) -> PublishReport
    where
        L: WifiLink + ?Sized,
        T: HttpTransport + ?Sized,
        C: Clock + ?Sized,
    {
        let Some(endpoint) = endpoint else {
            warn!("no collector endpoint, dropping {} readings", readings.len());
            return PublishReport {
                outcomes: readings
                    .iter()
                    .map(|r| PublishOutcome::failed(r, 0, PublishError::NoEndpoint))
                    .collect(),
            };
        };

        let url = endpoint.url(INGEST_PATH);
        let mut outcomes = Vec::with_capacity(readings.len());
        for (i, reading) in readings.iter().enumerate() {
            if i > 0 {
                clock.sleep_ms(self.inter_reading_delay);
            }
            outcomes.push(self.publish_one(reading, &url, link, transport, clock));
        }
        PublishReport { outcomes }
    }

    fn publish_one<L, T, C>(
        &self,
        reading: &Reading,
        url: &str,
        link: &L,
        transport: &mut T,
        clock: &C,
    ) -> PublishOutcome
    where
        L: WifiLink + ?Sized,
        T: HttpTransport + ?Sized,
        C: Clock + ?Sized,
    {
        if !reading.value.is_finite() {
            warn!("{} produced {}, not sent", reading.name, reading.value);
            return PublishOutcome::failed(reading, 0, PublishError::InvalidValue);
        }

        let body = reading.payload();
        let mut last_error = PublishError::LinkUnavailable;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                clock.sleep_ms(self.retry_delay);
            }
            match self.attempt(url, body.as_bytes(), link, transport, clock) {
                Ok(status) => {
                    info!("{} = {} posted (HTTP {}, attempt {})", reading.name, reading.value, status, attempt);
                    return PublishOutcome {
                        sensor_name: reading.name.clone(),
                        succeeded: true,
                        attempts_used: attempt,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!("{} attempt {}/{} failed: {}", reading.name, attempt, self.max_attempts, e);
                    last_error = e;
                }
            }
        }
        error!("{} dropped after {} attempts", reading.name, self.max_attempts);
        PublishOutcome::failed(reading, self.max_attempts, last_error)
    }

    fn attempt<L, T, C>(
        &self,
        url: &str,
        body: &[u8],
        link: &L,
        transport: &mut T,
        clock: &C,
    ) -> Result<u16, PublishError>
    where
        L: WifiLink + ?Sized,
        T: HttpTransport + ?Sized,
        C: Clock + ?Sized,
    {
        if !link.status().is_up() {
            wait_until(clock, self.link_wait, LINK_POLL_MS, || link.status().is_up().then_some(()))
                .ok_or(LinkUnavailable)?;
        }

        let mut headers = vec![("Content-Type", "application/json")];
        if let Some(token) = &self.auth {
            headers.push(("Authorization", token.as_str()));
        }
        let response = transport
            .request(&HttpRequest {
                method: Method::Post,
                url,
                headers: &headers,
                body,
                timeout: self.request_timeout,
            })
            .map_err(|e| PublishError::Transport(format!("{:#}", e)))?;
        if response.is_success() {
            Ok(response.status)
        } else {
            Err(PublishError::HttpStatus(response.status))
        }
    }
}
