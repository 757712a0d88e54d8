//! Remote configuration: resolves the collector endpoint from the
//! configuration service and keeps failure-age bookkeeping for the watchdog.

use log::{info, warn};
use serde_json::Value;

use crate::clock::Millis;
use crate::config::{AgentConfig, AuthPlacement};
use crate::error::FetchError;
use crate::net::{with_query, HttpRequest, HttpTransport, Method};

const DEFAULT_ENV: &str = "prod";

/// Resolved collector address. Only ever built complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub ip: String,
    pub port: u16,
    pub resolved_at: Millis,
}

impl RemoteEndpoint {
    pub fn new(ip: &str, port: u16, resolved_at: Millis) -> Self {
        Self { ip: ip.to_string(), port, resolved_at }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.ip, self.port, path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigFetchFailure {
    pub first_failure_at: Option<Millis>,
}

/// Owner of the resolved endpoint. The endpoint is replaced whole or not at
/// all; a failure age only exists while no endpoint is known.
#[derive(Debug, Default)]
pub struct ConfigStore {
    endpoint: Option<RemoteEndpoint>,
    failure: ConfigFetchFailure,
}

impl ConfigStore {
    pub fn endpoint(&self) -> Option<&RemoteEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn failure(&self) -> ConfigFetchFailure {
        self.failure
    }

    pub fn record_success(&mut self, endpoint: RemoteEndpoint) {
        self.endpoint = Some(endpoint);
        self.failure = ConfigFetchFailure::default();
    }

    /// Starts the failure clock unless it already runs. A failed refresh of a
    /// known endpoint leaves both untouched.
    pub fn record_failure(&mut self, now: Millis) {
        if self.endpoint.is_none() && self.failure.first_failure_at.is_none() {
            self.failure.first_failure_at = Some(now);
        }
    }

    pub fn clear_failure(&mut self) {
        self.failure = ConfigFetchFailure::default();
    }
}

pub struct ConfigFetcher {
    url: String,
    /// `url` without credentials, for logs.
    target: String,
    auth_header: Option<String>,
    timeout: Millis,
}

impl ConfigFetcher {
    pub fn new(config: &AgentConfig) -> Self {
        let target = with_query(&config.config_url, "deviceId", &config.device_id);
        let mut url = target.clone();
        let mut auth_header = None;
        if !config.auth_token.is_empty() {
            match config.auth_placement {
                AuthPlacement::Header => auth_header = Some(config.auth_token.clone()),
                AuthPlacement::Query => url = with_query(&url, "key", &config.auth_token),
            }
        }
        Self { url, target, auth_header, timeout: config.thresholds.request_timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request target as it appears in logs, never carrying the token.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// One blocking request to the configuration service. The outcome is
    /// written to `store` before it is returned.
    pub fn fetch<T>(
        &self,
        now: Millis,
        transport: &mut T,
        store: &mut ConfigStore,
    ) -> Result<RemoteEndpoint, FetchError>
    where
        T: HttpTransport + ?Sized,
    {
        info!("fetching config from {}", self.target);
        match self.request(now, transport) {
            Ok(endpoint) => {
                info!("collector endpoint {}", endpoint.address());
                store.record_success(endpoint.clone());
                Ok(endpoint)
            }
            Err(e) => {
                store.record_failure(now);
                warn!("config fetch failed: {}", e);
                Err(e)
            }
        }
    }

    fn request<T>(&self, now: Millis, transport: &mut T) -> Result<RemoteEndpoint, FetchError>
    where
        T: HttpTransport + ?Sized,
    {
        let mut headers = vec![("Accept", "application/json")];
        if let Some(token) = &self.auth_header {
            headers.push(("Authorization", token.as_str()));
        }
        let response = transport
            .request(&HttpRequest {
                method: Method::Get,
                url: &self.url,
                headers: &headers,
                body: &[],
                timeout: self.timeout,
            })
            .map_err(|e| FetchError::Transport(format!("{:#}", e)))?;
        if !response.is_success() {
            return Err(FetchError::HttpStatus(response.status));
        }
        parse_endpoint(&response.body, now)
    }
}

/// Extracts `environments[defaultEnv]` from a configuration body.
///
/// Accepts the wrapped service shape
/// `{success, value: {data: [{config: {...}}]}}`, the legacy array-rooted
/// shape `[{config: {...}}]` and a bare config object
/// `{defaultEnv, environments}`.
pub fn parse_endpoint(body: &[u8], now: Millis) -> Result<RemoteEndpoint, FetchError> {
    let root: Value =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let config = match &root {
        Value::Array(entries) => first_config(entries)?,
        Value::Object(fields)
            if !fields.contains_key("success") && fields.contains_key("environments") =>
        {
            &root
        }
        Value::Object(_) => {
            if root.get("success").and_then(Value::as_bool) != Some(true) {
                return Err(FetchError::IncompleteData("success flag not set"));
            }
            let entries = root
                .get("value")
                .and_then(|value| value.get("data"))
                .and_then(Value::as_array)
                .ok_or(FetchError::IncompleteData("no data list"))?;
            first_config(entries)?
        }
        _ => return Err(FetchError::Parse("body is neither object nor array".to_string())),
    };
    let env = config
        .get("defaultEnv")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ENV);
    let target = config
        .get("environments")
        .and_then(|environments| environments.get(env))
        .ok_or(FetchError::IncompleteData("default environment missing"))?;

    let ip = target
        .get("ip")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .ok_or(FetchError::IncompleteData("empty ip"))?;
    // The service masks addresses for unauthenticated callers.
    if ip.contains('*') {
        return Err(FetchError::IncompleteData("ip masked, token rejected"));
    }
    let port = target
        .get("port")
        .and_then(parse_port)
        .ok_or(FetchError::IncompleteData("port missing or out of range"))?;

    Ok(RemoteEndpoint::new(ip, port, now))
}

fn first_config(entries: &[Value]) -> Result<&Value, FetchError> {
    entries
        .first()
        .ok_or(FetchError::IncompleteData("empty data list"))?
        .get("config")
        .ok_or(FetchError::IncompleteData("entry without config"))
}

fn parse_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u16::try_from(port).ok().filter(|port| *port > 0)
}
