//! Build-time agent configuration.
//!
//! Every value has a compiled-in default; deployment specific values (WiFi
//! credentials, device identity, tokens) can be overridden at compile time
//! through `AGENT_*` environment variables.

use crate::clock::Millis;
use crate::error::ConfigError;

pub const SSID_MAX: usize = 32;
pub const PASSWORD_MAX: usize = 64;

/// Collector path receiving one reading per POST.
pub const INGEST_PATH: &str = "/api/sensor";
/// Collector path answering reachability probes.
pub const PROBE_PATH: &str = "/api/health";

const DEFAULT_CONFIG_URL: &str = "https://app.nudrasil.com/api/admin/device-configs";
const DEFAULT_DEVICE_ID: &str = "3";

pub type Ssid = heapless::String<SSID_MAX>;
pub type Password = heapless::String<PASSWORD_MAX>;

/// Where the configuration-service token is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlacement {
    /// Raw token as the `Authorization` header value.
    Header,
    /// Token as the `key` query parameter.
    Query,
}

#[derive(Debug, Clone)]
pub struct WifiCredentials {
    pub ssid: Ssid,
    pub password: Password,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, ConfigError> {
        if ssid.is_empty() {
            return Err(ConfigError::EmptySsid);
        }
        let ssid = Ssid::try_from(ssid).map_err(|_| ConfigError::SsidTooLong(ssid.len()))?;
        let password =
            Password::try_from(password).map_err(|_| ConfigError::PasswordTooLong(password.len()))?;
        Ok(Self { ssid, password })
    }
}

/// Timing policy. All values are milliseconds except `max_publish_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    pub send_interval: Millis,
    pub connectivity_check_interval: Millis,
    pub reconnect_backoff_interval: Millis,
    pub probe_interval: Millis,
    pub probe_grace: Millis,
    pub probe_report_interval: Millis,
    pub config_fetch_retry_interval: Millis,
    pub max_no_post_interval: Millis,
    pub max_wifi_down_interval: Millis,
    pub max_config_fail_interval: Millis,
    pub startup_link_timeout: Millis,
    pub request_timeout: Millis,
    pub probe_timeout: Millis,
    pub publish_link_wait: Millis,
    pub publish_retry_delay: Millis,
    pub inter_reading_delay: Millis,
    pub tick_interval: Millis,
    pub max_publish_attempts: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            send_interval: 10 * 60_000,
            connectivity_check_interval: 1_000,
            reconnect_backoff_interval: 10_000,
            probe_interval: 60_000,
            probe_grace: 5_000,
            probe_report_interval: 30_000,
            config_fetch_retry_interval: 30_000,
            max_no_post_interval: 60 * 60_000,
            max_wifi_down_interval: 10 * 60_000,
            max_config_fail_interval: 15 * 60_000,
            startup_link_timeout: 20_000,
            request_timeout: 10_000,
            probe_timeout: 3_000,
            publish_link_wait: 5_000,
            publish_retry_delay: 2_000,
            inter_reading_delay: 1_000,
            tick_interval: 100,
            max_publish_attempts: 3,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("send_interval", self.send_interval),
            ("connectivity_check_interval", self.connectivity_check_interval),
            ("reconnect_backoff_interval", self.reconnect_backoff_interval),
            ("probe_interval", self.probe_interval),
            ("config_fetch_retry_interval", self.config_fetch_retry_interval),
            ("max_no_post_interval", self.max_no_post_interval),
            ("max_wifi_down_interval", self.max_wifi_down_interval),
            ("max_config_fail_interval", self.max_config_fail_interval),
            ("request_timeout", self.request_timeout),
            ("probe_timeout", self.probe_timeout),
            ("tick_interval", self.tick_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(name));
        }
        if self.max_publish_attempts == 0 {
            return Err(ConfigError::ZeroInterval("max_publish_attempts"));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(ConfigError::ProbeTimeoutTooLong {
                timeout: self.probe_timeout,
                interval: self.probe_interval,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub wifi: WifiCredentials,
    pub device_id: String,
    pub config_url: String,
    pub auth_token: String,
    pub auth_placement: AuthPlacement,
    /// Optional `Authorization` value sent with every reading.
    pub ingest_token: Option<String>,
    pub thresholds: Thresholds,
}

impl AgentConfig {
    /// Configuration baked in at compile time.
    pub fn from_build_env() -> Result<Self, ConfigError> {
        let wifi = WifiCredentials::new(
            option_env!("AGENT_WIFI_SSID").unwrap_or("GRATIS"),
            option_env!("AGENT_WIFI_PASSWORD").unwrap_or(""),
        )?;
        let auth_placement = match option_env!("AGENT_AUTH_IN_QUERY") {
            Some("1") | Some("true") => AuthPlacement::Query,
            _ => AuthPlacement::Header,
        };
        let config = Self {
            wifi,
            device_id: option_env!("AGENT_DEVICE_ID").unwrap_or(DEFAULT_DEVICE_ID).to_string(),
            config_url: option_env!("AGENT_CONFIG_URL").unwrap_or(DEFAULT_CONFIG_URL).to_string(),
            auth_token: option_env!("AGENT_AUTH_TOKEN").unwrap_or_default().to_string(),
            auth_placement,
            ingest_token: option_env!("AGENT_INGEST_TOKEN")
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            thresholds: Thresholds::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::MissingDeviceId);
        }
        if !(self.config_url.starts_with("http://") || self.config_url.starts_with("https://")) {
            return Err(ConfigError::BadConfigUrl(self.config_url.clone()));
        }
        self.thresholds.validate()
    }
}
