//! ESP-IDF bindings for the supervisor seams.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bme280::i2c::BME280;
use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::{Method as SvcMethod, Status};
use embedded_svc::io::{Read, Write};
use esp_idf_hal::delay::Ets;
use esp_idf_hal::i2c::I2cDriver;
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use log::{error, info};

use crate::clock::{Clock, Millis};
use crate::config::WifiCredentials;
use crate::net::{HttpRequest, HttpResponse, HttpTransport, LinkStatus, Method, WifiLink};
use crate::scheduler::{Collaborator, SensorSource};
use crate::status::StatusSnapshot;
use crate::telemetry::Reading;

const READ_CHUNK: usize = 512;

/// Milliseconds since boot from the high resolution timer.
pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> Millis {
        let micros = unsafe { esp_idf_sys::esp_timer_get_time() };
        (micros / 1000) as Millis
    }

    fn sleep_ms(&self, ms: Millis) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Station-mode WiFi. Connects are fire-and-forget; progress is read back
/// through [`WifiLink::status`].
pub struct EspWifiLink {
    wifi: EspWifi<'static>,
}

impl EspWifiLink {
    pub fn start(mut wifi: EspWifi<'static>, credentials: &WifiCredentials) -> Result<Self> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: credentials.ssid.clone(),
            password: credentials.password.clone(),
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        info!("wifi started, joining {}", credentials.ssid);
        wifi.connect()?;
        Ok(Self { wifi })
    }
}

impl WifiLink for EspWifiLink {
    fn status(&self) -> LinkStatus {
        match (self.wifi.is_connected(), self.wifi.is_up()) {
            (_, Ok(true)) => LinkStatus::Connected,
            (Ok(true), _) => LinkStatus::Connecting,
            _ => LinkStatus::Disconnected,
        }
    }

    fn ip(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    /// Only asked for while the station is idle, so there is no association
    /// to tear down first.
    fn request_reconnect(&mut self) -> Result<()> {
        self.wifi.connect()?;
        Ok(())
    }
}

/// One `EspHttpConnection` per request, so a wedged socket never outlives
/// its timeout.
#[derive(Default)]
pub struct EspHttpTransport;

impl HttpTransport for EspHttpTransport {
    fn request(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
        let conf = HttpConfiguration {
            timeout: Some(Duration::from_millis(request.timeout)),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&conf)?);

        let method = match request.method {
            Method::Get => SvcMethod::Get,
            Method::Post => SvcMethod::Post,
        };
        let content_length = request.body.len().to_string();
        let mut headers = request.headers.to_vec();
        if !request.body.is_empty() {
            headers.push(("Content-Length", content_length.as_str()));
        }

        let mut outgoing = client
            .request(method, request.url, &headers)
            .map_err(|e| anyhow!("{e:?}"))?;
        if !request.body.is_empty() {
            outgoing.write_all(request.body).map_err(|e| anyhow!("{e:?}"))?;
            outgoing.flush().map_err(|e| anyhow!("{e:?}"))?;
        }
        let mut response = outgoing.submit().map_err(|e| anyhow!("{e:?}"))?;

        let status = response.status();
        let mut body = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }
        Ok(HttpResponse { status, body })
    }
}

/// BME280 on I2C: temperature (°C), humidity (%) and pressure (hPa).
pub struct Bme280Sensors {
    sensor: BME280<I2cDriver<'static>>,
    delay: Ets,
}

impl Bme280Sensors {
    pub fn new(i2c: I2cDriver<'static>) -> Result<Self> {
        let mut sensor = BME280::new_primary(i2c);
        let mut delay = Ets;
        sensor
            .init(&mut delay)
            .map_err(|e| anyhow!("bme280 init failed: {e:?}"))?;
        Ok(Self { sensor, delay })
    }
}

impl SensorSource for Bme280Sensors {
    fn read(&mut self) -> Vec<Reading> {
        match self.sensor.measure(&mut self.delay) {
            Ok(m) => vec![
                Reading::new("bme280-temp", m.temperature),
                Reading::new("bme280-humidity", m.humidity),
                Reading::new("bme280-pressure", m.pressure / 100.0),
            ],
            Err(e) => {
                error!("bme280 read error: {:?}", e);
                Vec::new()
            }
        }
    }
}

/// Keeps the main task registered with the ESP task watchdog and feeds it
/// at the top of every tick.
pub struct TaskWatchdogFeeder;

impl TaskWatchdogFeeder {
    pub fn start(timeout_secs: u32) -> Result<Self> {
        let config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms: timeout_secs.saturating_mul(1000),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let rc = unsafe { esp_idf_sys::esp_task_wdt_init(&config) };
        if rc != esp_idf_sys::ESP_OK && rc != esp_idf_sys::ESP_ERR_INVALID_STATE {
            return Err(anyhow!("esp_task_wdt_init failed with code {}", rc));
        }
        let rc = unsafe { esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut()) };
        if rc != esp_idf_sys::ESP_OK && rc != esp_idf_sys::ESP_ERR_INVALID_STATE {
            return Err(anyhow!("esp_task_wdt_add failed with code {}", rc));
        }
        info!("task watchdog armed ({}s)", timeout_secs);
        Ok(Self)
    }
}

impl Collaborator for TaskWatchdogFeeder {
    fn service(&mut self, _now: Millis, _status: &StatusSnapshot) {
        let _ = unsafe { esp_idf_sys::esp_task_wdt_reset() };
    }
}

pub fn restart() -> ! {
    unsafe { esp_idf_sys::esp_restart() }
}
