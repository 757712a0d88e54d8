#[cfg(target_os = "espidf")]
mod device {
    use anyhow::Result;
    use esp_idf_hal::{
        i2c::{I2cConfig, I2cDriver},
        peripherals::Peripherals,
        prelude::*,
    };
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition, wifi::EspWifi};
    use log::{error, info, warn};

    use sensor_agent::esp::{
        self, Bme280Sensors, EspClock, EspHttpTransport, EspWifiLink, TaskWatchdogFeeder,
    };
    use sensor_agent::status::StatusReporter;
    use sensor_agent::{AgentConfig, CycleScheduler};

    /// Longest legitimate stall is a full batch of retried posts.
    const TASK_WDT_TIMEOUT_SECS: u32 = 300;
    const STATUS_REPORT_PERIOD_MS: u64 = 5 * 60_000;

    pub fn run() -> Result<()> {
        let config = AgentConfig::from_build_env()?;
        info!("device {} using {}", config.device_id, config.config_url);

        let peripherals = Peripherals::take()?;
        let sys_loop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;
        let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs))?;
        let link = EspWifiLink::start(wifi, &config.wifi)?;

        let i2c = I2cDriver::new(
            peripherals.i2c0,
            peripherals.pins.gpio8,
            peripherals.pins.gpio9,
            &I2cConfig::new().baudrate(100.kHz().into()),
        )?;
        let sensors = Bme280Sensors::new(i2c)?;

        let mut agent = CycleScheduler::new(&config, link, EspHttpTransport, EspClock, sensors)
            .with_collaborator(Box::new(TaskWatchdogFeeder::start(TASK_WDT_TIMEOUT_SECS)?))
            .with_collaborator(Box::new(StatusReporter::new(STATUS_REPORT_PERIOD_MS)));

        if let Err(e) = agent.boot() {
            warn!("boot without link: {}", e);
        }
        let timeout = agent.run();
        error!("{}, restarting", timeout);
        esp::restart()
    }
}

#[cfg(target_os = "espidf")]
fn main() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("starting sensor agent");

    if let Err(e) = device::run() {
        log::error!("startup failed: {:?}", e);
        sensor_agent::esp::restart();
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("sensor-agent only runs on ESP-IDF targets; the supervisor core is exercised by the library tests");
}
