use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use ecowatt_fota_lib::FotaOutcome;
use log::{info, warn};
use std::rc::Rc;
use std::time::Duration;

mod config;
mod flash;
mod fota;
mod http;
mod nvs_store;
mod watchdog;

use crate::watchdog::WatchdogHandle;
use config::Config;
use fota::FotaService;

/// Join the configured network if not already connected.
///
/// Waits for an IP in 3s steps so the watchdog is fed while the driver
/// associates.
fn ensure_connected(wifi: &mut BlockingWifi<EspWifi<'static>>, ssid: &str, watchdog: &WatchdogHandle) -> bool {
    if wifi.is_up().unwrap_or(false) {
        return true;
    }

    info!("Connecting to '{ssid}'...");
    if let Err(e) = wifi.wifi_mut().connect() {
        warn!("STA connection failed: {e:?}");
        return false;
    }

    // Wait for IP with watchdog-friendly polling (3s chunks, up to 15s total)
    for _ in 0..5 {
        watchdog.feed();
        let result = wifi.ip_wait_while(|| wifi.is_up().map(|up| !up), Some(Duration::from_secs(3)));
        if result.is_ok() {
            if let Ok(ip_info) = wifi.wifi().sta_netif().get_ip_info() {
                info!("WiFi STA connected to '{ssid}' with IP: {}", ip_info.ip);
                return true;
            }
        }
    }
    watchdog.feed();

    warn!("Connection to '{ssid}' failed, retrying next cycle");
    if let Err(e) = wifi.disconnect() {
        warn!("Failed to reset STA connection: {e:?}");
    }
    false
}

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting EcoWatt firmware {} ({})", fota::VERSION, env!("GIT_VERSION"));

    // A freshly flashed image that gets this far is good enough to keep
    if let Err(e) = fota::mark_running_slot_valid() {
        warn!("Failed to mark running slot valid: {e}");
    }

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Initialize NVS for config storage
    config::init_nvs(nvs.clone())?;
    let config = Config::load_or_default();

    // Apply configured log level
    let level = config.log_level.as_level_filter();
    if let Err(e) = esp_idf_svc::log::set_target_level("*", level) {
        warn!("Failed to set log level: {e}");
    } else {
        info!("Log level set to {:?}", config.log_level);
    }

    let watchdog = Rc::new(WatchdogHandle::register(c"fota")?);

    info!("Initializing WiFi...");
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs.clone()))?,
        sys_loop,
    )?;
    let password = config.wifi.password.clone().unwrap_or_default();
    let auth_method = if password.is_empty() { AuthMethod::None } else { AuthMethod::WPA2Personal };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config.wifi.ssid.as_str().try_into().unwrap_or_default(),
        password: password.as_str().try_into().unwrap_or_default(),
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;

    let mut service = FotaService::new(&config, nvs, &watchdog)?;

    // FOTA runs on the main context only, so nothing else touches the
    // network stack or the update slot while a cycle is in progress.
    loop {
        watchdog.feed();
        if ensure_connected(&mut wifi, &config.wifi.ssid, &watchdog) {
            match service.run_cycle() {
                FotaOutcome::UpToDate => info!("Firmware is up to date"),
                FotaOutcome::RebootPending { version } => info!("Rebooting into {version}"),
                FotaOutcome::Aborted(e) => warn!("Update attempt failed: {e}"),
            }
        }

        for _ in 0..config.fota_interval_secs {
            FreeRtos::delay_ms(1000);
            watchdog.feed();
        }
    }
}
