//! Wiring of the FOTA engine to the ESP-IDF collaborators.

use crate::config::Config;
use crate::flash::EspFlashWriter;
use crate::http::EspHttpClient;
use crate::nvs_store::NvsStateStore;
use crate::watchdog::WatchdogHandle;
use anyhow::Result;
use ecowatt_fota_lib::{Fota, FotaApi, FotaKeys, FotaOutcome};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::ota::EspOta;
use log::info;
use std::rc::Rc;
use std::time::Duration;

/// Firmware version from `Cargo.toml`, compared against the manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// AES-128 content key shared with the update server.
const ENC_KEY: [u8; 16] = [
    0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81,
];

/// HMAC-SHA-256 chunk authentication key shared with the update server.
const MAC_KEY: [u8; 32] = [
    0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81,
    0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, 0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14, 0xdf, 0xf4,
];

const KEYS: FotaKeys = FotaKeys::new(ENC_KEY, MAC_KEY);

/// Mark the currently running OTA slot as valid.
///
/// Must be called early in `main()` when rollback is enabled
/// (`CONFIG_BOOTLOADER_APP_ROLLBACK_ENABLE=y`). If the new firmware crashes
/// before this call, the bootloader reverts to the previous image.
pub fn mark_running_slot_valid() -> Result<()> {
    let mut ota = EspOta::new()?;
    ota.mark_running_slot_valid()?;
    info!("OTA: running slot marked valid");
    Ok(())
}

type DeviceFota = Fota<FotaApi<EspHttpClient>, NvsStateStore, EspFlashWriter>;

/// The update engine bound to NVS, the OTA slots and the ESP HTTP client.
pub struct FotaService {
    fota: DeviceFota,
}

impl FotaService {
    pub fn new(config: &Config, nvs: EspDefaultNvsPartition, watchdog: &Rc<WatchdogHandle>) -> Result<Self> {
        let device_id = config.device_id();
        info!("FOTA: device {device_id}, server {}", config.api_base);

        let client = EspHttpClient::new(Duration::from_millis(config.http_timeout_ms), watchdog.clone());
        let transport = FotaApi::new(&config.api_base, device_id, client);
        let store = NvsStateStore::new(nvs)?;
        let flash = EspFlashWriter::new(watchdog.clone());

        Ok(Self {
            fota: Fota::new(transport, store, flash, KEYS),
        })
    }

    /// Run one update cycle. On success this does not return: the device
    /// restarts into the new image.
    pub fn run_cycle(&mut self) -> FotaOutcome {
        info!("FOTA: starting update cycle (running {VERSION})");
        let outcome = self.fota.run(VERSION);
        info!("FOTA: cycle finished in phase {}", self.fota.phase());
        outcome
    }
}
