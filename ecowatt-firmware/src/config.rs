use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::sys::{esp_mac_type_t_ESP_MAC_WIFI_STA, esp_read_mac};
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Read WiFi STA MAC address from eFuse (available before WiFi driver init)
fn get_wifi_sta_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    // SAFETY: esp_read_mac just reads from eFuse, no driver needed
    unsafe {
        esp_read_mac(mac.as_mut_ptr(), esp_mac_type_t_ESP_MAC_WIFI_STA);
    }
    mac
}

/// Format a MAC address as `AA:BB:CC:DD:EE:FF`.
fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

const NVS_NAMESPACE: &str = "ecowatt";
const NVS_CONFIG_KEY: &str = "config";

// Global NVS handle - initialized once in main
static NVS: Mutex<Option<EspNvs<NvsDefault>>> = Mutex::new(None);

pub fn init_nvs(nvs_partition: EspNvsPartition<NvsDefault>) -> Result<()> {
    debug!("Initializing NVS namespace: {NVS_NAMESPACE}");
    let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
    *NVS.lock().map_err(|_| anyhow!("NVS lock poisoned"))? = Some(nvs);
    info!("NVS initialized");
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: option_env!("ECOWATT_WIFI_SSID").unwrap_or("EcoWatt").to_string(),
            password: option_env!("ECOWATT_WIFI_PASSWORD").map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub wifi: WifiConfig,
    /// Base URL of the FOTA endpoints (`{api_base}/manifest`, ...)
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Seconds between update cycles
    #[serde(default = "default_fota_interval_secs")]
    pub fota_interval_secs: u64,
    /// Per-request HTTP timeout
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Identifier sent in reports (defaults to the STA MAC)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

fn default_api_base() -> String {
    option_env!("ECOWATT_API_BASE")
        .unwrap_or("http://192.168.4.2:5000")
        .to_string()
}

const fn default_fota_interval_secs() -> u64 {
    3600
}

/// Maximum HTTP timeout to avoid triggering the task watchdog mid-request
pub const MAX_HTTP_TIMEOUT_MS: u64 = 4500;

const fn default_http_timeout_ms() -> u64 {
    MAX_HTTP_TIMEOUT_MS
}

/// Shortest allowed pause between update cycles
const MIN_FOTA_INTERVAL_SECS: u64 = 10;

impl Default for Config {
    fn default() -> Self {
        Self {
            wifi: WifiConfig::default(),
            api_base: default_api_base(),
            log_level: LogLevel::default(),
            fota_interval_secs: default_fota_interval_secs(),
            http_timeout_ms: default_http_timeout_ms(),
            device_id: None,
        }
    }
}

impl Config {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if self.http_timeout_ms > MAX_HTTP_TIMEOUT_MS {
            warn!("Clamping http_timeout_ms from {} to {}", self.http_timeout_ms, MAX_HTTP_TIMEOUT_MS);
            self.http_timeout_ms = MAX_HTTP_TIMEOUT_MS;
        }
        if self.fota_interval_secs < MIN_FOTA_INTERVAL_SECS {
            warn!("Clamping fota_interval_secs from {} to {}", self.fota_interval_secs, MIN_FOTA_INTERVAL_SECS);
            self.fota_interval_secs = MIN_FOTA_INTERVAL_SECS;
        }
        if self.wifi.ssid.is_empty() {
            warn!("WiFi SSID is empty, resetting to default");
            self.wifi = WifiConfig::default();
        }
        if self.api_base.is_empty() {
            warn!("API base is empty, resetting to default");
            self.api_base = default_api_base();
        }
        if self.device_id.as_deref().is_some_and(str::is_empty) {
            self.device_id = None;
        }
    }

    /// Device identifier used in FOTA reports.
    pub fn device_id(&self) -> String {
        self.device_id
            .clone()
            .unwrap_or_else(|| format_mac(get_wifi_sta_mac()))
    }

    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(mut config) => {
                info!("Loaded config from NVS");
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from NVS: {e}, using defaults");
                let config = Self::default();
                if let Err(e) = config.save() {
                    warn!("Failed to store default config: {e}");
                }
                config
            }
        }
    }

    pub fn load() -> Result<Self> {
        debug!("Loading config from NVS");
        let nvs_guard = NVS.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = nvs_guard.as_ref().ok_or_else(|| anyhow!("NVS not initialized"))?;

        // Get the blob length first
        let len = nvs.blob_len(NVS_CONFIG_KEY)?;
        if let Some(len) = len {
            debug!("Config blob size: {len} bytes");
            let mut buf = vec![0u8; len];
            nvs.get_blob(NVS_CONFIG_KEY, &mut buf)?;
            let config: Config = serde_json::from_slice(&buf)?;
            debug!(
                "Config parsed: wifi.ssid={:?}, api_base={}, log_level={:?}",
                config.wifi.ssid, config.api_base, config.log_level
            );
            Ok(config)
        } else {
            Err(anyhow!("No config found in NVS"))
        }
    }

    pub fn save(&self) -> Result<()> {
        debug!("Saving config to NVS");
        let mut nvs_guard = NVS.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = nvs_guard.as_mut().ok_or_else(|| anyhow!("NVS not initialized"))?;

        let json = serde_json::to_vec(self)?;
        debug!("Config JSON size: {} bytes", json.len());
        nvs.set_blob(NVS_CONFIG_KEY, &json)?;
        info!("Config saved to NVS");
        Ok(())
    }
}
