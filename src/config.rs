use bluer::Uuid;
use std::env;
use std::time::Duration;

/// GATT service exposed by the ESP32 sensor firmware
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
/// Characteristic carrying `Analog:<int>,Avg:<float>` notifications
pub const STEP_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0xbeefcafe_36e1_4688_b7f5_00000000000b);

const DEFAULT_DEVICE_NAME: &str = "ESP32_BLE";
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub device_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// `None` lets the scan run until the target shows up
    pub scan_timeout: Option<Duration>,
    pub adapter_name: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            characteristic_uuid: STEP_DATA_CHAR_UUID,
            scan_timeout: Some(Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS)),
            adapter_name: None,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    ///
    /// Blank values are treated as unset so an empty line in `.env`
    /// falls back to the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = MonitorConfig::default();

        if let Some(name) = get("TELEMETRY_DEVICE_NAME") {
            config.device_name = name;
        }

        if let Some(raw) = get("TELEMETRY_SCAN_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|e| {
                format!(
                    "TELEMETRY_SCAN_TIMEOUT_SECS must be a whole number of seconds, got '{}': {}",
                    raw, e
                )
            })?;
            config.scan_timeout = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }

        config.adapter_name = get("BLUETOOTH_ADAPTER");

        Ok(config)
    }
}
