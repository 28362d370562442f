use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ota::{HeaderMode, UpdatePolicy, DESCRIPTOR_PREFIX_LEN};

#[cfg(target_os = "espidf")]
const CONFIG_NAMESPACE: &str = "ota";
#[cfg(target_os = "espidf")]
const CONFIG_KEY: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    // Transfer
    pub recv_buffer_size: usize,
    pub header_mode: HeaderMode,
    pub reject_running_version: bool,

    // Post-boot diagnostics
    pub diagnostic_pin: i32,
    pub diagnostic_duration_ms: u32,

    pub reset_delay_ms: u32,
    pub log_level: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 1024,
            header_mode: HeaderMode::FirstChunk,
            reject_running_version: false,
            diagnostic_pin: 4,
            diagnostic_duration_ms: 5000,
            reset_delay_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl OtaConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: OtaConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(256..=16 * 1024).contains(&self.recv_buffer_size) {
            return Err(anyhow!("recv_buffer_size must be between 256 and 16384 bytes"));
        }
        if self.header_mode == HeaderMode::FirstChunk && self.recv_buffer_size < DESCRIPTOR_PREFIX_LEN {
            return Err(anyhow!(
                "recv_buffer_size {} cannot hold the {}-byte image header in one read",
                self.recv_buffer_size,
                DESCRIPTOR_PREFIX_LEN
            ));
        }
        if !(0..=48).contains(&self.diagnostic_pin) {
            return Err(anyhow!("diagnostic_pin {} is not a valid GPIO", self.diagnostic_pin));
        }
        if self.diagnostic_duration_ms > 60_000 {
            return Err(anyhow!("diagnostic_duration_ms must be at most 60 s"));
        }
        if crate::logging::parse_level(&self.log_level).is_none() {
            return Err(anyhow!("unknown log level '{}'", self.log_level));
        }
        Ok(())
    }

    pub fn policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            header_mode: self.header_mode,
            reject_running_version: self.reject_running_version,
            recv_buffer_size: self.recv_buffer_size,
        }
    }

    pub fn reset_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reset_delay_ms as u64)
    }

    #[cfg(target_os = "espidf")]
    pub fn save(&self) -> Result<()> {
        save_to_nvs(self)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub fn load_or_default() -> Result<OtaConfig> {
    match load_from_nvs() {
        Ok(config) => {
            log::info!("Loaded configuration from NVS");
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = OtaConfig::default();

            // Try to save default config to NVS for next time
            if let Err(save_err) = config.save() {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }

            Ok(config)
        }
    }
}

#[cfg(target_os = "espidf")]
fn load_from_nvs() -> Result<OtaConfig> {
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 1024]; // Max config size
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow!("Config not found in NVS"))?;

    let config: OtaConfig = serde_json::from_slice(data)?;
    config.validate()?;
    Ok(config)
}

#[cfg(target_os = "espidf")]
fn save_to_nvs(config: &OtaConfig) -> Result<()> {
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, false)?;

    let json = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &json)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OtaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy(), UpdatePolicy::default());
        assert_eq!(config.reset_delay(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config = OtaConfig::from_json(r#"{"header_mode":"accumulate","diagnostic_pin":9}"#).unwrap();
        assert_eq!(config.header_mode, HeaderMode::Accumulate);
        assert_eq!(config.diagnostic_pin, 9);
        assert_eq!(config.recv_buffer_size, 1024);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(OtaConfig::from_json(r#"{"recv_buffer_size":16}"#).is_err());
        assert!(OtaConfig::from_json(r#"{"recv_buffer_size":256}"#).is_err());
        assert!(OtaConfig::from_json(r#"{"recv_buffer_size":256,"header_mode":"accumulate"}"#).is_ok());
        assert!(OtaConfig::from_json(r#"{"log_level":"chatty"}"#).is_err());
        assert!(OtaConfig::from_json(r#"{"diagnostic_pin":99}"#).is_err());
        assert!(OtaConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = OtaConfig { reject_running_version: true, ..Default::default() };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(OtaConfig::from_json(&json).unwrap(), config);
    }
}
