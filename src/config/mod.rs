//! Configuration management

use crate::pinning::PinStore;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client behavior
    #[serde(default)]
    pub client: ClientConfig,
    /// Pinned leaf certificates
    #[serde(default, rename = "pin")]
    pub pins: Vec<PinEntry>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Decode the pin entries into an immutable pin table
    pub fn pin_store(&self) -> Result<PinStore, crate::Error> {
        let mut store = PinStore::new();
        for entry in &self.pins {
            let der = STANDARD.decode(&entry.certificate).map_err(|e| {
                crate::Error::Config(format!(
                    "Invalid pinned certificate for {}: {}",
                    entry.host, e
                ))
            })?;
            if der.is_empty() {
                return Err(crate::Error::Config(format!(
                    "Empty pinned certificate for {}",
                    entry.host
                )));
            }
            store.insert(entry.host.clone(), CertificateDer::from(der));
        }
        Ok(store)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout in seconds (connection included)
    pub request_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: 30,
        }
    }
}

/// One pinned leaf: the expected host and its DER certificate in base64
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinEntry {
    /// Host the pin applies to
    pub host: String,
    /// DER-encoded leaf certificate (base64)
    pub certificate: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client.request_timeout, 30);
        assert_eq!(parsed.logging.level, "info");
        assert!(parsed.pins.is_empty());
    }

    #[test]
    fn test_pin_store_decodes_entries() {
        let config: Config = toml::from_str(
            r#"
            [[pin]]
            host = "proxy.example"
            certificate = "AAECAw=="
            "#,
        )
        .unwrap();

        let store = config.pin_store().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.pinned_for("proxy.example").unwrap().as_ref(),
            &[0u8, 1, 2, 3]
        );
    }

    #[test]
    fn test_pin_store_rejects_bad_base64() {
        let config: Config = toml::from_str(
            r#"
            [[pin]]
            host = "proxy.example"
            certificate = "not base64!!!"
            "#,
        )
        .unwrap();

        assert!(config.pin_store().is_err());
    }
}
