//! Exporter configuration

use anyhow::Result;
use serde::Deserialize;

/// Runtime settings, from environment with CLI overrides on top
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterSettings {
    /// Path to the emulation config document
    #[serde(default = "default_config_path")]
    pub config_path: String,

    /// HTTP port for the exposition endpoint
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between collection cycles
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Optional kubeconfig path; ambient config when unset
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

fn default_config_path() -> String {
    "emulation-config.json".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_update_interval() -> u64 {
    5
}

impl ExporterSettings {
    /// Load from `EXPORTER_`-prefixed environment variables. An unset
    /// environment yields the defaults; a malformed value is an error.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EXPORTER"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the EXPORTER_* environment is never mutated concurrently.
    #[test]
    fn test_load_defaults_overrides_and_malformed_values() {
        std::env::remove_var("EXPORTER_PORT");
        let settings = ExporterSettings::load().unwrap();
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.update_interval_secs, 5);
        assert_eq!(settings.config_path, "emulation-config.json");
        assert!(settings.kubeconfig.is_none());

        std::env::set_var("EXPORTER_PORT", "9191");
        let settings = ExporterSettings::load().unwrap();
        assert_eq!(settings.port, 9191);

        std::env::set_var("EXPORTER_PORT", "not-a-port");
        assert!(ExporterSettings::load().is_err());
        std::env::remove_var("EXPORTER_PORT");
    }
}
