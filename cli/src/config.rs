// Configuration management for blelink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blelink/config.json
// - Linux: ~/.config/blelink/config.json
// - Windows: %APPDATA%\blelink\config.json

use anyhow::{Context, Result};
use blelink_core::transport::ble::SecurityParams;
use blelink_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to the orchestrator
    pub orchestrator: OrchestratorConfig,

    /// Default log filter when RUST_LOG is unset
    pub log_level: Option<String>,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blelink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let orchestrator = &mut self.orchestrator;
        match key {
            "auto_accept_pairing" => {
                orchestrator.auto_accept_pairing = value.parse().context("Invalid boolean value")?;
            }
            "auto_accept_link_updates" => {
                orchestrator.auto_accept_link_updates =
                    value.parse().context("Invalid boolean value")?;
            }
            "batch_window_ms" => {
                orchestrator.batch_window_ms = value.parse().context("Invalid number")?;
            }
            "conn_interval_ms" => {
                let interval: f64 = value.parse().context("Invalid number")?;
                if !(7.5..=4000.0).contains(&interval) {
                    anyhow::bail!("Connection interval must be within 7.5..4000 ms");
                }
                orchestrator.connection_params.min_conn_interval_ms = interval;
                orchestrator.connection_params.max_conn_interval_ms = interval;
            }
            "slave_latency" => {
                orchestrator.connection_params.slave_latency =
                    value.parse().context("Invalid number")?;
            }
            "conn_sup_timeout_ms" => {
                orchestrator.connection_params.conn_sup_timeout_ms =
                    value.parse().context("Invalid number")?;
            }
            "security" => {
                orchestrator.security_params = match value {
                    "none" | "" => None,
                    "default" => Some(SecurityParams::default()),
                    _ => anyhow::bail!("Invalid security value (expected none or default)"),
                };
            }
            "bond" | "mitm" | "lesc" | "keypress" => {
                let flag: bool = value.parse().context("Invalid boolean value")?;
                let params = orchestrator
                    .security_params
                    .get_or_insert_with(SecurityParams::default);
                match key {
                    "bond" => params.bond = flag,
                    "mitm" => params.mitm = flag,
                    "lesc" => params.lesc = flag,
                    _ => params.keypress = flag,
                }
            }
            "log_level" => {
                self.log_level = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let o = &self.orchestrator;
        let security = o.security_params;
        let flag = |f: fn(&SecurityParams) -> bool| {
            security
                .as_ref()
                .map(|p| f(p).to_string())
                .unwrap_or_else(|| "-".to_string())
        };

        vec![
            ("auto_accept_pairing".to_string(), o.auto_accept_pairing.to_string()),
            (
                "auto_accept_link_updates".to_string(),
                o.auto_accept_link_updates.to_string(),
            ),
            ("batch_window_ms".to_string(), o.batch_window_ms.to_string()),
            (
                "conn_interval_ms".to_string(),
                o.connection_params.min_conn_interval_ms.to_string(),
            ),
            (
                "slave_latency".to_string(),
                o.connection_params.slave_latency.to_string(),
            ),
            (
                "conn_sup_timeout_ms".to_string(),
                o.connection_params.conn_sup_timeout_ms.to_string(),
            ),
            (
                "security".to_string(),
                if security.is_some() { "default" } else { "none" }.to_string(),
            ),
            ("bond".to_string(), flag(|p| p.bond)),
            ("mitm".to_string(), flag(|p| p.mitm)),
            ("lesc".to_string(), flag(|p| p.lesc)),
            ("keypress".to_string(), flag(|p| p.keypress)),
            (
                "log_level".to_string(),
                self.log_level.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }
}
