use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tabpilot_core::{PilotError, Result};

use crate::schema::TabpilotConfig;

/// Loads and reloads the tabpilot configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<TabpilotConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > TABPILOT_CONFIG env > ~/.tabpilot/tabpilot.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("TABPILOT_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tabpilot")
            .join("tabpilot.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            TabpilotConfig::default()
        };

        let config = Self::apply_env_overrides(config, |k| std::env::var(k).ok());
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Parse a config document without touching the filesystem or environment.
    pub fn parse(raw: &str) -> Result<TabpilotConfig> {
        toml::from_str::<TabpilotConfig>(raw)
            .map_err(|e| PilotError::Config(format!("invalid configuration: {}", e)))
    }

    fn read(path: &Path) -> Result<TabpilotConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<TabpilotConfig>(&raw).map_err(|e| {
            PilotError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate: log warnings, fail on errors.
    fn check(config: &TabpilotConfig) -> Result<()> {
        let warnings = config.validate().map_err(PilotError::Config)?;
        for w in &warnings {
            warn!("{}", w);
        }
        Ok(())
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> TabpilotConfig {
        self.config.read().clone()
    }

    pub fn shared(&self) -> Arc<RwLock<TabpilotConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply TABPILOT_* overrides read through `lookup`.
    pub fn apply_env_overrides(
        mut config: TabpilotConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> TabpilotConfig {
        if let Some(v) = lookup("TABPILOT_RELAY_URL") {
            config.relay.url = v;
        }
        if let Some(v) = lookup("TABPILOT_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("TABPILOT_CDP_PORT") {
            match v.parse::<u16>() {
                Ok(port) => config.device.cdp_port = port,
                Err(_) => warn!(value = %v, "ignoring invalid TABPILOT_CDP_PORT"),
            }
        }
        config
    }

    /// Re-read the config file. The current config is kept if the new one
    /// fails to parse or validate.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(PilotError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::read(&self.config_path)?;
        let new_config = Self::apply_env_overrides(new_config, |k| std::env::var(k).ok());
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }
}
