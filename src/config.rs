use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::macros::DEFAULT_STEP_DELAY_MS;
use crate::serial::{UsbFilter, DEFAULT_BAUD_RATE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Console settings, read from `config.toml` and overridden by CLI flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    pub baud_rate: u32,
    /// Fixed port path; skips discovery when set
    pub port: Option<String>,
    pub usb_filters: Vec<UsbFilter>,
    /// Skip the picker when discovery finds a single device
    pub auto_select: bool,
    pub macro_step_delay_ms: u64,
    pub read_buffer_size: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            port: None,
            usb_filters: UsbFilter::esp32_defaults(),
            auto_select: true,
            macro_step_delay_ms: DEFAULT_STEP_DELAY_MS,
            read_buffer_size: 1024,
        }
    }
}

impl ConsoleConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("marauder-console").join("config.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ConsoleConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit file, or the default location if it exists.
    /// A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                log::info!("Loading config from {}", path.display());
                Self::from_toml_str(&text)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn macro_step_delay(&self) -> Duration {
        Duration::from_millis(self.macro_step_delay_ms)
    }
}
