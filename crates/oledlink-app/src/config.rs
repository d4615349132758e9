//! Settings file for the command-line shell.

use anyhow::{Context, Result};
use oledlink_core::{BridgeSettings, ConfigError, DecodePolicy, LineEnding};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailure {
    #[default]
    Recover,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    #[default]
    Lf,
    Cr,
    Crlf,
}

impl From<Terminator> for LineEnding {
    fn from(t: Terminator) -> Self {
        match t {
            Terminator::Lf => LineEnding::LF,
            Terminator::Cr => LineEnding::CR,
            Terminator::Crlf => LineEnding::CRLF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Port used by the last successful start.
    pub last_port: Option<String>,
    pub interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub line_ending: Terminator,
    pub decode_failure: DecodeFailure,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            last_port: None,
            interval_ms: 1000,
            poll_timeout_ms: 500,
            write_timeout_ms: 1000,
            line_ending: Terminator::Lf,
            decode_failure: DecodeFailure::Recover,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("oledlink").join("config.json"))
    }

    /// Reads `path`, or returns the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn to_settings(&self) -> Result<BridgeSettings, ConfigError> {
        let mut settings = BridgeSettings {
            interval: Duration::from_millis(self.interval_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            decode_policy: match self.decode_failure {
                DecodeFailure::Recover => DecodePolicy::Recover,
                DecodeFailure::Stop => DecodePolicy::Stop,
            },
            ..Default::default()
        };
        settings.serial.line_ending = self.line_ending.into();
        settings.serial.write_timeout = Duration::from_millis(self.write_timeout_ms);
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write timeout must be greater than zero".to_string()));
        }
        settings.validate()?;
        Ok(settings)
    }
}
