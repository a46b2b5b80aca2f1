//! Configuration management for the KCP front-end.
//!
//! Servers are configured from a JSON file holding the bind address, the
//! security parameters, the per-session transport knobs and the log level.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::crypt::SecurityConfig;
use crate::transport::SessionTuning;

const MIN_MTU: usize = 50;
const MAX_MTU: usize = 1500;
const MAX_INTERVAL: Duration = Duration::from_secs(5);

/// Error types for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("listen address must not be empty")]
    EmptyListenAddr,

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("mtu {0} out of range (50..=1500)")]
    InvalidMtu(usize),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("kdf iterations must be > 0")]
    InvalidKdfIterations,

    #[error("parity shards require data shards")]
    InvalidShards,
}

/// Helper trait for loading/saving configuration files.
pub trait FileConfig: Serialize + for<'de> Deserialize<'de> + Default + Sized {
    /// Load configuration from a JSON file.
    ///
    /// If the file doesn't exist, returns default config.
    /// If the file exists but is invalid, returns an error.
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        // Atomic write: write to temp file first, then rename
        let temp_path = path.as_ref().with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<(), ConfigError>;

    fn log_level(&self) -> &str;

    /// Get tracing::Level from log_level string.
    fn log_level_as_tracing(&self) -> tracing::Level {
        match self.log_level().to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Server configuration loaded from JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:29900")
    pub listen_addr: String,

    /// Shared secret, cipher and key-derivation parameters
    pub security: SecurityConfig,

    /// Knobs applied to every accepted session
    pub tuning: SessionTuning,

    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:29900".to_string(),
            security: SecurityConfig::default(),
            tuning: SessionTuning::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn with_listen_addr(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }
}

impl FileConfig for ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log_level.clone())),
        }

        let tuning = &self.tuning;
        if !(MIN_MTU..=MAX_MTU).contains(&tuning.mtu) {
            return Err(ConfigError::InvalidMtu(tuning.mtu));
        }
        if tuning.interval < Duration::from_millis(1) {
            return Err(ConfigError::InvalidInterval(
                "interval too short (min 1ms)".to_string(),
            ));
        }
        if tuning.interval > MAX_INTERVAL {
            return Err(ConfigError::InvalidInterval(
                "interval too long (max 5s)".to_string(),
            ));
        }
        if tuning.parity_shards > 0 && tuning.data_shards == 0 {
            return Err(ConfigError::InvalidShards);
        }

        if self.security.kdf.iterations == 0 {
            return Err(ConfigError::InvalidKdfIterations);
        }

        Ok(())
    }

    fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Module for Duration serialization/deserialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        let millis = duration.subsec_millis();
        if secs >= 60 && millis == 0 {
            serializer.serialize_str(&format!("{}s", secs))
        } else if secs >= 1 {
            serializer.serialize_str(&format!("{}.{:03}s", secs, millis))
        } else if millis >= 1 {
            serializer.serialize_str(&format!("{}ms", millis))
        } else {
            serializer.serialize_str("0s")
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        if let Some(num) = s.strip_suffix("ms") {
            let millis: u64 = num
                .trim()
                .parse()
                .map_err(|_| format!("invalid milliseconds: {}", num))?;
            return Ok(Duration::from_millis(millis));
        }
        if let Some(num) = s.strip_suffix('s') {
            let num = num.trim();
            if let Some((whole, frac)) = num.split_once('.') {
                let secs: u64 = whole
                    .parse()
                    .map_err(|_| format!("invalid seconds: {}", whole))?;
                if !frac.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("invalid fraction: {}", frac));
                }
                let millis_str = format!("{:0<3}", &frac[..3.min(frac.len())]);
                let millis: u32 = millis_str
                    .parse()
                    .map_err(|_| format!("invalid milliseconds: {}", millis_str))?;
                return Ok(Duration::new(secs, millis * 1_000_000));
            }
            let secs: u64 = num
                .parse()
                .map_err(|_| format!("invalid duration: {}", s))?;
            return Ok(Duration::from_secs(secs));
        }
        if let Some(num) = s.strip_suffix('m') {
            let mins: u64 = num
                .trim()
                .parse()
                .map_err(|_| format!("invalid minutes: {}", num))?;
            let secs = mins
                .checked_mul(60)
                .ok_or_else(|| format!("minutes out of range: {}", num))?;
            return Ok(Duration::from_secs(secs));
        }
        Err(format!("unknown duration format: {}", s))
    }
}
