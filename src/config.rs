//! Server configuration loaded with figment.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `DAQ_BUFFER_` (e.g. `DAQ_BUFFER_PORT=1973`)
//! 4. command-line overrides

use crate::data::store::StoreKind;
use crate::error::{AppResult, BufferError};
use crate::logging::{parse_log_level, LogFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "DAQ_BUFFER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// TCP port clients connect to
    pub port: u16,
    /// Interface to listen on
    pub bind_address: String,
    /// Samples kept in memory by the ring stores
    pub sample_capacity: u64,
    /// Events kept in memory by the ring stores
    pub event_capacity: usize,
    /// Directory for segment files; enables the saving store
    pub save_path: Option<PathBuf>,
    /// Keep everything in memory, never evicting
    pub unbounded: bool,
    pub log_level: String,
    /// pretty, compact or json
    pub log_format: String,
    /// 0 to 2; higher values log more client activity
    pub monitor_verbosity: u8,
    /// Largest accepted request payload
    pub max_message_bytes: usize,
    /// How long shutdown waits for connection handlers to exit
    pub shutdown_timeout_ms: u64,
}

fn default_port() -> u16 {
    1972
}

fn default_sample_capacity() -> u64 {
    61_440
}

fn default_event_capacity() -> usize {
    3_600
}

fn default_max_message_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_shutdown_timeout() -> u64 {
    2_000
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: "0.0.0.0".to_string(),
            sample_capacity: default_sample_capacity(),
            event_capacity: default_event_capacity(),
            save_path: None,
            unbounded: false,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            monitor_verbosity: 0,
            max_message_bytes: default_max_message_bytes(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Values given on the command line. `None` leaves lower layers untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_capacity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbounded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_verbosity: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl BufferConfig {
    /// Builds the layered figment without extracting it.
    pub fn figment(file: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(BufferConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
    }

    /// Loads and validates the configuration.
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> AppResult<Self> {
        if let Some(path) = file {
            if !path.exists() {
                return Err(BufferError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
        }
        let config: Self = Self::figment(file, overrides).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.log_level)?;
        self.log_format.parse::<LogFormat>()?;

        if !self.unbounded && (self.sample_capacity == 0 || self.event_capacity == 0) {
            return Err(BufferError::Config(format!(
                "capacities must be positive (samples={}, events={})",
                self.sample_capacity, self.event_capacity
            )));
        }
        if self.unbounded && self.save_path.is_some() {
            return Err(BufferError::Config(
                "unbounded buffer cannot be combined with save_path".into(),
            ));
        }
        if self.monitor_verbosity > 2 {
            return Err(BufferError::Config(format!(
                "invalid monitor_verbosity {}. Must be 0-2",
                self.monitor_verbosity
            )));
        }
        if self.max_message_bytes == 0 {
            return Err(BufferError::Config("max_message_bytes must be positive".into()));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> AppResult<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| {
                BufferError::Config(format!("invalid bind address '{}': {e}", self.bind_address))
            })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn store_kind(&self) -> StoreKind {
        if self.unbounded {
            return StoreKind::Simple;
        }
        match &self.save_path {
            Some(path) => StoreKind::Saving {
                samples: self.sample_capacity,
                events: self.event_capacity,
                path: path.clone(),
            },
            None => StoreKind::Ring {
                samples: self.sample_capacity,
                events: self.event_capacity,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = BufferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 1972);
        assert_eq!(
            config.store_kind(),
            StoreKind::Ring {
                samples: 61_440,
                events: 3_600
            }
        );
    }

    #[test]
    fn test_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "buffer.toml",
                r#"
                    port = 2000
                    sample_capacity = 100
                    log_level = "debug"
                "#,
            )?;
            jail.set_env("DAQ_BUFFER_PORT", "3000");
            jail.set_env("DAQ_BUFFER_EVENT_CAPACITY", "7");

            let overrides = ConfigOverrides {
                sample_capacity: Some(50),
                ..Default::default()
            };
            let config = BufferConfig::load(Some(Path::new("buffer.toml")), &overrides)
                .map_err(|e| e.to_string())?;

            assert_eq!(config.port, 3000);
            assert_eq!(config.sample_capacity, 50);
            assert_eq!(config.event_capacity, 7);
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.bind_address, "0.0.0.0");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = BufferConfig::load(
            Some(Path::new("/nonexistent/buffer.toml")),
            &ConfigOverrides::default(),
        );
        assert!(matches!(result, Err(BufferError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_level = BufferConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert!(bad_level.validate().is_err());

        let zero = BufferConfig {
            sample_capacity: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let conflicting = BufferConfig {
            unbounded: true,
            save_path: Some(PathBuf::from("/tmp/buffer")),
            ..Default::default()
        };
        assert!(conflicting.validate().is_err());

        let bad_addr = BufferConfig {
            bind_address: "not an address".into(),
            ..Default::default()
        };
        assert!(bad_addr.validate().is_err());
    }

    #[test]
    fn test_store_kind_selection() {
        let saving = BufferConfig {
            save_path: Some(PathBuf::from("/data/run1")),
            ..Default::default()
        };
        assert!(matches!(saving.store_kind(), StoreKind::Saving { .. }));

        let unbounded = BufferConfig {
            unbounded: true,
            sample_capacity: 0,
            ..Default::default()
        };
        assert!(unbounded.validate().is_ok());
        assert_eq!(unbounded.store_kind(), StoreKind::Simple);
    }
}
