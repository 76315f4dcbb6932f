//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MODEMD_DEVICE`, `RUST_LOG` (log level)
//! 2. **Config file** — path via `--config <path>`, or `modemd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB2"
//! baud = 115200
//! data_bits = 8
//! parity = "none"          # none | even | odd
//! stop_bits = 1
//! send_delay_us = 0        # >0: one byte per tick, for slow devices
//! rts_cts = false
//! flash_allowed = true
//!
//! [registration]
//! poll_interval_secs = 30
//! command_timeout_secs = 5
//! unsolicited = ["+CREG:", "RING"]
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::serial::{LineSettings, Parity, PortConfig, PortTarget};
use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port and line-discipline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path (default `/dev/ttyUSB2`). Override with `MODEMD_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// `none`, `even`, or `odd` (default `none`).
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Inter-byte send delay in microseconds (default 0 = whole-command
    /// writes). Some devices drop bytes sent back-to-back.
    #[serde(default)]
    pub send_delay_us: u64,
    /// Hardware RTS/CTS flow control (default false).
    #[serde(default)]
    pub rts_cts: bool,
    /// Whether the zero-baud flash sequence may touch this device
    /// (default true).
    #[serde(default = "default_flash_allowed")]
    pub flash_allowed: bool,
}

/// Registration polling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// Seconds between registration checks (default 30).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Per-command timeout in seconds for the check (default 5).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Unsolicited-message prefixes to demultiplex and log.
    #[serde(default)]
    pub unsolicited: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_device() -> String {
    "/dev/ttyUSB2".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_stop_bits() -> u8 {
    1
}
fn default_flash_allowed() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    30
}
fn default_command_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            send_delay_us: 0,
            rts_cts: false,
            flash_allowed: default_flash_allowed(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            command_timeout_secs: default_command_timeout(),
            unsolicited: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SerialConfig {
    fn parity(&self) -> Parity {
        match self.parity.as_str() {
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            _ => Parity::None,
        }
    }

    /// Build the port configuration this serial section describes.
    pub fn port_config(&self) -> PortConfig {
        let device = expand_tilde(&self.device).into_owned();
        let name = Path::new(&device)
            .file_name()
            .map_or_else(|| device.clone(), |n| n.to_string_lossy().into_owned());
        PortConfig {
            name,
            target: PortTarget::Device(device.into()),
            line: LineSettings {
                baud: self.baud,
                data_bits: self.data_bits,
                parity: self.parity(),
                stop_bits: self.stop_bits,
                rts_cts: self.rts_cts,
            },
            send_delay: Duration::from_micros(self.send_delay_us),
            flash_allowed: self.flash_allowed,
        }
    }
}

impl RegistrationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `modemd.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("modemd.toml").exists() {
            let content =
                std::fs::read_to_string("modemd.toml").expect("Failed to read modemd.toml");
            toml::from_str(&content).expect("Failed to parse modemd.toml")
        } else {
            Config {
                serial: SerialConfig::default(),
                registration: RegistrationConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(device) = std::env::var("MODEMD_DEVICE") {
            config.serial.device = device;
        }

        config
    }
}
