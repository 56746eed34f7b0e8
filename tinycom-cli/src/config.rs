//! Configuration file support for tinycom.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (TINYCOM_*)
//! 3. Local config file (./tinycom.toml)
//! 4. Global config file (~/.config/tinycom/config.toml)

use anyhow::Context as _;
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tinycom::{DataBits, LineEnding, Parity, PortConfig, StopBits};

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "tinycom.toml";

/// Remembered serial port settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Data bits.
    pub data_bits: Option<DataBits>,
    /// Parity.
    pub parity: Option<Parity>,
    /// Stop bits.
    pub stop_bits: Option<StopBits>,
    /// XON/XOFF flow control.
    pub software_flow_control: Option<bool>,
    /// RTS/CTS flow control.
    pub hardware_flow_control: Option<bool>,
    /// DSR/DTR flow control.
    pub dsr_dtr_flow_control: Option<bool>,
}

/// Terminal display and input settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Line ending appended to sent lines.
    pub line_ending: Option<LineEnding>,
    /// Echo sent lines into the output.
    pub echo: Option<bool>,
    /// Show received data as hex.
    pub hex_display: Option<bool>,
    /// Remove ANSI escape sequences from received data.
    pub strip_escape_codes: Option<bool>,
    /// Append displayed text to this file.
    pub log_file: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Port settings.
    #[serde(default)]
    pub port: PortSettings,
    /// Terminal settings.
    #[serde(default)]
    pub terminal: TerminalSettings,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tinycom").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let port = &mut self.port;
        let theirs = other.port;
        port.name = theirs
            .name
            .or(port
                .name
                .take());
        port.baud = theirs
            .baud
            .or(port.baud);
        port.data_bits = theirs
            .data_bits
            .or(port.data_bits);
        port.parity = theirs
            .parity
            .or(port.parity);
        port.stop_bits = theirs
            .stop_bits
            .or(port.stop_bits);
        port.software_flow_control = theirs
            .software_flow_control
            .or(port.software_flow_control);
        port.hardware_flow_control = theirs
            .hardware_flow_control
            .or(port.hardware_flow_control);
        port.dsr_dtr_flow_control = theirs
            .dsr_dtr_flow_control
            .or(port.dsr_dtr_flow_control);

        let terminal = &mut self.terminal;
        let theirs = other.terminal;
        terminal.line_ending = theirs
            .line_ending
            .or(terminal.line_ending);
        terminal.echo = theirs
            .echo
            .or(terminal.echo);
        terminal.hex_display = theirs
            .hex_display
            .or(terminal.hex_display);
        terminal.strip_escape_codes = theirs
            .strip_escape_codes
            .or(terminal.strip_escape_codes);
        terminal.log_file = theirs
            .log_file
            .or(terminal
                .log_file
                .take());
    }

    /// Record `port` as the remembered port settings.
    pub fn remember_port(&mut self, port: &PortConfig) {
        self.port = PortSettings {
            name: Some(
                port.port_name
                    .clone(),
            ),
            baud: Some(port.baud_rate),
            data_bits: Some(port.data_bits),
            parity: Some(port.parity),
            stop_bits: Some(port.stop_bits),
            software_flow_control: Some(port.software_flow_control),
            hardware_flow_control: Some(port.hardware_flow_control),
            dsr_dtr_flow_control: Some(port.dsr_dtr_flow_control),
        };
    }

    /// Write this configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent
                .as_os_str()
                .is_empty()
            {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Remember `port` in the global config file, keeping its other settings.
    pub fn save_port_globally(port: &PortConfig) -> anyhow::Result<PathBuf> {
        let path = Self::global_config_path()
            .context("Could not determine the global configuration directory")?;
        let mut stored = Self::load_from_file(&path).unwrap_or_default();
        stored.remember_port(port);
        stored.save_to(&path)?;
        Ok(path)
    }
}
