//! Port abstraction for serial communication.
//!
//! A [`PortBackend`] opens [`Port`] handles from a [`PortConfig`] and lists
//! candidate port names. Two backends exist:
//!
//! - **Native** (`native` feature): the `serialport` crate
//! - **Memory**: in-process devices used by tests and demos
//!
//! ```text
//! +------------------+
//! |  SerialSession   |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   PortBackend    |  open() / candidates()
//! +--------+---------+
//!          |
//!    +-----+------+
//!    v            v
//! Native       Memory
//! ```

pub mod memory;
#[cfg(feature = "native")]
pub mod native;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};

/// Default baud rate offered when nothing else is configured.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Standard baud rates; others are accepted with a warning.
pub const COMMON_BAUD_RATES: &[u32] = &[
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Serial port configuration.
///
/// Applied as a whole when a session opens; later changes only take effect on
/// the next open.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PortConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity checking mode.
    pub parity: Parity,
    /// Number of stop bits.
    pub stop_bits: StopBits,
    /// XON/XOFF software flow control.
    pub software_flow_control: bool,
    /// RTS/CTS hardware flow control.
    pub hardware_flow_control: bool,
    /// DSR/DTR hardware flow control.
    pub dsr_dtr_flow_control: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            software_flow_control: false,
            hardware_flow_control: false,
            dsr_dtr_flow_control: false,
        }
    }
}

impl PortConfig {
    /// Create a new configuration with port name and baud rate (8N1, no flow control).
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Short "port baud,parity,bits,stop" summary, e.g. `COM3 115200,N,8,1`.
    pub fn summary(&self) -> String {
        format!(
            "{} {},{},{},{}",
            self.port_name,
            self.baud_rate,
            self.parity
                .short(),
            self.data_bits,
            self.stop_bits
        )
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataBits {
    /// 5 data bits.
    #[cfg_attr(feature = "serde", serde(rename = "5"))]
    Five,
    /// 6 data bits.
    #[cfg_attr(feature = "serde", serde(rename = "6"))]
    Six,
    /// 7 data bits.
    #[cfg_attr(feature = "serde", serde(rename = "7"))]
    Seven,
    /// 8 data bits.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "8"))]
    Eight,
}

impl DataBits {
    /// Number of bits.
    pub fn bits(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

impl FromStr for DataBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "5" => Ok(Self::Five),
            "6" => Ok(Self::Six),
            "7" => Ok(Self::Seven),
            "8" => Ok(Self::Eight),
            other => Err(Error::Config(format!(
                "invalid data bits '{other}' (expected 5, 6, 7 or 8)"
            ))),
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
    /// Parity bit always 1.
    Mark,
    /// Parity bit always 0.
    Space,
}

impl Parity {
    /// Single-letter form used in `115200,N,8,1` summaries.
    pub fn short(self) -> char {
        match self {
            Self::None => 'N',
            Self::Even => 'E',
            Self::Odd => 'O',
            Self::Mark => 'M',
            Self::Space => 'S',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Even => "even",
            Self::Odd => "odd",
            Self::Mark => "mark",
            Self::Space => "space",
        };
        f.write_str(name)
    }
}

impl FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "none" | "n" => Ok(Self::None),
            "even" | "e" => Ok(Self::Even),
            "odd" | "o" => Ok(Self::Odd),
            "mark" | "m" => Ok(Self::Mark),
            "space" | "s" => Ok(Self::Space),
            _ => Err(Error::Config(format!(
                "invalid parity '{s}' (expected none, even, odd, mark or space)"
            ))),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "1"))]
    One,
    /// 1.5 stop bits.
    #[cfg_attr(feature = "serde", serde(rename = "1.5"))]
    OnePointFive,
    /// 2 stop bits.
    #[cfg_attr(feature = "serde", serde(rename = "2"))]
    Two,
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        };
        f.write_str(name)
    }
}

impl FromStr for StopBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1" => Ok(Self::One),
            "1.5" => Ok(Self::OnePointFive),
            "2" => Ok(Self::Two),
            other => Err(Error::Config(format!(
                "invalid stop bits '{other}' (expected 1, 1.5 or 2)"
            ))),
        }
    }
}

/// Driver-level timeouts applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTimeouts {
    /// Upper bound for a single read; a read that sees no data returns empty.
    pub read: Duration,
    /// Upper bound for writing one buffer.
    pub write: Duration,
    /// Maximum gap between bytes of one read, where the backend supports it.
    pub inter_byte: Duration,
}

impl Default for PortTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(100),
            write: Duration::from_secs(5),
            inter_byte: Duration::from_secs(1),
        }
    }
}

/// Interrupts a read blocked on a specific port handle.
pub type ReadCanceller = Arc<dyn Fn() + Send + Sync>;

/// An open serial port handle.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Open a second handle to the same device, used by the background reader.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;

    /// Primitive that unblocks an in-flight read on this handle.
    ///
    /// `None` means the backend has no such primitive and reads only return
    /// when their timeout expires.
    fn read_canceller(&self) -> Option<ReadCanceller> {
        None
    }
}

/// Opens ports and lists the names worth probing.
pub trait PortBackend: Send + Sync {
    /// Open `config.port_name` with `config` applied.
    fn open(&self, config: &PortConfig, timeouts: &PortTimeouts) -> Result<Box<dyn Port>>;

    /// Port names that may exist on this system, in display order.
    fn candidates(&self) -> Result<Vec<String>>;
}

/// List ports that can actually be opened and closed again.
pub fn list_available_ports_with(backend: &dyn PortBackend) -> Result<Vec<String>> {
    let timeouts = PortTimeouts::default();
    let mut result = Vec::new();
    for name in backend.candidates()? {
        let probe = PortConfig::new(name.as_str(), DEFAULT_BAUD_RATE);
        match backend.open(&probe, &timeouts) {
            Ok(port) => {
                drop(port);
                trace!("Port {name} is available");
                result.push(name);
            },
            Err(e) => trace!("Skipping {name}: {e}"),
        }
    }
    debug!("Found {} available port(s)", result.len());
    Ok(result)
}

/// List ports on this system that can be opened.
#[cfg(feature = "native")]
pub fn list_available_ports() -> Result<Vec<String>> {
    list_available_ports_with(&native::NativeBackend)
}

// Re-export the appropriate implementation based on features
pub use memory::{MemoryBackend, MemoryDevice, MemoryPort};
#[cfg(feature = "native")]
pub use native::{NativeBackend, NativePort};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_config_default() {
        let config = PortConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert!(!config.software_flow_control);
        assert!(!config.hardware_flow_control);
        assert!(!config.dsr_dtr_flow_control);
    }

    #[test]
    fn test_port_config_summary() {
        let mut config = PortConfig::new("COM3", 9600);
        config.parity = Parity::Even;
        config.data_bits = DataBits::Seven;
        config.stop_bits = StopBits::OnePointFive;
        assert_eq!(config.summary(), "COM3 9600,E,7,1.5");
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!("7".parse::<DataBits>().unwrap(), DataBits::Seven);
        assert!("9".parse::<DataBits>().is_err());
        assert_eq!("Mark".parse::<Parity>().unwrap(), Parity::Mark);
        assert_eq!("s".parse::<Parity>().unwrap(), Parity::Space);
        assert!("parity".parse::<Parity>().is_err());
        assert_eq!("1.5".parse::<StopBits>().unwrap(), StopBits::OnePointFive);
        assert!("3".parse::<StopBits>().is_err());
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = PortTimeouts::default();
        assert_eq!(timeouts.read, Duration::from_millis(100));
        assert_eq!(timeouts.write, Duration::from_secs(5));
        assert_eq!(timeouts.inter_byte, Duration::from_secs(1));
    }

    #[test]
    fn test_list_available_ports_filters_unopenable() {
        let backend = MemoryBackend::new();
        backend.add_device("/dev/ttyA");
        backend
            .add_device("/dev/ttyB")
            .set_refuse_open(true);
        backend.add_device("/dev/ttyC");

        let ports = list_available_ports_with(&backend).unwrap();
        assert_eq!(ports, vec!["/dev/ttyA", "/dev/ttyC"]);

        for name in &ports {
            let config = PortConfig::new(name.as_str(), 9600);
            assert!(backend.open(&config, &PortTimeouts::default()).is_ok());
        }
    }

    #[test]
    fn test_list_available_ports_releases_probe_handles() {
        let backend = MemoryBackend::new();
        let device = backend.add_device("loop0");
        let _ = list_available_ports_with(&backend).unwrap();
        assert_eq!(device.open_handles(), 0);
    }
}
