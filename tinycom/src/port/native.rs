//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows).

use {
    crate::{
        error::{Error, Result},
        port::{DataBits, Parity, Port, PortBackend, PortConfig, PortTimeouts, StopBits},
    },
    log::{trace, warn},
    serialport::ClearBuffer,
    std::io::{Read, Write},
};

/// Native serial port handle.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    ///
    /// Settings the driver cannot express (mark/space parity, 1.5 stop bits,
    /// DSR/DTR flow control) fail the open instead of being silently dropped.
    pub fn open(config: &PortConfig, timeouts: &PortTimeouts) -> Result<Self> {
        let name = &config.port_name;
        let parity = native_parity(config.parity).ok_or_else(|| {
            Error::port_open(
                name.as_str(),
                format!("{} parity is not supported by this driver", config.parity),
            )
        })?;
        let stop_bits = native_stop_bits(config.stop_bits).ok_or_else(|| {
            Error::port_open(
                name.as_str(),
                format!("{} stop bits are not supported by this driver", config.stop_bits),
            )
        })?;
        if config.dsr_dtr_flow_control {
            return Err(Error::port_open(
                name.as_str(),
                "DSR/DTR flow control is not supported by this driver",
            ));
        }
        let flow_control = match (config.hardware_flow_control, config.software_flow_control) {
            (true, true) => {
                warn!("Both RTS/CTS and XON/XOFF requested; using RTS/CTS only");
                serialport::FlowControl::Hardware
            },
            (true, false) => serialport::FlowControl::Hardware,
            (false, true) => serialport::FlowControl::Software,
            (false, false) => serialport::FlowControl::None,
        };
        trace!(
            "Inter-byte timeout {:?} is not configurable on native ports",
            timeouts.inter_byte
        );

        let port = serialport::new(name.as_str(), config.baud_rate)
            .timeout(timeouts.read)
            .data_bits(
                config
                    .data_bits
                    .into(),
            )
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .open()
            .map_err(|e| classify_open_error(name, e))?;

        trace!("serialport handle ready for {}", config.summary());
        Ok(Self {
            port,
            name: name.clone(),
        })
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::All)?;
        Ok(())
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        let port = self
            .port
            .try_clone()?;
        Ok(Box::new(Self {
            port,
            name: self
                .name
                .clone(),
        }))
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .flush()
    }
}

/// Backend for the ports of this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl PortBackend for NativeBackend {
    fn open(&self, config: &PortConfig, timeouts: &PortTimeouts) -> Result<Box<dyn Port>> {
        Ok(Box::new(NativePort::open(config, timeouts)?))
    }

    fn candidates(&self) -> Result<Vec<String>> {
        platform_candidates()
    }
}

#[cfg(windows)]
fn platform_candidates() -> Result<Vec<String>> {
    Ok((1..=256)
        .map(|i| format!("COM{i}"))
        .collect())
}

#[cfg(target_os = "linux")]
const CANDIDATE_PATTERN: &str = "/dev/tty[A-Za-z]*";

#[cfg(target_os = "macos")]
const CANDIDATE_PATTERN: &str = "/dev/tty.*";

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn platform_candidates() -> Result<Vec<String>> {
    glob_candidates(CANDIDATE_PATTERN)
}

#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
fn platform_candidates() -> Result<Vec<String>> {
    Err(Error::UnsupportedPlatform(
        std::env::consts::OS.to_string(),
    ))
}

/// Paths matching `pattern`, sorted. Unreadable entries are skipped.
#[cfg(any(target_os = "linux", target_os = "macos", test))]
fn glob_candidates(pattern: &str) -> Result<Vec<String>> {
    let paths = glob::glob(pattern).map_err(|e| Error::Config(format!("{pattern}: {e}")))?;
    let mut names: Vec<String> = paths
        .filter_map(std::result::Result::ok)
        .filter_map(|path| {
            path.into_os_string()
                .into_string()
                .ok()
        })
        .collect();
    names.sort();
    Ok(names)
}

/// Split driver open failures into "cannot open" and transient I/O.
fn classify_open_error(name: &str, err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::InvalidInput
        | serialport::ErrorKind::Unknown
        | serialport::ErrorKind::Io(
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied,
        ) => Error::port_open(name, err),
        serialport::ErrorKind::Io(kind) => {
            trace!("Transient {kind:?} while opening {name}");
            Error::PortIo(format!("{name}: {err}"))
        },
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => Self::Five,
            DataBits::Six => Self::Six,
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

fn native_parity(parity: Parity) -> Option<serialport::Parity> {
    match parity {
        Parity::None => Some(serialport::Parity::None),
        Parity::Odd => Some(serialport::Parity::Odd),
        Parity::Even => Some(serialport::Parity::Even),
        Parity::Mark | Parity::Space => None,
    }
}

fn native_stop_bits(bits: StopBits) -> Option<serialport::StopBits> {
    match bits {
        StopBits::One => Some(serialport::StopBits::One),
        StopBits::Two => Some(serialport::StopBits::Two),
        StopBits::OnePointFive => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_do_not_panic() {
        // Enumeration depends on the host; only check it is well-formed.
        if let Ok(names) = NativeBackend.candidates() {
            assert!(names.iter().all(|n| !n.is_empty()));
        }
    }

    #[test]
    fn test_glob_candidates_match_tty_pattern() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB0", "ttyS1", "ttyACM0", "tty0", "tty", "pts", "tty.usbserial"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let root = dir.path().display().to_string();

        let names = glob_candidates(&format!("{root}/tty[A-Za-z]*")).unwrap();
        let expected: Vec<String> = ["ttyACM0", "ttyS1", "ttyUSB0"]
            .iter()
            .map(|n| format!("{root}/{n}"))
            .collect();
        assert_eq!(names, expected);

        let names = glob_candidates(&format!("{root}/tty.*")).unwrap();
        assert_eq!(names, vec![format!("{root}/tty.usbserial")]);
    }

    #[test]
    fn test_open_error_classification() {
        let missing = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(classify_open_error("COM9", missing).is_open_failure());

        let denied = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "denied",
        );
        assert!(classify_open_error("/dev/ttyS0", denied).is_open_failure());

        let not_found = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound),
            "no such file",
        );
        assert!(classify_open_error("/dev/ttyS0", not_found).is_open_failure());

        let busy = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut),
            "timed out",
        );
        let err = classify_open_error("/dev/ttyS0", busy);
        assert!(!err.is_open_failure());
        assert!(matches!(err, Error::PortIo(ref msg) if msg.contains("/dev/ttyS0")));
    }

    #[test]
    fn test_unsupported_settings_rejected_before_open() {
        let timeouts = PortTimeouts::default();

        let mut config = PortConfig::new("/dev/does-not-exist", 9600);
        config.parity = Parity::Mark;
        let err = NativePort::open(&config, &timeouts).err().unwrap();
        assert!(err.to_string().contains("mark parity"));

        let mut config = PortConfig::new("/dev/does-not-exist", 9600);
        config.stop_bits = StopBits::OnePointFive;
        let err = NativePort::open(&config, &timeouts).err().unwrap();
        assert!(err.is_open_failure());

        let mut config = PortConfig::new("/dev/does-not-exist", 9600);
        config.dsr_dtr_flow_control = true;
        let err = NativePort::open(&config, &timeouts).err().unwrap();
        assert!(err.to_string().contains("DSR/DTR"));
    }

    #[test]
    fn test_missing_device_is_open_failure() {
        let config = PortConfig::new("/dev/tinycom-missing-port", 9600);
        let err = NativePort::open(&config, &PortTimeouts::default()).err().unwrap();
        assert!(err.is_open_failure());
    }
}
