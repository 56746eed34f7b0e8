//! # tinycom
//!
//! Core of a small line-based serial terminal.
//!
//! This crate provides everything below the user interface:
//!
//! - Line encoding with configurable endings, including raw hex input
//! - Display decoding with optional ANSI escape stripping and hex rendering
//! - A serial session with a cancellable background reader
//! - A controller that ties a session to a display
//!
//! ## Features
//!
//! - `native` (default): Native serial ports (Linux, macOS, Windows) via the `serialport` crate
//! - `serde`: Serialization support for configuration types
//!
//! Without `native` only the in-memory backend is available, which is also
//! what the tests use.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use tinycom::{DisplaySink, LineEnding, PortConfig, SerialSession, SessionController};
//!
//! struct Stdout;
//!
//! impl DisplaySink for Stdout {
//!     fn show(&mut self, text: &str) {
//!         print!("{text}");
//!     }
//!
//!     fn status(&mut self, message: &str) {
//!         eprintln!("{message}");
//!     }
//!
//!     fn error(&mut self, title: &str, message: &str) {
//!         eprintln!("{title}: {message}");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut controller = SessionController::new(SerialSession::native(), Stdout);
//!         controller.open(&PortConfig::new("/dev/ttyUSB0", 115200))?;
//!         controller.send("AT", LineEnding::CrLf)?;
//!         controller.pump(Duration::from_millis(500));
//!         controller.close();
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod controller;
pub mod error;
pub mod port;
pub mod reader;
pub mod session;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeBackend, NativePort, list_available_ports};
pub use {
    codec::{
        DisplayDecoder, LineEnding, decode_for_display, drain_utf8_lossy, encode,
        strip_escape_codes, to_hex_display,
    },
    controller::{
        DisplayOptions, DisplaySink, LogFile, SendHistory, SessionController, TrafficCounters,
    },
    error::{Error, Result},
    port::{
        COMMON_BAUD_RATES, DEFAULT_BAUD_RATE, DataBits, MemoryBackend, MemoryDevice, MemoryPort,
        Parity, Port, PortBackend, PortConfig, PortTimeouts, StopBits, list_available_ports_with,
    },
    reader::{ReaderLoop, ReaderState},
    session::SerialSession,
};
