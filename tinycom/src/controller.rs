//! Session lifecycle as seen from the interactive front end.
//!
//! [`SessionController`] runs on the UI context. The background reader never
//! calls into it directly: received chunks and read errors are posted to a
//! channel and handled in [`SessionController::pump`], so a fatal read error
//! can close the session (and join the reader) from the UI side.

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use log::{debug, warn};

use crate::codec::{self, DisplayDecoder, LineEnding};
use crate::error::{Error, Result};
use crate::port::PortConfig;
use crate::session::SerialSession;

/// Receives everything the controller wants the user to see.
pub trait DisplaySink {
    /// Append decoded text to the terminal log.
    fn show(&mut self, text: &str);

    /// Transient status line ("Opened ...", "Closed ...").
    fn status(&mut self, message: &str);

    /// Per-transfer byte count ("Wrote 4 bytes", "Read 6 bytes").
    fn traffic(&mut self, message: &str) {
        self.status(message);
    }

    /// One-shot error report.
    fn error(&mut self, title: &str, message: &str);
}

/// How received (and echoed) bytes are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayOptions {
    /// Remove ANSI/CSI escape sequences.
    pub strip_escape_codes: bool,
    /// Render as hex pairs instead of text.
    pub hex_display: bool,
    /// Show sent bytes in the log as if they had been received.
    pub echo: bool,
}

/// Running byte totals for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficCounters {
    /// Bytes received from the device.
    pub rx_bytes: u64,
    /// Bytes written to the device.
    pub tx_bytes: u64,
}

/// Lines sent successfully, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendHistory {
    entries: Vec<String>,
}

impl SendHistory {
    /// Append a sent line.
    pub fn push(&mut self, line: impl Into<String>) {
        self.entries
            .push(line.into());
    }

    /// Entry at `index` (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries
            .get(index)
            .map(String::as_str)
    }

    /// Iterate over entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries
            .len()
    }

    /// Whether nothing was sent yet.
    pub fn is_empty(&self) -> bool {
        self.entries
            .is_empty()
    }

    /// Forget all entries.
    pub fn clear(&mut self) {
        self.entries
            .clear();
    }
}

/// Append-only text log next to the display.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path
            .as_ref()
            .to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `text` as-is.
    pub fn append(&mut self, text: &str) -> io::Result<()> {
        self.file
            .write_all(text.as_bytes())?;
        self.file
            .flush()
    }
}

#[derive(Debug)]
enum SessionEvent {
    Data(Vec<u8>),
    ReadError(String),
}

/// Orchestrates one [`SerialSession`] for an interactive front end.
pub struct SessionController<S: DisplaySink> {
    session: SerialSession,
    sink: S,
    options: DisplayOptions,
    decoder: DisplayDecoder,
    counters: TrafficCounters,
    history: SendHistory,
    log: Option<LogFile>,
    events: Option<Receiver<SessionEvent>>,
}

impl<S: DisplaySink> SessionController<S> {
    /// Wrap a closed session.
    pub fn new(session: SerialSession, sink: S) -> Self {
        Self {
            session,
            sink,
            options: DisplayOptions::default(),
            decoder: DisplayDecoder::new(),
            counters: TrafficCounters::default(),
            history: SendHistory::default(),
            log: None,
            events: None,
        }
    }

    /// Open a port and start reading from it.
    ///
    /// Errors are reported to the sink and returned. Opening while a session
    /// is open is rejected and leaves that session untouched.
    pub fn open(&mut self, config: &PortConfig) -> Result<()> {
        if self
            .session
            .is_open()
        {
            let err = Error::Config("a port is already open; close it first".to_string());
            self.sink
                .error("Error Opening Serial Port", &err.to_string());
            return Err(err);
        }

        if let Err(err) = self
            .session
            .open(config)
        {
            let title = if err.is_open_failure() {
                "Error Opening Serial Port"
            } else {
                "IO Error Opening Serial Port"
            };
            self.sink
                .error(title, &err.to_string());
            return Err(err);
        }

        let (tx, rx) = mpsc::channel();
        let error_tx = tx.clone();
        let started = self
            .session
            .start_reader(
                move |data| {
                    tx.send(SessionEvent::Data(data.to_vec()))
                        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "display is gone"))
                },
                move |message| {
                    let _ = error_tx.send(SessionEvent::ReadError(message));
                },
            );
        if let Err(err) = started {
            self.session
                .close();
            self.sink
                .error("Error Opening Serial Port", &err.to_string());
            return Err(err);
        }

        self.events = Some(rx);
        self.decoder = DisplayDecoder::new();
        self.sink
            .status(&format!("Opened {}", config.summary()));
        Ok(())
    }

    /// Encode and send one line, returning the number of bytes written.
    ///
    /// On success the line is added to the history and, with echo enabled,
    /// shown as if received. Errors are reported to the sink and returned;
    /// an encoding error leaves the session untouched.
    pub fn send(&mut self, text: &str, policy: LineEnding) -> Result<usize> {
        let bytes = match codec::encode(text, policy) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.sink
                    .error("Input Error", &err.to_string());
                return Err(err);
            },
        };

        let written = match self
            .session
            .write(&bytes)
        {
            Ok(n) => n,
            Err(err) => {
                self.sink
                    .error("Serial write error", &err.to_string());
                return Err(err);
            },
        };

        self.counters
            .tx_bytes += written as u64;
        self.sink
            .traffic(&format!("Wrote {written} bytes"));
        if self
            .options
            .echo
        {
            let text = codec::decode_for_display(
                &bytes,
                self.options
                    .strip_escape_codes,
                self.options
                    .hex_display,
            );
            self.display_text(&text);
        }
        self.history
            .push(text);
        Ok(written)
    }

    /// Send history entry `index` again.
    pub fn resend(&mut self, index: usize, policy: LineEnding) -> Result<usize> {
        let Some(line) = self
            .history
            .get(index)
            .map(str::to_string)
        else {
            let err = Error::Config(format!("no history entry {index}"));
            self.sink
                .error("Input Error", &err.to_string());
            return Err(err);
        };
        self.send(&line, policy)
    }

    /// Close the session. Does nothing when already closed.
    pub fn close(&mut self) {
        if !self
            .session
            .is_open()
        {
            return;
        }
        let name = self
            .session
            .config()
            .map(|c| c.port_name)
            .unwrap_or_default();
        self.shutdown();
        self.sink
            .status(&format!("Closed {name}"));
    }

    /// Treat a reader error as fatal: close, then tell the user.
    pub fn on_read_error(&mut self, message: &str) {
        warn!("Read error, closing session: {message}");
        self.close();
        self.sink
            .error("Serial read error", message);
    }

    /// Handle reader events, waiting up to `timeout` for the first one.
    ///
    /// Returns the number of events handled.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let Some(rx) = self
            .events
            .take()
        else {
            return 0;
        };

        let mut batch = Vec::new();
        match rx.recv_timeout(timeout) {
            Ok(event) => batch.push(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {},
        }
        batch.extend(rx.try_iter());
        self.events = Some(rx);

        let handled = batch.len();
        for event in batch {
            match event {
                SessionEvent::Data(data) => self.on_data(&data),
                SessionEvent::ReadError(message) => self.on_read_error(&message),
            }
        }
        handled
    }

    fn on_data(&mut self, data: &[u8]) {
        self.counters
            .rx_bytes += data.len() as u64;
        self.sink
            .traffic(&format!("Read {} bytes", data.len()));
        self.display_bytes(data);
    }

    fn display_bytes(&mut self, data: &[u8]) {
        let text = self
            .decoder
            .decode(
                data,
                self.options
                    .strip_escape_codes,
                self.options
                    .hex_display,
            );
        self.display_text(&text);
    }

    /// Show already decoded text and append it to the log file.
    fn display_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.sink
            .show(text);

        if let Some(log) = self
            .log
            .as_mut()
        {
            if let Err(e) = log.append(text) {
                let message = format!("{}: {e}", log.path().display());
                self.log = None;
                self.sink
                    .error("Log file error", &message);
            }
        }
    }

    /// Close the session and flush whatever the reader delivered before it stopped.
    fn shutdown(&mut self) {
        self.session
            .close();
        if let Some(rx) = self
            .events
            .take()
        {
            for event in rx.try_iter() {
                match event {
                    SessionEvent::Data(data) => self.on_data(&data),
                    SessionEvent::ReadError(message) => {
                        debug!("Dropping read error after close: {message}");
                    },
                }
            }
        }
        let tail = self
            .decoder
            .flush(
                self.options
                    .strip_escape_codes,
                self.options
                    .hex_display,
            );
        if !tail.is_empty() {
            self.sink
                .show(&tail);
        }
    }

    /// Whether a session is open.
    pub fn is_open(&self) -> bool {
        self.session
            .is_open()
    }

    /// The underlying session.
    pub fn session(&self) -> &SerialSession {
        &self.session
    }

    /// Current display options.
    pub fn options(&self) -> DisplayOptions {
        self.options
    }

    /// Replace the display options; takes effect with the next chunk.
    pub fn set_options(&mut self, options: DisplayOptions) {
        self.options = options;
    }

    /// Start (or stop, with `None`) mirroring displayed text to a file.
    pub fn set_log_file(&mut self, log: Option<LogFile>) {
        self.log = log;
    }

    /// Byte totals so far.
    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    /// Lines sent so far.
    pub fn history(&self) -> &SendHistory {
        &self.history
    }

    /// Forget the send history.
    pub fn clear_history(&mut self) {
        self.history
            .clear();
    }

    /// The display sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutable access to the display sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: DisplaySink> Drop for SessionController<S> {
    fn drop(&mut self) {
        self.session
            .close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MemoryBackend, MemoryDevice, PortTimeouts};
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug, Default)]
    struct RecordingSink {
        shown: String,
        statuses: Vec<String>,
        errors: Vec<(String, String)>,
    }

    impl DisplaySink for RecordingSink {
        fn show(&mut self, text: &str) {
            self.shown
                .push_str(text);
        }

        fn status(&mut self, message: &str) {
            self.statuses
                .push(message.to_string());
        }

        fn error(&mut self, title: &str, message: &str) {
            self.errors
                .push((title.to_string(), message.to_string()));
        }
    }

    fn controller() -> (SessionController<RecordingSink>, MemoryDevice) {
        let backend = MemoryBackend::new();
        let device = backend.add_device("mem0");
        let timeouts = PortTimeouts {
            read: Duration::from_millis(20),
            ..PortTimeouts::default()
        };
        let session = SerialSession::new(Arc::new(backend)).with_timeouts(timeouts);
        (SessionController::new(session, RecordingSink::default()), device)
    }

    fn pump_until<F>(ctl: &mut SessionController<RecordingSink>, mut done: F)
    where
        F: FnMut(&SessionController<RecordingSink>) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(ctl) {
            assert!(Instant::now() < deadline, "timed out waiting for events");
            ctl.pump(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_ping_echo_round_trip() {
        let (mut ctl, device) = controller();
        device.set_echo(true);
        ctl.open(&PortConfig::new("mem0", 115200)).unwrap();

        let before = ctl.counters().rx_bytes;
        assert_eq!(ctl.send("PING", LineEnding::CrLf).unwrap(), 6);
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= before + 6);

        assert_eq!(ctl.counters().rx_bytes, before + 6);
        assert_eq!(ctl.counters().tx_bytes, 6);
        assert_eq!(device.take_written(), b"PING\r\n");
        assert!(ctl.sink().shown.contains("PING"));
        assert_eq!(ctl.history().get(0), Some("PING"));
    }

    #[test]
    fn test_open_failure_reported_and_state_unchanged() {
        let (mut ctl, device) = controller();
        device.set_refuse_open(true);
        assert!(ctl.open(&PortConfig::new("mem0", 9600)).is_err());
        assert!(!ctl.is_open());
        assert_eq!(ctl.sink().errors.len(), 1);
        assert_eq!(ctl.sink().errors[0].0, "Error Opening Serial Port");
    }

    #[test]
    fn test_open_while_open_rejected() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        assert!(ctl.open(&PortConfig::new("mem0", 57600)).is_err());
        assert!(ctl.is_open());
        assert_eq!(ctl.session().config().unwrap().baud_rate, 9600);
        assert_eq!(device.open_handles(), 2);
    }

    #[test]
    fn test_invalid_hex_leaves_session_untouched() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        let err = ctl.send("abc", LineEnding::Hex).unwrap_err();
        assert!(matches!(err, Error::InvalidHex(_)));
        assert!(ctl.is_open());
        assert!(device.take_written().is_empty());
        assert!(ctl.history().is_empty());
        assert_eq!(ctl.counters().tx_bytes, 0);
        assert_eq!(ctl.sink().errors[0].0, "Input Error");
    }

    #[test]
    fn test_hex_send() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        assert_eq!(ctl.send("de ad be ef", LineEnding::Hex).unwrap(), 4);
        assert_eq!(device.take_written(), [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_send_on_closed_session_reports_write_error() {
        let (mut ctl, _device) = controller();
        let err = ctl.send("AT", LineEnding::CrLf).unwrap_err();
        assert!(matches!(err, Error::Write(_)));
        assert_eq!(ctl.sink().errors[0].0, "Serial write error");
        assert!(ctl.history().is_empty());
    }

    #[test]
    fn test_echo_shows_sent_bytes_without_counting_rx() {
        let (mut ctl, _device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.set_options(DisplayOptions {
            echo: true,
            hex_display: true,
            ..DisplayOptions::default()
        });
        ctl.send("AB", LineEnding::None).unwrap();
        assert_eq!(ctl.sink().shown, "41 42 ");
        assert_eq!(ctl.counters().rx_bytes, 0);
    }

    #[test]
    fn test_echo_does_not_split_received_character() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.set_options(DisplayOptions {
            echo: true,
            ..DisplayOptions::default()
        });

        device.push_rx(&[0xC3]);
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= 1);
        ctl.send("A", LineEnding::None).unwrap();
        device.push_rx(&[0xA9]);
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= 2);

        assert_eq!(ctl.sink().shown, "Aé");
    }

    #[test]
    fn test_traffic_reported_as_status() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.send("AT", LineEnding::CrLf).unwrap();
        device.push_rx(b"OK\r\n");
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= 4);

        let statuses = &ctl.sink().statuses;
        assert!(statuses.iter().any(|s| s == "Wrote 4 bytes"));
        assert!(statuses.iter().any(|s| s.starts_with("Read ")));
    }

    #[test]
    fn test_strip_escape_codes_on_receive() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.set_options(DisplayOptions {
            strip_escape_codes: true,
            ..DisplayOptions::default()
        });
        device.push_rx(b"\x1b[32mOK\x1b[0m\r\n");
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= 13);
        assert_eq!(ctl.sink().shown, "OK\r\n");
    }

    #[test]
    fn test_read_error_closes_session_and_reports() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        device.fail_reads("device reports readiness to read but returned no data");
        pump_until(&mut ctl, |c| !c.is_open());

        assert_eq!(device.open_handles(), 0);
        let (title, message) = ctl.sink().errors.last().unwrap();
        assert_eq!(title, "Serial read error");
        assert!(message.contains("returned no data"));
        assert_eq!(ctl.pump(Duration::from_millis(1)), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.close();
        ctl.close();
        assert!(!ctl.is_open());
        assert_eq!(device.open_handles(), 0);
        let closes = ctl
            .sink()
            .statuses
            .iter()
            .filter(|s| s.starts_with("Closed"))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_reopen_after_close() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.close();
        ctl.open(&PortConfig::new("mem0", 19200)).unwrap();
        assert_eq!(device.last_config().unwrap().baud_rate, 19200);
        device.push_rx(b"hi");
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= 2);
        assert_eq!(ctl.sink().shown, "hi");
    }

    #[test]
    fn test_resend_history_entry() {
        let (mut ctl, device) = controller();
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        ctl.send("AT+GMR", LineEnding::CrLf).unwrap();
        ctl.send("ATI", LineEnding::CrLf).unwrap();
        device.take_written();

        ctl.resend(0, LineEnding::Lf).unwrap();
        assert_eq!(device.take_written(), b"AT+GMR\n");
        assert_eq!(ctl.history().len(), 3);
        assert!(ctl.resend(10, LineEnding::Lf).is_err());
    }

    #[test]
    fn test_log_file_receives_displayed_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.log");

        let (mut ctl, device) = controller();
        ctl.set_log_file(Some(LogFile::open(&path).unwrap()));
        ctl.open(&PortConfig::new("mem0", 9600)).unwrap();
        device.push_rx(b"line one\n");
        pump_until(&mut ctl, |c| c.counters().rx_bytes >= 9);
        ctl.close();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
