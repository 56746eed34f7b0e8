//! A single serial connection and its background reader.
//!
//! Writes, reads and close share one exclusive lock. Closing stops the
//! reader (cancel, then join) before the handle is dropped, so the reader
//! never observes a half-closed port.

use std::fmt;
use std::io::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::debug;

use crate::error::{Error, Result};
use crate::port::{Port, PortBackend, PortConfig, PortTimeouts, list_available_ports_with};
use crate::reader::{ReaderLoop, ReaderState, read_chunk};

#[derive(Default)]
struct Inner {
    config: Option<PortConfig>,
    port: Option<Box<dyn Port>>,
    reader: Option<ReaderLoop>,
}

/// One serial connection.
pub struct SerialSession {
    backend: Arc<dyn PortBackend>,
    timeouts: PortTimeouts,
    inner: Mutex<Inner>,
}

impl fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSession")
            .field("timeouts", &self.timeouts)
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}

impl SerialSession {
    /// Create a closed session that opens ports through `backend`.
    pub fn new(backend: Arc<dyn PortBackend>) -> Self {
        Self {
            backend,
            timeouts: PortTimeouts::default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a closed session on the native backend.
    #[cfg(feature = "native")]
    pub fn native() -> Self {
        Self::new(Arc::new(crate::port::NativeBackend))
    }

    /// Override the driver-level timeouts used by later opens.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: PortTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data stays consistent across a panic: every mutation
        // is a single Option assignment.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Open the configured port, replacing any previous configuration.
    ///
    /// A session that is already open is closed first. Input and output
    /// buffers are cleared after opening.
    pub fn open(&self, config: &PortConfig) -> Result<()> {
        let mut inner = self.lock();
        close_locked(&mut inner);

        let mut port = self
            .backend
            .open(config, &self.timeouts)?;
        port.clear_buffers()
            .map_err(|e| Error::PortIo(e.to_string()))?;

        debug!("Opened {}", config.summary());
        inner.config = Some(config.clone());
        inner.port = Some(port);
        Ok(())
    }

    /// Whether a handle is currently open.
    pub fn is_open(&self) -> bool {
        self.lock()
            .port
            .is_some()
    }

    /// Configuration of the open session, if any.
    pub fn config(&self) -> Option<PortConfig> {
        let inner = self.lock();
        inner
            .port
            .as_ref()
            .and(
                inner
                    .config
                    .clone(),
            )
    }

    /// Status-bar summary of the open session, e.g. `COM3 9600,E,7,1.5`.
    pub fn describe(&self) -> Option<String> {
        self.config()
            .map(|config| config.summary())
    }

    /// State of the background reader, if one was started on this handle.
    pub fn reader_state(&self) -> Option<ReaderState> {
        self.lock()
            .reader
            .as_ref()
            .map(ReaderLoop::state)
    }

    /// Start the background reader on a cloned handle.
    ///
    /// See [`ReaderLoop::start`] for the callback contract.
    pub fn start_reader<D, E>(&self, on_data: D, on_error: E) -> Result<()>
    where
        D: FnMut(&[u8]) -> io::Result<()> + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        let mut inner = self.lock();
        let Some(port) = inner
            .port
            .as_ref()
        else {
            return Err(Error::PortIo("port is not open".to_string()));
        };
        let reader_port = port.try_clone_port()?;

        if let Some(mut previous) = inner
            .reader
            .take()
        {
            previous.stop();
        }
        let mut reader = ReaderLoop::new();
        reader.start(reader_port, on_data, on_error)?;
        inner.reader = Some(reader);
        Ok(())
    }

    /// Write all of `data`, returning the number of bytes written.
    ///
    /// Fails with [`Error::Write`] on a closed session, a removed device, or
    /// when the write timeout passes before everything is accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        let port = inner
            .port
            .as_mut()
            .ok_or_else(|| Error::Write("port is not open".to_string()))?;

        let deadline = Instant::now() + self.timeouts.write;
        let mut written = 0;
        while written < data.len() {
            match port.write(&data[written..]) {
                Ok(0) => {
                    return Err(Error::Write("device accepted no data".to_string()));
                },
                Ok(n) => written += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return Err(Error::Write(format!(
                            "write timeout after {written} of {} bytes",
                            data.len()
                        )));
                    }
                },
                Err(e) => return Err(Error::Write(e.to_string())),
            }
        }
        port.flush()
            .map_err(|e| Error::Write(e.to_string()))?;
        debug!("Wrote {written} bytes");
        Ok(written)
    }

    /// Read at most `max_bytes` from the session handle.
    ///
    /// Returns an empty buffer when the read timeout passes without data.
    /// Meant for sessions without a running reader, which would otherwise
    /// compete for the same bytes.
    pub fn read(&self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        let port = inner
            .port
            .as_mut()
            .ok_or_else(|| Error::PortIo("port is not open".to_string()))?;
        let mut buf = vec![0u8; max_bytes];
        let n = read_chunk(&mut **port, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Stop the reader, then close the handle. Does nothing when already closed.
    pub fn close(&self) {
        let mut inner = self.lock();
        close_locked(&mut inner);
    }

    /// List ports of this session's backend that can be opened.
    pub fn list_available_ports(&self) -> Result<Vec<String>> {
        list_available_ports_with(self.backend.as_ref())
    }
}

fn close_locked(inner: &mut Inner) {
    if let Some(mut reader) = inner
        .reader
        .take()
    {
        reader.stop();
    }
    if let Some(mut port) = inner
        .port
        .take()
    {
        let _ = port.flush();
        debug!("Closed {}", port.name());
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.close();
    }
}
