//! Background reader for an open port.
//!
//! The loop owns its own port handle and performs bounded reads until it is
//! stopped or a read fails. State transitions:
//!
//! ```text
//! Idle --start--> Running --stop--> Stopped
//!                    |
//!                    +--read/consumer error--> Errored
//! ```

use std::io::{self, Read as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::port::{Port, ReadCanceller};

/// Maximum number of bytes requested per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Lifecycle of a [`ReaderLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Not started yet.
    Idle,
    /// Reading.
    Running,
    /// Exited because it was asked to.
    Stopped,
    /// Exited because a read or the data consumer failed.
    Errored,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ReaderState>,
    stop_requested: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ReaderState) {
        if let Ok(mut current) = self
            .state
            .lock()
        {
            *current = state;
        }
    }

    fn state(&self) -> ReaderState {
        self.state
            .lock()
            .map_or(ReaderState::Stopped, |s| *s)
    }

    fn stopping(&self) -> bool {
        self.stop_requested
            .load(Ordering::SeqCst)
    }
}

/// Read once into `buf`, treating a timeout or an interrupted read as "no data".
pub(crate) fn read_chunk(port: &mut dyn Port, buf: &mut [u8]) -> Result<usize> {
    match port.read(buf) {
        Ok(n) => Ok(n),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        },
        Err(e) => Err(Error::PortIo(e.to_string())),
    }
}

/// Background execution unit that forwards received chunks to a consumer.
pub struct ReaderLoop {
    shared: Arc<Shared>,
    canceller: Option<ReadCanceller>,
    handle: Option<JoinHandle<()>>,
}

impl Default for ReaderLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderLoop {
    /// Create an idle reader.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ReaderState::Idle),
                stop_requested: AtomicBool::new(false),
            }),
            canceller: None,
            handle: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        self.shared
            .state()
    }

    /// Whether the loop is currently reading.
    pub fn is_running(&self) -> bool {
        self.state() == ReaderState::Running
    }

    /// Start reading from `port` on a new thread.
    ///
    /// `on_data` runs on the reader thread for every non-empty chunk. If it
    /// returns an error or panics, the loop stops exactly as on a read error
    /// and `on_error` receives the message. `on_error` is not called when
    /// the loop exits because [`ReaderLoop::stop`] was requested.
    pub fn start<D, E>(&mut self, port: Box<dyn Port>, on_data: D, on_error: E) -> Result<()>
    where
        D: FnMut(&[u8]) -> io::Result<()> + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        if self.state() != ReaderState::Idle {
            return Err(Error::ReadLoop(
                "reader can only be started once".to_string(),
            ));
        }

        self.canceller = port.read_canceller();
        self.shared
            .set_state(ReaderState::Running);
        let shared = Arc::clone(&self.shared);
        let name = port
            .name()
            .to_string();

        let spawned = std::thread::Builder::new()
            .name("tinycom-reader".to_string())
            .spawn(move || run(port, on_data, on_error, &shared));

        match spawned {
            Ok(handle) => {
                debug!("Reader started on {name}");
                self.handle = Some(handle);
                Ok(())
            },
            Err(e) => {
                self.shared
                    .set_state(ReaderState::Errored);
                Err(Error::ReadLoop(format!("failed to spawn reader thread: {e}")))
            },
        }
    }

    /// Stop the loop and wait for its thread to exit.
    ///
    /// An in-flight read is cancelled where the port supports it, otherwise
    /// it ends at the read timeout. Once this returns no further `on_data`
    /// call happens and the port handle owned by the loop has been dropped.
    pub fn stop(&mut self) {
        self.shared
            .stop_requested
            .store(true, Ordering::SeqCst);
        if let Some(cancel) = &self.canceller {
            cancel();
        }
        if let Some(handle) = self
            .handle
            .take()
        {
            if handle
                .join()
                .is_err()
            {
                warn!("Reader thread panicked");
                self.shared
                    .set_state(ReaderState::Errored);
            }
        }
        if matches!(self.state(), ReaderState::Idle | ReaderState::Running) {
            self.shared
                .set_state(ReaderState::Stopped);
        }
        self.canceller = None;
    }
}

impl Drop for ReaderLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "data consumer panicked".to_string()
    }
}

fn run<D, E>(mut port: Box<dyn Port>, mut on_data: D, on_error: E, shared: &Shared)
where
    D: FnMut(&[u8]) -> io::Result<()>,
    E: FnOnce(String),
{
    let mut buf = [0u8; READ_CHUNK_SIZE];

    let failure = loop {
        if shared.stopping() {
            break None;
        }
        match read_chunk(&mut *port, &mut buf) {
            Ok(0) => {},
            Ok(n) => {
                if shared.stopping() {
                    break None;
                }
                trace!("Read {n} bytes");
                match panic::catch_unwind(AssertUnwindSafe(|| on_data(&buf[..n]))) {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => break Some(format!("data consumer failed: {e}")),
                    Err(payload) => break Some(panic_message(payload.as_ref())),
                }
            },
            Err(e) => break Some(e.to_string()),
        }
    };

    // Release the handle before reporting, so the owner may close the device
    // from inside on_error's consumer.
    drop(port);

    match failure {
        Some(message) if !shared.stopping() => {
            warn!("Reader stopped: {message}");
            shared.set_state(ReaderState::Errored);
            on_error(message);
        },
        Some(message) => {
            debug!("Ignoring error after stop request: {message}");
            shared.set_state(ReaderState::Stopped);
        },
        None => {
            debug!("Reader stopped");
            shared.set_state(ReaderState::Stopped);
        },
    }
}
