//! In-memory serial devices.
//!
//! A [`MemoryDevice`] models the far end of a cable: bytes pushed with
//! [`MemoryDevice::push_rx`] are read by the host, bytes the host writes are
//! collected and can be echoed back. Failures (refused open, read/write
//! errors, unplug) can be injected to exercise error paths without hardware.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::port::{Port, PortBackend, PortConfig, PortTimeouts, ReadCanceller};

#[derive(Debug, Default)]
struct DeviceState {
    to_host: VecDeque<u8>,
    written: Vec<u8>,
    echo: bool,
    refuse_open: bool,
    read_error: Option<String>,
    write_error: Option<String>,
    write_delay: Duration,
    open_handles: usize,
    last_config: Option<PortConfig>,
    clears: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

/// Test-side handle to an in-memory device.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    shared: Arc<Shared>,
}

impl MemoryDevice {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not wedge the device for the others.
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue bytes for the host to read.
    pub fn push_rx(&self, data: &[u8]) {
        self.lock()
            .to_host
            .extend(data);
        self.shared
            .readable
            .notify_all();
    }

    /// Everything the host has written so far, draining it.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().written)
    }

    /// Echo every write back to the host, like a loopback plug.
    pub fn set_echo(&self, echo: bool) {
        self.lock()
            .echo = echo;
    }

    /// Make subsequent opens fail as if the device were busy.
    pub fn set_refuse_open(&self, refuse: bool) {
        self.lock()
            .refuse_open = refuse;
    }

    /// Make reads fail with `message` until cleared.
    pub fn fail_reads(&self, message: impl Into<String>) {
        self.lock()
            .read_error = Some(message.into());
        self.shared
            .readable
            .notify_all();
    }

    /// Make every further write fail with `message`.
    pub fn fail_writes(&self, message: impl Into<String>) {
        self.lock()
            .write_error = Some(message.into());
    }

    /// Slow every write down, to widen race windows in tests.
    pub fn set_write_delay(&self, delay: Duration) {
        self.lock()
            .write_delay = delay;
    }

    /// Simulate the cable being pulled: every read and write fails.
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.read_error = Some("device disconnected".to_string());
        state.write_error = Some("device disconnected".to_string());
        drop(state);
        self.shared
            .readable
            .notify_all();
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.lock()
            .open_handles
    }

    /// Configuration of the most recent successful open.
    pub fn last_config(&self) -> Option<PortConfig> {
        self.lock()
            .last_config
            .clone()
    }

    /// How many times the host cleared the buffers.
    pub fn clear_count(&self) -> usize {
        self.lock()
            .clears
    }

    fn attach(&self, name: &str, timeouts: &PortTimeouts) -> MemoryPort {
        self.lock()
            .open_handles += 1;
        MemoryPort {
            device: self.clone(),
            name: name.to_string(),
            read_timeout: timeouts.read,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Host-side handle to a [`MemoryDevice`].
#[derive(Debug)]
pub struct MemoryPort {
    device: MemoryDevice,
    name: String,
    read_timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        let mut state = self
            .device
            .lock();
        state.open_handles = state
            .open_handles
            .saturating_sub(1);
    }
}

impl Read for MemoryPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        let mut state = self
            .device
            .lock();
        loop {
            if self
                .cancelled
                .swap(false, Ordering::SeqCst)
            {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
            }
            if let Some(message) = &state.read_error {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, message.clone()));
            }
            if !state
                .to_host
                .is_empty()
            {
                let n = buf
                    .len()
                    .min(
                        state
                            .to_host
                            .len(),
                    );
                for (slot, byte) in buf
                    .iter_mut()
                    .zip(
                        state
                            .to_host
                            .drain(..n),
                    )
                {
                    *slot = byte;
                }
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
            }
            let (guard, _) = self
                .device
                .shared
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
        }
    }
}

impl Write for MemoryPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = self
            .device
            .lock()
            .write_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self
            .device
            .lock();
        if let Some(message) = &state.write_error {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, message.clone()));
        }
        state
            .written
            .extend_from_slice(buf);
        if state.echo {
            state
                .to_host
                .extend(buf);
            drop(state);
            self.device
                .shared
                .readable
                .notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self
            .device
            .lock();
        state
            .to_host
            .clear();
        state.clears += 1;
        Ok(())
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        let mut clone = self
            .device
            .attach(
                &self.name,
                &PortTimeouts::default(),
            );
        clone.read_timeout = self.read_timeout;
        Ok(Box::new(clone))
    }

    fn read_canceller(&self) -> Option<ReadCanceller> {
        let cancelled = Arc::clone(&self.cancelled);
        let shared = Arc::clone(
            &self
                .device
                .shared,
        );
        Some(Arc::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            // Take the lock so a reader between its flag check and its wait
            // cannot miss the notification.
            let _state = shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            shared
                .readable
                .notify_all();
        }))
    }
}

/// Backend over a set of named in-memory devices.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    devices: Arc<Mutex<BTreeMap<String, MemoryDevice>>>,
}

impl MemoryBackend {
    /// Create a backend with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under `name`, returning its test-side handle.
    pub fn add_device(&self, name: impl Into<String>) -> MemoryDevice {
        let device = MemoryDevice::default();
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), device.clone());
        device
    }

    /// Remove a device; existing handles keep working until dropped.
    pub fn remove_device(&self, name: &str) -> Option<MemoryDevice> {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
    }
}

impl PortBackend for MemoryBackend {
    fn open(&self, config: &PortConfig, timeouts: &PortTimeouts) -> Result<Box<dyn Port>> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&config.port_name)
            .cloned()
            .ok_or_else(|| Error::port_open(config.port_name.as_str(), "no such device"))?;
        {
            let mut state = device.lock();
            if state.refuse_open {
                return Err(Error::port_open(
                    config.port_name.as_str(),
                    "device or resource busy",
                ));
            }
            state.last_config = Some(config.clone());
        }
        Ok(Box::new(device.attach(&config.port_name, timeouts)))
    }

    fn candidates(&self) -> Result<Vec<String>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}
