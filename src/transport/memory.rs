//! In-process transport that records delivered payloads.
//!
//! Clones share state, so a test keeps one handle to inspect deliveries and
//! script failures while the sink owns another.

use std::{io, sync::Arc};

use parking_lot::Mutex;

use super::{ConnectError, Transport, WriteError};

#[derive(Debug, Default)]
struct State {
    lines: Vec<String>,
    connected: bool,
    offline: bool,
    failing_connects: usize,
    failing_writes: usize,
    rejected_writes: Vec<u16>,
    open_count: usize,
    write_attempts: usize,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads delivered so far, in order.
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    /// Make the next `count` writes fail with a transient I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Make the next `count` connects fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().failing_connects = count;
    }

    /// Answer the next write with `status`, as an HTTP collector would.
    pub fn reject_next_write(&self, status: u16) {
        self.state.lock().rejected_writes.push(status);
    }

    /// While offline every connect and write fails.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if offline {
            state.connected = false;
        }
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Number of `write_line` calls, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.state.lock().write_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> Result<(), ConnectError> {
        let mut state = self.state.lock();
        if state.offline || state.failing_connects > 0 {
            state.failing_connects = state.failing_connects.saturating_sub(1);
            return Err(ConnectError::new(
                "memory",
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ));
        }
        state.connected = true;
        state.open_count += 1;
        Ok(())
    }

    fn write_line(&mut self, payload: &[u8]) -> Result<(), WriteError> {
        let mut state = self.state.lock();
        state.write_attempts += 1;
        if !state.connected {
            return Err(WriteError::NotConnected);
        }
        if !state.rejected_writes.is_empty() {
            return Err(WriteError::Rejected(state.rejected_writes.remove(0)));
        }
        if state.offline || state.failing_writes > 0 {
            state.failing_writes = state.failing_writes.saturating_sub(1);
            state.connected = false;
            return Err(WriteError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        state
            .lines
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().connected = false;
    }

    fn describe(&self) -> String {
        "memory://".to_owned()
    }
}
