//! Connection lifecycle around a single [`Transport`].
//!
//! `Disconnected -> Connecting -> Connected`; any failed write drops back to
//! `Disconnected`. The manager never sleeps: it hands out backoff delays and
//! retry instants, and the appender decides how to wait so that shutdown can
//! interrupt it.

use std::time::{Duration, Instant};

use log::debug;

use crate::transport::{DeliveryError, Transport};

pub mod backoff;

pub use backoff::{BackoffPolicy, BackoffState};

/// Observable link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Backoff(Duration),
}

pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    state: ConnectionState,
    backoff: BackoffState,
    retry_at: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn Transport>, policy: BackoffPolicy) -> Self {
        Self::with_backoff(transport, BackoffState::new(policy))
    }

    pub fn with_backoff(transport: Box<dyn Transport>, backoff: BackoffState) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            backoff,
            retry_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(
                "{} connection {:?} -> {:?}",
                self.transport.describe(),
                self.state,
                state
            );
            self.state = state;
        }
    }

    /// Make one connection attempt if not already connected.
    pub fn connect(&mut self) -> Result<(), DeliveryError> {
        if self.is_connected() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        match self.transport.open() {
            Ok(()) => {
                self.backoff.reset();
                self.retry_at = None;
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                debug!("connect attempt failed: {err}");
                self.set_state(ConnectionState::Disconnected);
                Err(err.into())
            }
        }
    }

    /// Connect if needed, then write `payload`.
    ///
    /// On a transient write failure the transport is closed and the state
    /// returns to `Disconnected` so the next call reconnects. A permanent
    /// rejection leaves the link as it is.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
        self.connect()?;
        match self.transport.write_line(payload) {
            Ok(()) => Ok(()),
            Err(err) if err.is_permanent() => Err(err.into()),
            Err(err) => {
                self.transport.close();
                self.set_state(ConnectionState::Disconnected);
                Err(err.into())
            }
        }
    }

    /// Close the transport; best effort.
    pub fn disconnect(&mut self) {
        self.transport.close();
        self.retry_at = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Delay to wait before the next reconnect attempt.
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        self.set_state(ConnectionState::Backoff(delay));
        delay
    }

    /// Schedule the next reconnect attempt one backoff delay after `now`.
    pub fn schedule_retry(&mut self, now: Instant) -> Instant {
        let at = now + self.next_backoff();
        self.retry_at = Some(at);
        at
    }

    /// `true` when no retry is scheduled or the scheduled instant has passed.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Time left until the scheduled retry, if one is pending.
    pub fn until_retry(&self, now: Instant) -> Option<Duration> {
        self.retry_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.transport.describe())
            .field("state", &self.state)
            .field("retry_at", &self.retry_at)
            .finish()
    }
}
