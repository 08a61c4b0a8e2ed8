//! Transports move one formatted line at a time to the remote collector.
//!
//! The appender owns exactly one transport and never issues two writes on it
//! concurrently. Transports only need to know how to open a link, write a
//! payload and close; reconnect scheduling lives in
//! [`crate::connection::ConnectionManager`].

use std::io;

use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod tcp;

pub use http::HttpPostTransport;
pub use memory::MemoryTransport;
pub use tcp::{TlsOptions, TokenStreamTransport};

/// Delivery channel used by the appender.
pub trait Transport: Send {
    /// Establish the link. Called again after any failed write.
    fn open(&mut self) -> Result<(), ConnectError>;

    /// Deliver one formatted payload, without trailing newline.
    fn write_line(&mut self, payload: &[u8]) -> Result<(), WriteError>;

    /// Release the link. Never fails; errors are swallowed.
    fn close(&mut self);

    /// Short description used in diagnostics.
    fn describe(&self) -> String;
}

impl Transport for Box<dyn Transport> {
    fn open(&mut self) -> Result<(), ConnectError> {
        (**self).open()
    }

    fn write_line(&mut self, payload: &[u8]) -> Result<(), WriteError> {
        (**self).write_line(payload)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Which family of transport a sink talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent token-prefixed stream, plain or TLS.
    #[default]
    Socket,
    /// One HTTP POST per payload.
    Http,
}

#[derive(Debug, Error)]
#[error("failed to connect to {endpoint}: {source}")]
pub struct ConnectError {
    pub endpoint: String,
    #[source]
    pub source: io::Error,
}

impl ConnectError {
    pub fn new(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self {
            endpoint: endpoint.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("transport is not connected")]
    NotConnected,
    /// The collector answered with a non-success status.
    #[error("collector rejected payload with status {0}")]
    Rejected(u16),
    #[error("http request failed: {0}")]
    Http(String),
}

impl WriteError {
    /// `true` when retrying the same payload can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(status) if (400..500).contains(status) && *status != 429)
    }
}

/// Failure of a single delivery attempt through the connection manager.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Write(err) if err.is_permanent())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("token {0:?} is not a UUID")]
pub struct InvalidToken(pub String);

/// Validate that `token` has the 8-4-4-4-12 hexadecimal UUID shape.
pub fn validate_token(token: &str) -> Result<(), InvalidToken> {
    let hyphenated = token.len() == 36;
    match Uuid::parse_str(token) {
        Ok(_) if hyphenated => Ok(()),
        _ => Err(InvalidToken(token.to_owned())),
    }
}
