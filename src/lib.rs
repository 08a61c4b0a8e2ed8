//! Resilient client-side log shipping.
//!
//! Producers hand [`LogEvent`]s to a [`ShippingSink`], which queues them in a
//! bounded in-memory buffer. A dedicated appender thread formats each event,
//! delivers it over a [`Transport`] and falls back to a durable on-disk
//! [`OverflowStore`] whenever the collector cannot be reached. Stored
//! records are replayed, oldest first, once the link recovers.
//!
//! ```no_run
//! use std::time::Duration;
//! use lineship::{Severity, Sink, SinkBuilder};
//!
//! let sink = SinkBuilder::new()
//!     .with_token("2bfbea1e-10c3-4419-bdad-7e6435882e1f")
//!     .with_tls(true)
//!     .build()?;
//! sink.log(Severity::Warn, "disk usage above 90%");
//! sink.close(Duration::from_secs(2));
//! # Ok::<(), lineship::BuildError>(())
//! ```

pub mod appender;
pub mod connection;
pub mod formatter;
pub mod level;
pub mod log_event;
pub mod overflow_store;
pub mod queue;
pub mod rate_limited_warner;
pub mod sink;
pub mod transport;

#[cfg(feature = "log-compat")]
pub mod log_compat;
#[cfg(feature = "tracing-compat")]
pub mod tracing_compat;

pub use appender::AppenderState;
pub use connection::{
    ConnectionManager, ConnectionState,
    backoff::{BackoffPolicy, BackoffState},
};
pub use formatter::{
    ChunkError, JsonFormatter, LineFormatter, MessageFormatter, RawFormatter, SharedFormatter,
    chunk,
};
pub use level::{ParseSeverityError, Severity};
pub use log_event::LogEvent;
pub use overflow_store::{CeilingPolicy, OverflowStore, StorageError};
pub use queue::{BoundedQueue, QueueOverflowPolicy};
pub use rate_limited_warner::RateLimitedWarner;
pub use sink::{
    Admission, BackoffOverrides, BuildError, HostTag, MessageFormat, PublishError, Relay,
    ShippingSink, Sink, SinkBuilder, SinkConfig,
};
pub use transport::{
    ConnectError, DeliveryError, HttpPostTransport, MemoryTransport, TlsOptions,
    TokenStreamTransport, Transport, TransportKind, WriteError,
};

#[cfg(feature = "log-compat")]
pub use log_compat::SinkLogAdapter;
#[cfg(feature = "tracing-compat")]
pub use tracing_compat::SinkLayer;
