//! Configuration consumed by [`ShippingSink`](super::ShippingSink).
//!
//! [`SinkBuilder`](super::SinkBuilder) validates and produces these values;
//! the defaults below apply to every field the builder leaves untouched.

use std::{path::PathBuf, time::Duration};

use uuid::Uuid;

use crate::{
    connection::BackoffPolicy,
    formatter::{JsonFormatter, LineFormatter, RawFormatter, SharedFormatter},
    overflow_store::{CeilingPolicy, DEFAULT_STORE_CEILING},
    queue::{DEFAULT_QUEUE_CAPACITY, QueueOverflowPolicy},
    rate_limited_warner::DEFAULT_WARN_INTERVAL,
    transport::{
        TransportKind,
        http::DEFAULT_HTTP_BASE_URL,
        tcp::{DEFAULT_PLAIN_PORT, DEFAULT_STREAM_HOST, DEFAULT_TLS_PORT},
    },
};

/// Largest message segment, in bytes, before chunking kicks in.
pub const DEFAULT_MAX_CHUNK_LEN: usize = 65_536;
/// How long the worker waits for a queued event before re-checking state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive delivery failures before the link is treated as broken.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Wait applied by `flush` and by the implicit close on drop.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Wire format of each payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageFormat {
    /// `Host=.. TraceID=.. Timestamp=.. SEVERITY message`.
    Line,
    /// `{"event": {...}}`.
    Json,
    /// Message text only.
    Raw,
}

impl MessageFormat {
    /// Format a transport expects when none is configured.
    pub fn default_for(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Socket => Self::Line,
            TransportKind::Http => Self::Json,
        }
    }

    pub(crate) fn formatter(self) -> SharedFormatter {
        match self {
            Self::Line => SharedFormatter::new(LineFormatter),
            Self::Json => SharedFormatter::new(JsonFormatter),
            Self::Raw => SharedFormatter::new(RawFormatter),
        }
    }
}

/// Whether and how events are tagged with a host name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum HostTag {
    #[default]
    Off,
    /// Use the local machine's host name.
    Local,
    Custom(String),
}

/// Intermediate collector the stream transport connects to instead of the
/// public endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relay {
    pub host: String,
    pub port: u16,
}

/// Configuration object describing how to construct a sink.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub token: String,
    pub transport: TransportKind,
    pub use_tls: bool,
    pub relay: Option<Relay>,
    pub http_base_url: String,
    pub format: Option<MessageFormat>,
    pub host_tag: HostTag,
    pub queue_capacity: usize,
    pub overflow_policy: QueueOverflowPolicy,
    pub max_chunk_len: usize,
    pub poll_interval: Duration,
    /// Failed attempts on one entry, the first included, before the link is
    /// treated as broken and the entry is persisted.
    pub failure_threshold: u32,
    pub store_path: PathBuf,
    pub store_ceiling: u64,
    pub ceiling_policy: CeilingPolicy,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub flush_timeout: Duration,
    pub warn_interval: Duration,
}

/// Overflow file under the system temp directory, named after the sink's
/// destination.
///
/// The name is a UUIDv5 of transport kind, endpoint and token, so it is
/// stable across restarts while sinks shipping elsewhere get their own file.
pub fn default_store_path(transport: TransportKind, endpoint: &str, token: &str) -> PathBuf {
    let key = format!("{transport:?}|{endpoint}|{token}");
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes());
    std::env::temp_dir()
        .join("lineship")
        .join(format!("overflow-{}.log", id.simple()))
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            transport: TransportKind::default(),
            use_tls: false,
            relay: None,
            http_base_url: DEFAULT_HTTP_BASE_URL.to_owned(),
            format: None,
            host_tag: HostTag::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: QueueOverflowPolicy::default(),
            max_chunk_len: DEFAULT_MAX_CHUNK_LEN,
            poll_interval: DEFAULT_POLL_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            store_path: default_store_path(TransportKind::default(), "", ""),
            store_ceiling: DEFAULT_STORE_CEILING,
            ceiling_policy: CeilingPolicy::default(),
            backoff: BackoffPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            warn_interval: DEFAULT_WARN_INTERVAL,
        }
    }
}

impl SinkConfig {
    /// Address the configured transport ships to.
    pub fn endpoint(&self) -> String {
        match (self.transport, &self.relay) {
            (TransportKind::Http, _) => self.http_base_url.clone(),
            (TransportKind::Socket, Some(relay)) => format!("{}:{}", relay.host, relay.port),
            (TransportKind::Socket, None) => {
                let port = if self.use_tls {
                    DEFAULT_TLS_PORT
                } else {
                    DEFAULT_PLAIN_PORT
                };
                format!("{DEFAULT_STREAM_HOST}:{port}")
            }
        }
    }

    /// Per-destination overflow file used when no store path is set.
    pub fn derived_store_path(&self) -> PathBuf {
        default_store_path(self.transport, &self.endpoint(), &self.token)
    }

    /// Format in effect once defaults are applied.
    pub fn effective_format(&self) -> MessageFormat {
        self.format
            .unwrap_or_else(|| MessageFormat::default_for(self.transport))
    }
}
