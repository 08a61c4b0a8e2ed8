//! Log event representation shipped by the pipeline.
//!
//! A [`LogEvent`] is created on the producer thread and is immutable from
//! then on. The trace id and local host name are process-wide values
//! computed once on first use.

use std::sync::Arc;
use std::time::SystemTime;

use once_cell::sync::Lazy;

use crate::level::Severity;

static TRACE_ID: Lazy<Arc<str>> = Lazy::new(|| Arc::from(format!("{:032X}", rand::random::<u128>())));

static LOCAL_HOST_NAME: Lazy<Option<String>> = Lazy::new(resolve_host_name);

/// Characters a host tag must not contain; they collide with the key=value
/// line format or with URL syntax on HTTP transports.
const FORBIDDEN_HOST_TAG_CHARS: &[char] = &[
    '$', '/', '"', '&', '+', ',', ':', ';', '=', '?', '#', '|', '<', '>', '_', '*', ' ', '[', ']',
    '\\',
];

fn resolve_host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
}

/// Random identifier shared by every event produced by this process.
pub fn process_trace_id() -> Arc<str> {
    Arc::clone(&TRACE_ID)
}

/// Host name of the local machine, if it could be determined.
pub fn local_host_name() -> Option<&'static str> {
    LOCAL_HOST_NAME.as_deref()
}

/// Return `true` when `tag` is non-empty and free of reserved characters.
pub fn is_valid_host_tag(tag: &str) -> bool {
    !tag.is_empty() && !tag.contains(FORBIDDEN_HOST_TAG_CHARS)
}

#[derive(Clone, Debug)]
pub struct LogEvent {
    timestamp: SystemTime,
    severity: Severity,
    message: String,
    host_tag: Option<Arc<str>>,
    trace_id: Arc<str>,
}

impl LogEvent {
    /// Capture a new event stamped with the current time.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self::at(SystemTime::now(), severity, message)
    }

    /// Construct an event with an explicit timestamp.
    pub fn at(timestamp: SystemTime, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            severity,
            message: message.into(),
            host_tag: None,
            trace_id: process_trace_id(),
        }
    }

    /// Attach a host tag to the event.
    pub fn with_host_tag(mut self, host_tag: impl Into<Arc<str>>) -> Self {
        self.host_tag = Some(host_tag.into());
        self
    }

    /// Replace the process trace id, for producers relaying foreign events.
    pub fn with_trace_id(mut self, trace_id: impl Into<Arc<str>>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Copy of this event carrying `message` instead; used for chunks.
    pub(crate) fn with_message(&self, message: String) -> Self {
        Self {
            timestamp: self.timestamp,
            severity: self.severity,
            message,
            host_tag: self.host_tag.clone(),
            trace_id: Arc::clone(&self.trace_id),
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn host_tag(&self) -> Option<&str> {
        self.host_tag.as_deref()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}
