//! Formatters turning [`LogEvent`] values into wire-ready lines.
//!
//! Every formatter is a pure function of the event: no I/O, no clock reads.
//! Embedded line feeds are replaced with U+2028 so one event always maps
//! to exactly one line on the wire and one record in the overflow store.
//! The [`chunk`] submodule splits oversized messages before they are queued.

use std::{borrow::Cow, fmt, sync::Arc, time::UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::log_event::LogEvent;

pub mod chunk;

pub use chunk::{ChunkError, chunk};

/// Replacement for `\n` inside a message.
pub const LINE_SEPARATOR_REPLACEMENT: char = '\u{2028}';

/// Trait for formatting log events into strings.
///
/// Implementors must be thread-safe (`Send + Sync`) because producers format
/// spilled events while the appender formats live ones.
pub trait MessageFormatter: Send + Sync {
    /// Format an event into a single line, without a trailing newline.
    fn format(&self, event: &LogEvent) -> String;
}

/// Shared formatter trait object used by the sink and its worker.
#[derive(Clone)]
pub struct SharedFormatter {
    inner: Arc<dyn MessageFormatter>,
}

impl SharedFormatter {
    /// Create a shared formatter from an owned formatter implementation.
    pub fn new<F>(formatter: F) -> Self
    where
        F: MessageFormatter + 'static,
    {
        Self {
            inner: Arc::new(formatter),
        }
    }

    /// Format an event using the wrapped formatter instance.
    pub fn format(&self, event: &LogEvent) -> String {
        self.inner.format(event)
    }
}

impl fmt::Debug for SharedFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedFormatter(<dyn MessageFormatter>)")
    }
}

/// Replace line feeds so the message occupies a single line.
pub fn single_line(message: &str) -> Cow<'_, str> {
    if message.contains('\n') {
        Cow::Owned(message.replace('\n', "\u{2028}"))
    } else {
        Cow::Borrowed(message)
    }
}

fn unix_millis(event: &LogEvent) -> u64 {
    event
        .timestamp()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Key=value line for stream transports.
///
/// `Host=web-1 TraceID=<id> Timestamp=2024-05-01T10:00:00.000Z INFO message`;
/// the `Host=` field only appears when the event carries a host tag.
#[derive(Copy, Clone, Debug, Default)]
pub struct LineFormatter;

impl MessageFormatter for LineFormatter {
    fn format(&self, event: &LogEvent) -> String {
        let timestamp = DateTime::<Utc>::from(event.timestamp())
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let message = single_line(event.message());
        match event.host_tag() {
            Some(host) => format!(
                "Host={host} TraceID={} Timestamp={timestamp} {} {message}",
                event.trace_id(),
                event.severity(),
            ),
            None => format!(
                "TraceID={} Timestamp={timestamp} {} {message}",
                event.trace_id(),
                event.severity(),
            ),
        }
    }
}

#[derive(Serialize)]
struct JsonEnvelope<'a> {
    event: JsonEvent<'a>,
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    #[serde(rename = "Host", skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(rename = "TraceID")]
    trace_id: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: u64,
    #[serde(rename = "Severity")]
    severity: &'a str,
    #[serde(rename = "Message")]
    message: &'a str,
}

/// `{"event": {...}}` document for request/response transports.
#[derive(Copy, Clone, Debug, Default)]
pub struct JsonFormatter;

impl MessageFormatter for JsonFormatter {
    fn format(&self, event: &LogEvent) -> String {
        let message = single_line(event.message());
        let envelope = JsonEnvelope {
            event: JsonEvent {
                host: event.host_tag(),
                trace_id: event.trace_id(),
                timestamp: unix_millis(event),
                severity: event.severity().as_str(),
                message: &message,
            },
        };
        serde_json::to_string(&envelope).unwrap_or_else(|err| {
            log::warn!("JsonFormatter failed to serialise event: {err}");
            String::new()
        })
    }
}

/// Message text only, without any metadata.
#[derive(Copy, Clone, Debug, Default)]
pub struct RawFormatter;

impl MessageFormatter for RawFormatter {
    fn format(&self, event: &LogEvent) -> String {
        single_line(event.message()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Severity;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::time::{Duration, UNIX_EPOCH};

    fn fixed_event(message: &str) -> LogEvent {
        LogEvent::at(
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            Severity::Warn,
            message,
        )
        .with_trace_id("ABC123")
    }

    #[rstest]
    fn shared_formatter_is_send_sync() {
        assert_impl_all!(SharedFormatter: Send, Sync);
    }

    #[rstest]
    fn line_formatter_renders_metadata() {
        let line = LineFormatter.format(&fixed_event("disk low").with_host_tag("web-1"));
        assert_eq!(
            line,
            "Host=web-1 TraceID=ABC123 Timestamp=2023-11-14T22:13:20.123Z WARN disk low"
        );
    }

    #[rstest]
    fn line_formatter_omits_missing_host() {
        let line = LineFormatter.format(&fixed_event("x"));
        assert!(line.starts_with("TraceID=ABC123 "));
    }

    #[rstest]
    fn json_formatter_wraps_event() {
        let line = JsonFormatter.format(&fixed_event("say \"hi\"").with_host_tag("h"));
        let value: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        let event = &value["event"];
        assert_eq!(event["Host"], "h");
        assert_eq!(event["TraceID"], "ABC123");
        assert_eq!(event["Timestamp"], 1_700_000_000_123u64);
        assert_eq!(event["Severity"], "WARN");
        assert_eq!(event["Message"], "say \"hi\"");
    }

    #[rstest]
    #[case::line(SharedFormatter::new(LineFormatter))]
    #[case::json(SharedFormatter::new(JsonFormatter))]
    #[case::raw(SharedFormatter::new(RawFormatter))]
    fn formatters_never_emit_line_feeds(#[case] formatter: SharedFormatter) {
        let line = formatter.format(&fixed_event("first\nsecond\n"));
        assert!(!line.contains('\n'));
        assert!(line.contains(LINE_SEPARATOR_REPLACEMENT));
    }

    #[rstest]
    fn raw_formatter_passes_message_through() {
        assert_eq!(RawFormatter.format(&fixed_event("plain")), "plain");
    }
}
