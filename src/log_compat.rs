//! Compatibility bridge for the Rust `log` crate.
//!
//! [`SinkLogAdapter`] implements `log::Log` and publishes every enabled
//! record to a [`Sink`]. Records emitted by this crate itself are ignored so
//! the pipeline's own diagnostics never loop back into it.

use std::sync::Arc;

use log::{LevelFilter, Metadata, Record, SetLoggerError};

use crate::{level::Severity, log_event::LogEvent, sink::Sink};

const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Adapter implementing the Rust `log::Log` trait on top of a sink.
pub struct SinkLogAdapter {
    sink: Arc<dyn Sink>,
    max_level: LevelFilter,
}

impl SinkLogAdapter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            max_level: LevelFilter::Info,
        }
    }

    pub fn with_max_level(mut self, level: LevelFilter) -> Self {
        self.max_level = level;
        self
    }

    /// Install the adapter as the global logger.
    ///
    /// Fails when another global logger is already set. The adapter lives
    /// for the rest of the process.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_logger(Box::leak(Box::new(self)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl log::Log for SinkLogAdapter {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level && !is_own_target(metadata.target())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let event = LogEvent::new(Severity::from(record.level()), record.args().to_string());
        let _ = self.sink.publish(event);
    }

    fn flush(&self) {
        self.sink.flush();
    }
}
