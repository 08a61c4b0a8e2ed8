//! Producer-facing sink handle.
//!
//! [`ShippingSink`] owns the bounded queue, the overflow store and the
//! appender thread. Producers call [`Sink::publish`] from any thread; it
//! never blocks on the network. Oversized messages are chunked here, before
//! they reach the queue, so every queued entry fits in one payload.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    appender::{Appender, AppenderSettings, Control},
    connection::ConnectionManager,
    formatter::{SharedFormatter, chunk},
    level::Severity,
    log_event::{LogEvent, local_host_name},
    overflow_store::OverflowStore,
    queue::{BoundedQueue, Enqueued, QueueError, QueueOverflowPolicy},
    rate_limited_warner::RateLimitedWarner,
    transport::Transport,
};

pub mod builder;
pub mod config;
mod ini;

pub use builder::{BackoffOverrides, BuildError, SinkBuilder};
pub use config::{HostTag, MessageFormat, Relay, SinkConfig};

/// Extra time `close` allows the worker to persist leftovers after its
/// deadline.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Capability interface every log destination implements.
pub trait Sink: Send + Sync {
    /// Accept an event for delivery without blocking on I/O.
    fn publish(&self, event: LogEvent) -> Result<Admission, PublishError>;

    /// Wait until queued events have been handed to the transport or the
    /// overflow store. Returns `false` on timeout or after close.
    fn flush(&self) -> bool;

    /// Stop the sink. A zero timeout waits until the queue is drained.
    fn close(&self, flush_timeout: Duration);
}

/// Outcome of a successful publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Accepted, but the queue was full and `evicted` older entries were
    /// pushed out to make room.
    Overflowed { evicted: usize },
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be queued.
    #[error("event dropped")]
    Dropped,
    /// The sink has been closed.
    #[error("sink closed")]
    Closed,
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Sink shipping events through a background appender.
pub struct ShippingSink {
    queue: BoundedQueue<LogEvent>,
    control: Sender<Control>,
    store: Arc<OverflowStore>,
    formatter: SharedFormatter,
    overflow_policy: QueueOverflowPolicy,
    max_chunk_len: usize,
    host_tag: Option<Arc<str>>,
    flush_timeout: Duration,
    closed: AtomicBool,
    worker: Mutex<Option<Worker>>,
    warner: RateLimitedWarner,
}

fn resolve_host_tag(tag: &HostTag) -> Option<Arc<str>> {
    match tag {
        HostTag::Off => None,
        HostTag::Custom(tag) => Some(Arc::from(tag.as_str())),
        HostTag::Local => {
            let name = local_host_name().map(Arc::from);
            if name.is_none() {
                warn!("host tagging requested but the local host name is unknown");
            }
            name
        }
    }
}

impl ShippingSink {
    pub fn builder() -> SinkBuilder {
        SinkBuilder::new()
    }

    pub(crate) fn start(
        config: SinkConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, BuildError> {
        let store = Arc::new(OverflowStore::open(
            &config.store_path,
            config.store_ceiling,
            config.ceiling_policy,
        )?);
        let formatter = config.effective_format().formatter();
        let queue = BoundedQueue::new(config.queue_capacity);
        let (control, control_rx) = unbounded();
        let connection = ConnectionManager::new(transport, config.backoff.clone());
        let (appender, done) = Appender::new(
            queue.receiver().clone(),
            control_rx,
            Arc::clone(&store),
            formatter.clone(),
            connection,
            AppenderSettings {
                poll_interval: config.poll_interval,
                failure_threshold: config.failure_threshold,
                warn_interval: config.warn_interval,
            },
        );
        let handle = appender.spawn()?;
        debug!(
            "sink started with queue capacity {} and store {}",
            config.queue_capacity,
            config.store_path.display()
        );
        Ok(Self {
            queue,
            control,
            store,
            formatter,
            overflow_policy: config.overflow_policy,
            max_chunk_len: config.max_chunk_len,
            host_tag: resolve_host_tag(&config.host_tag),
            flush_timeout: config.flush_timeout,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(Worker { handle, done })),
            warner: RateLimitedWarner::new(config.warn_interval),
        })
    }

    /// Queue `message` at `Info` severity, ignoring the outcome.
    pub fn enqueue(&self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    /// Queue `message` at `severity`, ignoring the outcome.
    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        let _ = self.publish(LogEvent::new(severity, message));
    }

    /// Close with a timeout in milliseconds; `0` waits for the queue to
    /// drain and negative values are rejected.
    pub fn close_millis(&self, flush_timeout_ms: i64) -> Result<(), BuildError> {
        let millis = u64::try_from(flush_timeout_ms).map_err(|_| {
            BuildError::InvalidConfig(format!(
                "flush timeout must not be negative, got {flush_timeout_ms}"
            ))
        })?;
        self.close(Duration::from_millis(millis));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of events waiting in the in-memory queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn overflow_store(&self) -> &OverflowStore {
        &self.store
    }

    fn warn_drop(&self, reason: &str) {
        self.warner.record_drop();
        self.warner.warn_if_due(|count| {
            warn!("sink {reason}; dropped {count} events");
        });
    }

    fn handle_evicted(&self, evicted: LogEvent) {
        match self.overflow_policy {
            QueueOverflowPolicy::EvictOldest => self.warn_drop("queue full, evicted oldest"),
            QueueOverflowPolicy::SpillOldest => {
                let line = self.formatter.format(&evicted);
                if let Err(err) = self.store.put(&line) {
                    self.warner.record_drop();
                    self.warner.warn_if_due(|count| {
                        warn!("failed to spill evicted event ({err}); dropped {count} events");
                    });
                }
            }
        }
    }

    fn admit(&self, event: LogEvent) -> Result<usize, PublishError> {
        match self.queue.enqueue(event) {
            Ok(Enqueued::Accepted) => Ok(0),
            Ok(Enqueued::EvictedOldest(evicted)) => {
                self.handle_evicted(evicted);
                Ok(1)
            }
            Err(QueueError::Full) => {
                self.warn_drop("queue saturated");
                Err(PublishError::Dropped)
            }
            Err(QueueError::Closed) => Err(PublishError::Closed),
        }
    }

    fn join_worker(&self, deadline: Option<Instant>) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let finished = match deadline {
            None => {
                let _ = worker.done.recv();
                true
            }
            Some(deadline) => {
                let wait = (deadline + SHUTDOWN_GRACE).saturating_duration_since(Instant::now());
                !matches!(worker.done.recv_timeout(wait), Err(RecvTimeoutError::Timeout))
            }
        };
        if !finished {
            warn!("appender did not stop in time; leaving it to finish in the background");
            return;
        }
        if worker.handle.join().is_err() {
            warn!("appender thread panicked");
        }
    }
}

impl Sink for ShippingSink {
    fn publish(&self, event: LogEvent) -> Result<Admission, PublishError> {
        if self.is_closed() {
            self.warn_drop("closed");
            return Err(PublishError::Closed);
        }
        let event = match &self.host_tag {
            Some(tag) if event.host_tag().is_none() => event.with_host_tag(Arc::clone(tag)),
            _ => event,
        };
        let pieces: Vec<String> = match chunk(event.message(), self.max_chunk_len) {
            Ok(segments) if segments.len() > 1 => {
                segments.into_iter().map(str::to_owned).collect()
            }
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!("cannot chunk event: {err}");
                return Err(PublishError::Dropped);
            }
        };

        let evicted = if pieces.is_empty() {
            self.admit(event)?
        } else {
            let mut evicted = 0;
            for piece in pieces {
                evicted += self.admit(event.with_message(piece))?;
            }
            evicted
        };
        Ok(match evicted {
            0 => Admission::Queued,
            evicted => Admission::Overflowed { evicted },
        })
    }

    fn flush(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.warner.flush(|count| {
            warn!("sink dropped {count} events in the last interval");
        });
        let (ack_tx, ack_rx) = bounded(1);
        if self.control.send(Control::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(self.flush_timeout).is_ok()
    }

    fn close(&self, flush_timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let deadline = (!flush_timeout.is_zero()).then(|| Instant::now() + flush_timeout);
        debug!("closing sink with flush timeout {flush_timeout:?}");
        if self.control.send(Control::Close { deadline }).is_err() {
            debug!("appender already stopped");
        }
        self.join_worker(deadline);
        self.warner.flush(|count| {
            warn!("sink dropped {count} events before closing");
        });
    }
}

impl Drop for ShippingSink {
    fn drop(&mut self) {
        self.close(self.flush_timeout);
    }
}

impl std::fmt::Debug for ShippingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShippingSink")
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("store", &self.store.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests;
