//! Delivery worker: one thread per sink.
//!
//! Each cycle the worker replays the overflow store if it holds records,
//! otherwise waits up to the poll interval for a queued event, formats it and
//! hands it to the [`ConnectionManager`]. Consecutive failures below the
//! threshold back off and retry the same entry; at the threshold the link is
//! considered broken, the entry is persisted and later entries go straight to
//! the store until a scheduled reconnect succeeds.
//!
//! Every wait is cancellable through the control channel so `close` can
//! interrupt a poll or a backoff delay.

use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use log::{debug, warn};

use crate::{
    connection::ConnectionManager, formatter::SharedFormatter, log_event::LogEvent,
    overflow_store::OverflowStore, rate_limited_warner::RateLimitedWarner,
};

/// Commands sent from the sink to its worker.
#[derive(Debug)]
pub(crate) enum Control {
    /// Acknowledge once the queue and replay backlog are empty.
    Flush(Sender<()>),
    /// Stop; `None` drains without a deadline.
    Close { deadline: Option<Instant> },
}

/// Phases of the delivery loop, logged at debug level on change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppenderState {
    Idle,
    DrainingOverflow,
    DrainingQueue,
    Reconnecting,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shutdown {
    Drain,
    Until(Instant),
}

impl Shutdown {
    fn from_deadline(deadline: Option<Instant>) -> Self {
        deadline.map_or(Self::Drain, Self::Until)
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Until(a), Self::Until(b)) => Self::Until(a.min(b)),
            (Self::Until(a), Self::Drain) | (Self::Drain, Self::Until(a)) => Self::Until(a),
            (Self::Drain, Self::Drain) => Self::Drain,
        }
    }
}

/// Entry currently being delivered.
#[derive(Debug)]
enum Pending {
    /// Replayed from the overflow store.
    Stored(String),
    /// Taken from the in-memory queue.
    Live(String),
}

impl Pending {
    fn line(&self) -> &str {
        match self {
            Pending::Stored(line) | Pending::Live(line) => line,
        }
    }
}

enum Attempt {
    Delivered,
    Rejected,
    Failed,
}

/// Tunables the worker reads from the sink configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AppenderSettings {
    pub poll_interval: Duration,
    /// Failed attempts on one entry, the first included, after which the
    /// link is treated as broken. With the default of 3 an entry is tried
    /// three times in total before it is persisted.
    pub failure_threshold: u32,
    pub warn_interval: Duration,
}

pub(crate) struct Appender {
    queue: Receiver<LogEvent>,
    control: Receiver<Control>,
    done: Sender<()>,
    store: Arc<OverflowStore>,
    formatter: SharedFormatter,
    connection: ConnectionManager,
    settings: AppenderSettings,
    backlog: VecDeque<String>,
    failures: u32,
    link_broken: bool,
    shutdown: Option<Shutdown>,
    flush_waiters: Vec<Sender<()>>,
    state: AppenderState,
    warner: RateLimitedWarner,
}

impl Appender {
    /// Create a worker; the returned receiver fires (or disconnects) once it
    /// has stopped.
    pub(crate) fn new(
        queue: Receiver<LogEvent>,
        control: Receiver<Control>,
        store: Arc<OverflowStore>,
        formatter: SharedFormatter,
        connection: ConnectionManager,
        settings: AppenderSettings,
    ) -> (Self, Receiver<()>) {
        let (done, done_rx) = bounded(1);
        let appender = Self {
            queue,
            control,
            done,
            store,
            formatter,
            connection,
            settings,
            backlog: VecDeque::new(),
            failures: 0,
            link_broken: false,
            shutdown: None,
            flush_waiters: Vec::new(),
            state: AppenderState::Idle,
            warner: RateLimitedWarner::new(settings.warn_interval),
        };
        (appender, done_rx)
    }

    /// Run the worker on a dedicated named thread.
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("lineship-appender".into())
            .spawn(move || self.run())
    }

    pub(crate) fn run(mut self) {
        debug!("appender started for {}", self.connection.describe());
        while !self.should_stop(Instant::now()) {
            self.restore_link_if_due();
            if let Some(pending) = self.next_entry() {
                self.deliver(pending);
            }
            self.ack_flushes_if_idle();
        }
        self.finish();
    }

    fn transition(&mut self, next: AppenderState) {
        if self.state != next {
            debug!("appender {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.shutdown {
            Some(Shutdown::Until(deadline)) => Some(deadline),
            _ => None,
        }
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    fn request_shutdown(&mut self, deadline: Option<Instant>) {
        let requested = Shutdown::from_deadline(deadline);
        self.shutdown = Some(match self.shutdown {
            Some(current) => current.merge(requested),
            None => requested,
        });
    }

    fn handle_control(&mut self, command: Control) {
        match command {
            Control::Flush(ack) => self.flush_waiters.push(ack),
            Control::Close { deadline } => {
                debug!("appender close requested");
                self.request_shutdown(deadline);
            }
        }
    }

    /// `true` when nothing is left to do that the link could carry.
    fn is_drained(&self) -> bool {
        self.queue.is_empty()
            && self.backlog.is_empty()
            && (self.link_broken || !self.store.has_records())
    }

    fn should_stop(&self, now: Instant) -> bool {
        match self.shutdown {
            None => false,
            Some(_) if self.deadline_passed(now) => true,
            Some(_) => self.is_drained(),
        }
    }

    fn ack_flushes_if_idle(&mut self) {
        if !self.flush_waiters.is_empty() && self.is_drained() {
            for ack in self.flush_waiters.drain(..) {
                let _ = ack.send(());
            }
        }
    }

    fn restore_link_if_due(&mut self) {
        let now = Instant::now();
        if !self.link_broken || !self.connection.retry_due(now) {
            return;
        }
        self.transition(AppenderState::Reconnecting);
        match self.connection.connect() {
            Ok(()) => {
                debug!("link to {} restored", self.connection.describe());
                self.link_broken = false;
                self.failures = 0;
            }
            Err(err) => {
                let retry_at = self.connection.schedule_retry(now);
                debug!(
                    "reconnect failed: {err}; next attempt in {:?}",
                    retry_at.saturating_duration_since(now)
                );
            }
        }
    }

    fn load_backlog(&mut self) {
        match self.store.drain_all(true) {
            Ok(records) => {
                debug!("replaying {} stored records", records.len());
                self.backlog.extend(records);
            }
            Err(err) => {
                warn!("overflow store unreadable, discarding it: {err}");
                if let Err(err) = self.store.recreate() {
                    warn!("failed to recreate overflow store: {err}");
                }
            }
        }
    }

    fn poll_wait(&self, now: Instant) -> Duration {
        let mut wait = self.settings.poll_interval;
        if self.link_broken
            && let Some(until_retry) = self.connection.until_retry(now)
        {
            wait = wait.min(until_retry);
        }
        if let Some(deadline) = self.deadline() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        wait
    }

    fn next_entry(&mut self) -> Option<Pending> {
        if self.backlog.is_empty() && !self.link_broken && self.store.has_records() {
            self.transition(AppenderState::DrainingOverflow);
            self.load_backlog();
        }
        if let Some(line) = self.backlog.pop_front() {
            self.transition(AppenderState::DrainingOverflow);
            return Some(Pending::Stored(line));
        }

        let wait = self.poll_wait(Instant::now());
        let (queue, control) = (self.queue.clone(), self.control.clone());
        select! {
            recv(queue) -> event => match event {
                Ok(event) => {
                    self.transition(AppenderState::DrainingQueue);
                    let line = self.formatter.format(&event);
                    (!line.is_empty()).then_some(Pending::Live(line))
                }
                Err(_) => {
                    self.request_shutdown(Some(Instant::now()));
                    None
                }
            },
            recv(control) -> command => {
                match command {
                    Ok(command) => self.handle_control(command),
                    Err(_) => self.request_shutdown(Some(Instant::now())),
                }
                None
            },
            default(wait) => {
                self.transition(AppenderState::Idle);
                None
            },
        }
    }

    fn deliver(&mut self, pending: Pending) {
        // A loaded backlog is older than this entry; anything spilled to
        // disk since it was dequeued is newer and waits for the next cycle.
        let behind_stored = matches!(pending, Pending::Live(_)) && !self.backlog.is_empty();
        if self.link_broken || behind_stored {
            self.persist(pending);
            return;
        }
        match self.attempt(pending.line()) {
            Attempt::Delivered | Attempt::Rejected => {}
            Attempt::Failed => self.persist(pending),
        }
    }

    fn attempt(&mut self, line: &str) -> Attempt {
        loop {
            let err = match self.connection.send(line.as_bytes()) {
                Ok(()) => {
                    self.failures = 0;
                    return Attempt::Delivered;
                }
                Err(err) if err.is_permanent() => {
                    self.warner.record_drop();
                    self.warner.warn_if_due(|count| {
                        warn!("collector rejected payload ({err}); dropped {count} records");
                    });
                    return Attempt::Rejected;
                }
                Err(err) => err,
            };
            self.failures += 1;
            self.transition(AppenderState::Reconnecting);
            if self.failures >= self.settings.failure_threshold {
                let now = Instant::now();
                let retry_at = self.connection.schedule_retry(now);
                warn!(
                    "delivery to {} failed {} times ({err}); buffering to disk, next reconnect in {:?}",
                    self.connection.describe(),
                    self.failures,
                    retry_at.saturating_duration_since(now)
                );
                self.link_broken = true;
                return Attempt::Failed;
            }
            let delay = self.connection.next_backoff();
            debug!("delivery failed ({err}); retrying in {delay:?}");
            if !self.pause(delay) {
                return Attempt::Failed;
            }
        }
    }

    /// Sleep for `delay` while still servicing control commands.
    ///
    /// Returns `false` when a shutdown deadline expires first.
    fn pause(&mut self, delay: Duration) -> bool {
        let until = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if self.deadline_passed(now) {
                return false;
            }
            if now >= until {
                return true;
            }
            let mut wait = until - now;
            if let Some(deadline) = self.deadline() {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            match self.control.recv_timeout(wait) {
                Ok(command) => self.handle_control(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.request_shutdown(Some(now)),
            }
        }
    }

    /// Write an undelivered entry to the store. A storage failure drops the
    /// entry since there is no further fallback.
    fn persist(&mut self, pending: Pending) {
        let result = match pending {
            Pending::Stored(line) => {
                let mut records = Vec::with_capacity(self.backlog.len() + 1);
                records.push(line);
                records.extend(self.backlog.drain(..));
                self.store.requeue_front(records)
            }
            Pending::Live(line) => self.store.put(&line),
        };
        if let Err(err) = result {
            self.warner.record_drop();
            self.warner.warn_if_due(|count| {
                warn!("failed to persist undelivered record ({err}); dropped {count} records");
            });
        }
    }

    fn finish(mut self) {
        self.transition(AppenderState::Stopped);
        if !self.backlog.is_empty() {
            let records: Vec<String> = self.backlog.drain(..).collect();
            if let Err(err) = self.store.requeue_front(records) {
                warn!("failed to requeue replay backlog on shutdown: {err}");
            }
        }
        let queued: Vec<String> = self
            .queue
            .try_iter()
            .map(|event| self.formatter.format(&event))
            .filter(|line| !line.is_empty())
            .collect();
        if !queued.is_empty() {
            debug!("persisting {} queued records on shutdown", queued.len());
            if let Err(err) = self.store.put_all(queued.iter().map(String::as_str)) {
                warn!("some queued records could not be persisted on shutdown: {err}");
            }
        }
        self.connection.disconnect();
        self.warner.flush(|count| {
            warn!("appender dropped {count} records before stopping");
        });
        for ack in self.flush_waiters.drain(..) {
            let _ = ack.send(());
        }
        while let Ok(command) = self.control.try_recv() {
            if let Control::Flush(ack) = command {
                let _ = ack.send(());
            }
        }
        debug!("appender stopped");
        let _ = self.done.send(());
    }
}

#[cfg(test)]
mod tests;
