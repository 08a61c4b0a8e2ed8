//! Worker-level tests driving the appender with an in-memory transport.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::{
    connection::{BackoffPolicy, BackoffState},
    formatter::RawFormatter,
    level::Severity,
    overflow_store::{CeilingPolicy, DEFAULT_STORE_CEILING},
    transport::MemoryTransport,
};

struct Harness {
    events: Sender<LogEvent>,
    control: Sender<Control>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    appender: Option<Appender>,
    probe: MemoryTransport,
    store: Arc<OverflowStore>,
    _dir: TempDir,
}

impl Harness {
    fn new(failure_threshold: u32, backoff_base: Duration) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(
            OverflowStore::open(
                dir.path().join("overflow.log"),
                DEFAULT_STORE_CEILING,
                CeilingPolicy::default(),
            )
            .expect("open store"),
        );
        let probe = MemoryTransport::new();
        let policy = BackoffPolicy {
            base: backoff_base,
            cap: backoff_base * 4,
            jitter: Duration::ZERO,
        };
        let connection = ConnectionManager::with_backoff(
            Box::new(probe.clone()),
            BackoffState::with_seed(policy, 11),
        );
        let (events, queue) = bounded(64);
        let (control, control_rx) = unbounded();
        let (appender, done) = Appender::new(
            queue,
            control_rx,
            Arc::clone(&store),
            SharedFormatter::new(RawFormatter),
            connection,
            AppenderSettings {
                poll_interval: Duration::from_millis(20),
                failure_threshold,
                warn_interval: Duration::from_millis(10),
            },
        );
        Self {
            events,
            control,
            done,
            handle: None,
            appender: Some(appender),
            probe,
            store,
            _dir: dir,
        }
    }

    fn send(&self, messages: &[&str]) {
        for message in messages {
            self.events
                .send(LogEvent::new(Severity::Info, *message))
                .expect("queue open");
        }
    }

    fn start(&mut self) {
        let appender = self.appender.take().expect("not started yet");
        self.handle = Some(appender.spawn().expect("spawn appender"));
    }

    fn close(&mut self, deadline: Option<Instant>) {
        self.control
            .send(Control::Close { deadline })
            .expect("control open");
        let finished = self.done.recv_timeout(Duration::from_secs(5));
        assert!(
            !matches!(finished, Err(crossbeam_channel::RecvTimeoutError::Timeout)),
            "appender did not stop"
        );
        if let Some(handle) = self.handle.take() {
            handle.join().expect("appender thread");
        }
    }

    fn stored(&self) -> Vec<String> {
        self.store.drain_all(false).expect("read store")
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[rstest]
fn delivers_events_in_order() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.start();
    harness.send(&["a", "b", "c", "d"]);
    harness.close(None);
    assert_eq!(harness.probe.lines(), vec!["a", "b", "c", "d"]);
    assert!(harness.stored().is_empty());
}

#[rstest]
fn retries_transient_failures_below_threshold() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.probe.fail_next_writes(2);
    harness.send(&["a", "b"]);
    harness.start();
    harness.close(None);
    assert_eq!(harness.probe.lines(), vec!["a", "b"]);
    assert_eq!(harness.probe.open_count(), 3);
    assert!(harness.stored().is_empty());
}

#[rstest]
fn broken_link_buffers_then_replays_in_order() {
    let mut harness = Harness::new(3, Duration::from_millis(2));
    harness.probe.set_offline(true);
    harness.start();
    harness.send(&["1", "2", "3"]);
    wait_until(|| harness.stored().len() == 3);
    assert!(harness.probe.lines().is_empty());

    harness.probe.set_offline(false);
    wait_until(|| harness.probe.lines().len() == 3);
    harness.send(&["4", "5"]);
    harness.close(None);
    assert_eq!(harness.probe.lines(), vec!["1", "2", "3", "4", "5"]);
    assert!(harness.stored().is_empty());
}

#[rstest]
fn replays_stored_records_before_new_events() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.store.put_all(["old-1", "old-2"]).expect("seed store");
    harness.send(&["new-1", "new-2"]);
    harness.start();
    harness.close(None);
    assert_eq!(
        harness.probe.lines(),
        vec!["old-1", "old-2", "new-1", "new-2"]
    );
}

#[rstest]
fn close_deadline_persists_undelivered_events() {
    let mut harness = Harness::new(1_000, Duration::from_millis(50));
    harness.probe.set_offline(true);
    harness.send(&["a", "b", "c"]);
    harness.start();
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    harness.close(Some(Instant::now() + Duration::from_millis(50)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(harness.probe.lines().is_empty());
    assert_eq!(harness.stored(), vec!["a", "b", "c"]);
}

#[rstest]
fn permanent_rejections_are_dropped() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.probe.reject_next_write(400);
    harness.send(&["bad", "good"]);
    harness.start();
    harness.close(None);
    assert_eq!(harness.probe.lines(), vec!["good"]);
    assert!(harness.stored().is_empty());
}

#[rstest]
fn flush_is_acknowledged_once_idle() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.start();
    harness.send(&["x", "y"]);
    let (ack, acked) = bounded(1);
    harness.control.send(Control::Flush(ack)).expect("control open");
    acked
        .recv_timeout(Duration::from_secs(5))
        .expect("flush acknowledged");
    assert_eq!(harness.probe.lines(), vec!["x", "y"]);
    harness.close(None);
}

#[rstest]
fn dropping_the_producer_side_stops_the_worker() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.start();
    harness.send(&["only"]);
    wait_until(|| harness.probe.lines().len() == 1);
    let (closed_tx, _) = bounded::<LogEvent>(1);
    drop(std::mem::replace(&mut harness.events, closed_tx));
    let finished = harness.done.recv_timeout(Duration::from_secs(5));
    assert!(!matches!(
        finished,
        Err(crossbeam_channel::RecvTimeoutError::Timeout)
    ));
}

#[rstest]
fn earliest_shutdown_deadline_wins() {
    let now = Instant::now();
    let later = now + Duration::from_secs(1);
    assert_eq!(
        Shutdown::Until(later).merge(Shutdown::Until(now)),
        Shutdown::Until(now)
    );
    assert_eq!(
        Shutdown::Drain.merge(Shutdown::Until(later)),
        Shutdown::Until(later)
    );
    assert_eq!(Shutdown::Drain.merge(Shutdown::Drain), Shutdown::Drain);
}

#[rstest]
fn spill_during_delivery_stays_behind_the_live_entry() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.send(&["A"]);
    let mut appender = harness.appender.take().expect("not started");
    let live = appender.next_entry().expect("live entry");
    // Spilled by a producer after A left the queue, so it is newer.
    harness.store.put("B").expect("spill");
    appender.deliver(live);
    let replay = appender.next_entry().expect("stored entry");
    appender.deliver(replay);
    assert_eq!(harness.probe.lines(), vec!["A", "B"]);
    assert!(harness.stored().is_empty());
}

#[rstest]
fn failure_threshold_counts_the_first_attempt() {
    let mut harness = Harness::new(3, Duration::from_millis(1));
    harness.probe.fail_next_writes(10);
    harness.send(&["x"]);
    let mut appender = harness.appender.take().expect("not started");
    let live = appender.next_entry().expect("live entry");
    appender.deliver(live);
    assert_eq!(harness.probe.write_attempts(), 3);
    assert!(harness.probe.lines().is_empty());
    assert_eq!(harness.stored(), vec!["x"]);
}
