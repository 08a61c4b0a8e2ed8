//! Tests for the producer-facing sink handle.

use std::{
    thread,
    time::{Duration, Instant},
};

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::transport::MemoryTransport;

#[fixture]
fn dir() -> TempDir {
    tempfile::tempdir().expect("create temp dir")
}

fn builder(dir: &TempDir) -> SinkBuilder {
    SinkBuilder::new()
        .with_token("test-token")
        .with_format(MessageFormat::Raw)
        .with_store_path(dir.path().join("overflow.log"))
        .with_poll_interval_ms(20)
        .with_backoff(
            BackoffOverrides::new()
                .with_base_ms(1)
                .with_cap_ms(4)
                .with_jitter_ms(0),
        )
}

/// Sink whose worker is parked retrying its first event.
fn stalled_sink(dir: &TempDir, capacity: usize, policy: QueueOverflowPolicy) -> ShippingSink {
    let probe = MemoryTransport::new();
    probe.set_offline(true);
    let sink = builder(dir)
        .with_queue_capacity(capacity)
        .with_overflow_policy(policy)
        .with_failure_threshold(1_000)
        .with_backoff(BackoffOverrides::new().with_base_ms(10_000).with_cap_ms(10_000))
        .build_with_transport(probe)
        .expect("build sink");
    sink.enqueue("m1");
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.queued() > 0 {
        assert!(Instant::now() < deadline, "worker never picked up m1");
        thread::sleep(Duration::from_millis(5));
    }
    sink
}

#[rstest]
fn delivers_and_closes(dir: TempDir) {
    let probe = MemoryTransport::new();
    let sink = builder(&dir)
        .build_with_transport(probe.clone())
        .expect("build sink");
    for i in 0..10 {
        assert_eq!(
            sink.publish(LogEvent::new(Severity::Info, format!("e{i}"))),
            Ok(Admission::Queued)
        );
    }
    sink.close(Duration::ZERO);
    let expected: Vec<String> = (0..10).map(|i| format!("e{i}")).collect();
    assert_eq!(probe.lines(), expected);
    assert!(!sink.overflow_store().has_records());
}

#[rstest]
fn publish_after_close_is_rejected(dir: TempDir) {
    let sink = builder(&dir)
        .build_with_transport(MemoryTransport::new())
        .expect("build sink");
    sink.close(Duration::ZERO);
    assert!(sink.is_closed());
    assert_eq!(
        sink.publish(LogEvent::new(Severity::Info, "late")),
        Err(PublishError::Closed)
    );
    assert!(!sink.flush());
}

#[rstest]
fn negative_close_timeout_is_rejected(dir: TempDir) {
    let sink = builder(&dir)
        .build_with_transport(MemoryTransport::new())
        .expect("build sink");
    assert!(matches!(
        sink.close_millis(-1),
        Err(BuildError::InvalidConfig(_))
    ));
    assert!(!sink.is_closed());
    sink.close_millis(0).expect("zero waits for drain");
    assert!(sink.is_closed());
}

#[rstest]
fn flush_waits_for_delivery(dir: TempDir) {
    let probe = MemoryTransport::new();
    let sink = builder(&dir)
        .build_with_transport(probe.clone())
        .expect("build sink");
    sink.enqueue("a");
    sink.enqueue("b");
    assert!(sink.flush());
    assert_eq!(probe.lines(), vec!["a", "b"]);
}

#[rstest]
fn host_tag_is_applied_to_untagged_events(dir: TempDir) {
    let probe = MemoryTransport::new();
    let sink = builder(&dir)
        .with_format(MessageFormat::Line)
        .with_host_tag("web-1")
        .build_with_transport(probe.clone())
        .expect("build sink");
    sink.log(Severity::Error, "boom");
    sink.publish(LogEvent::new(Severity::Info, "own").with_host_tag("db-2"))
        .expect("publish");
    sink.close(Duration::ZERO);
    let lines = probe.lines();
    assert!(lines[0].starts_with("Host=web-1 TraceID="), "{}", lines[0]);
    assert!(lines[0].ends_with(" ERROR boom"));
    assert!(lines[1].starts_with("Host=db-2 "));
}

#[rstest]
fn full_queue_evicts_oldest(dir: TempDir) {
    let sink = stalled_sink(&dir, 2, QueueOverflowPolicy::EvictOldest);
    assert_eq!(
        sink.publish(LogEvent::new(Severity::Info, "m2")),
        Ok(Admission::Queued)
    );
    assert_eq!(
        sink.publish(LogEvent::new(Severity::Info, "m3")),
        Ok(Admission::Queued)
    );
    assert_eq!(
        sink.publish(LogEvent::new(Severity::Info, "m4")),
        Ok(Admission::Overflowed { evicted: 1 })
    );
    sink.close(Duration::from_millis(50));
    assert_eq!(
        sink.overflow_store().drain_all(false).expect("read store"),
        vec!["m1", "m3", "m4"]
    );
}

#[rstest]
fn spill_policy_keeps_evicted_events(dir: TempDir) {
    let sink = stalled_sink(&dir, 2, QueueOverflowPolicy::SpillOldest);
    for message in ["m2", "m3", "m4"] {
        sink.enqueue(message);
    }
    sink.close(Duration::from_millis(50));
    let mut stored = sink.overflow_store().drain_all(false).expect("read store");
    stored.sort();
    assert_eq!(stored, vec!["m1", "m2", "m3", "m4"]);
}

#[rstest]
fn oversized_messages_are_chunked_before_queueing(dir: TempDir) {
    let probe = MemoryTransport::new();
    let sink = builder(&dir)
        .with_max_chunk_len(4)
        .build_with_transport(probe.clone())
        .expect("build sink");
    sink.enqueue("abcdefghij");
    sink.close(Duration::ZERO);
    assert_eq!(probe.lines(), vec!["abcd", "efgh", "ij"]);
}

#[rstest]
fn sink_is_shareable_across_threads() {
    static_assertions::assert_impl_all!(ShippingSink: Send, Sync);
}

#[rstest]
fn sinks_without_a_store_path_do_not_share_overflow() {
    let nonce = format!(
        "{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos()
    );
    let unpathed = |token: String| {
        SinkBuilder::new()
            .with_token(token)
            .with_format(MessageFormat::Raw)
            .with_poll_interval_ms(20)
            .with_failure_threshold(1)
            .with_backoff(BackoffOverrides::new().with_base_ms(1).with_cap_ms(4))
    };

    let offline = MemoryTransport::new();
    offline.set_offline(true);
    let first = unpathed(format!("first-{nonce}"))
        .build_with_transport(offline)
        .expect("build first sink");
    first.enqueue("secret-for-first");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !first.overflow_store().has_records() {
        assert!(Instant::now() < deadline, "first sink never spilled");
        thread::sleep(Duration::from_millis(5));
    }

    let probe = MemoryTransport::new();
    let second = unpathed(format!("second-{nonce}"))
        .build_with_transport(probe.clone())
        .expect("build second sink");
    second.enqueue("for-second");
    second.close(Duration::ZERO);
    first.close(Duration::ZERO);

    assert_ne!(first.overflow_store().path(), second.overflow_store().path());
    assert_eq!(probe.lines(), vec!["for-second"]);
    assert_eq!(
        first.overflow_store().drain_all(true).expect("drain first"),
        vec!["secret-for-first"]
    );
    second.overflow_store().drain_all(true).expect("drain second");
}
