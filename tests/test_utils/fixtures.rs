//! Fixtures building sinks over a temporary overflow store.
//!
//! Sinks built here poll quickly and back off for at most a few
//! milliseconds, so tests that script failures finish promptly.

use std::{
    thread,
    time::{Duration, Instant},
};

use lineship::{BackoffOverrides, MessageFormat, SinkBuilder};
use rstest::fixture;
use tempfile::TempDir;

/// Temporary directory holding the overflow store for one test.
#[fixture]
pub fn store_dir() -> TempDir {
    tempfile::tempdir().expect("create temp dir")
}

/// Builder writing raw messages and storing overflow under `dir`.
pub fn test_builder(dir: &TempDir) -> SinkBuilder {
    SinkBuilder::new()
        .with_token("integration-token")
        .with_format(MessageFormat::Raw)
        .with_store_path(dir.path().join("overflow.log"))
        .with_poll_interval_ms(20)
        .with_backoff(
            BackoffOverrides::new()
                .with_base_ms(1)
                .with_cap_ms(8)
                .with_jitter_ms(0),
        )
}

/// Poll `condition` until it holds, panicking after five seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
