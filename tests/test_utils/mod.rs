//! Shared helpers for the integration tests.

pub mod fixtures;

pub use fixtures::{store_dir, test_builder, wait_until};
