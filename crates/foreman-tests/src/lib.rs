//! Foreman Integration Tests
//!
//! Scenario tests run a full master (scheduler, pool, in-process workers)
//! against the in-memory broker and need no external services.
//! Run with: `cargo test -p foreman-tests`
//!
//! For tests that require Redis:
//! ```sh
//! docker run -d -p 6379:6379 redis:7-alpine
//! cargo test -p foreman-tests -- --ignored
//! ```

pub mod common;
