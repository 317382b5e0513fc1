//! Tracing setup for tests
//!
//! Output goes through the test writer so it is captured per test and only
//! shown for failures. Filtering follows `RUST_LOG`, defaulting to `warn`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a test subscriber; later calls are no-ops
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .try_init();
}
