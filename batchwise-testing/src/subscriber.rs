//! Tracing setup for test binaries.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "batchwise=debug";

/// Install a test-friendly fmt subscriber once per process.
///
/// Honors `RUST_LOG`, falling back to debug output for the `batchwise`
/// crates. Later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_test_writer()
        .try_init();
}
