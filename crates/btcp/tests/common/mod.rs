//! Helpers shared by the integration tests.

use std::future::Future;
use std::time::Duration;

/// Upper bound for any single awaited operation in a test.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Install a test-writer subscriber once; `RUST_LOG=btcp=debug` shows the
/// socket and server logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Await `future`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("operation timed out")
}
