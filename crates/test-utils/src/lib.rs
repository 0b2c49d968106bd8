pub mod builders;
pub mod fake_executor;

use std::sync::{Arc, Once};

use latticed::data::{DataManager, MemoryStore};
use latticed::engine::{Dispatcher, DispatcherSettings};
use latticed::exec::ExecutorRegistry;
use latticed::types::StoreMode;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Dispatcher over a fresh in-memory store.
pub fn memory_dispatcher(executors: ExecutorRegistry, mode: StoreMode) -> Dispatcher {
    let data = Arc::new(DataManager::new(Arc::new(MemoryStore::new()), mode));
    Dispatcher::new(data, executors, DispatcherSettings::default())
}
