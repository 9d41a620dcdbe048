pub mod builders;
pub mod recording;

use std::sync::Once;
use std::time::Duration;

use depengine::{Engine, NodeState};
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=depengine=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Poll the engine report until `name` reaches `state`.
pub async fn wait_for_state(engine: &Engine, name: &str, state: NodeState) {
    loop {
        let report = engine.report().await.expect("engine stopped while waiting");
        if report.get(name).map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the engine report until every node is `started`.
pub async fn wait_all_started(engine: &Engine) {
    loop {
        let report = engine.report().await.expect("engine stopped while waiting");
        if report.values().all(|s| s.state == NodeState::Started) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
