//! Common test utilities for integration tests.

use actlog_core::Store;
use actlog_server::config::Config;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Load a hook event fixture as the raw stdin a hook process would receive.
pub fn load_hook_fixture(name: &str) -> String {
    let fixture_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("hook_events")
        .join(format!("{}.json", name));

    std::fs::read_to_string(&fixture_path)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {}", fixture_path.display(), e))
}

/// Config rooted in a fresh temp dir, with fast loops.
pub fn test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::for_data_dir(temp_dir.path());
    config.drain_interval_secs = 1;
    config.flush_interval_secs = 1;
    (config, temp_dir)
}

/// Poll `store` until it holds `count` transactions or `timeout` passes.
pub async fn wait_for_transactions(store: &Store, count: u64, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if store.stats().map(|s| s.transaction_count).unwrap_or(0) >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
