//! One-shot commands that run against the store without the service loop.

use crate::config::Config;
use actlog_core::{Consumer, DrainReport, Store, StoreStats};
use actlog_types::Transaction;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Drain all queues into the store and close it.
///
/// Fails with `StoreLocked` while a server holds the store.
pub fn drain_once(config: &Config) -> Result<Vec<DrainReport>> {
    let path = config.db_path();
    let store = Arc::new(
        Store::open_with(&path, config.store_options())
            .with_context(|| format!("opening store {}", path.display()))?,
    );
    let consumer = Consumer::new(store.clone(), config.queue_dir());

    let drained = consumer.drain();
    // Close even when the drain failed; whatever was inserted must reach disk.
    store.close().context("final flush")?;
    Ok(drained?)
}

fn snapshot(config: &Config) -> Result<Store> {
    let path = config.db_path();
    Store::open_snapshot(&path).with_context(|| format!("reading store {}", path.display()))
}

pub fn stats(config: &Config) -> Result<StoreStats> {
    Ok(snapshot(config)?.stats()?)
}

pub fn search(config: &Config, query: &str, limit: usize) -> Result<Vec<Transaction>> {
    Ok(snapshot(config)?.search_text(query, limit)?)
}

/// Return the history matching `query` and mark the gate consulted.
///
/// The gate opens only after the search succeeded. Reads the last flushed
/// image, so the newest few seconds of activity may be missing.
pub fn consult(config: &Config, query: &str, limit: usize) -> Result<Vec<Transaction>> {
    let found = search(config, query, limit)?;
    config
        .gate()
        .mark_consulted(Some(query))
        .context("writing gate marker")?;
    Ok(found)
}
