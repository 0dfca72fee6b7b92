//! The long-lived ingest service: interval drain and flush loops, signal
//! handling, and the exactly-once shutdown drain.

use actlog_core::{Consumer, DrainReport, Store};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of the final drain and close.
#[derive(Debug, Clone, Default)]
pub struct ShutdownOutcome {
    pub inserted: usize,
    pub drain_error: Option<String>,
    pub close_error: Option<String>,
}

impl ShutdownOutcome {
    /// Non-zero when the final flush did not reach disk.
    pub fn exit_code(&self) -> i32 {
        if self.close_error.is_some() { 1 } else { 0 }
    }
}

/// Runs the final drain and store close exactly once per process.
pub struct Shutdown {
    consumer: Arc<Consumer>,
    done: AtomicBool,
}

impl Shutdown {
    pub fn new(consumer: Arc<Consumer>) -> Self {
        Self {
            consumer,
            done: AtomicBool::new(false),
        }
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Drain every queue, then flush and close the store.
    ///
    /// Only the first call does anything; later calls return `None`.
    /// Failures are logged and reported, never raised.
    pub fn run(&self) -> Option<ShutdownOutcome> {
        if self.done.swap(true, Ordering::AcqRel) {
            debug!(target: "actlog::shutdown", "Shutdown already ran");
            return None;
        }

        info!(target: "actlog::shutdown", "Running final drain");
        let mut outcome = ShutdownOutcome::default();

        match self.consumer.drain() {
            Ok(reports) => outcome.inserted = reports.iter().map(|r| r.inserted).sum(),
            Err(e) => {
                error!(target: "actlog::shutdown", "Final drain failed, entries stay queued: {}", e);
                outcome.drain_error = Some(e.to_string());
            }
        }

        match self.consumer.store().close() {
            Ok(()) => info!(target: "actlog::shutdown",
                "Shutdown complete ({} records ingested in final drain)", outcome.inserted),
            Err(e) => {
                error!(target: "actlog::shutdown", "FINAL FLUSH FAILED, unflushed records are lost: {}", e);
                outcome.close_error = Some(e.to_string());
            }
        }

        Some(outcome)
    }
}

/// Runs [`Shutdown::run`] when dropped, covering early returns and panics in
/// `main`.
pub struct ShutdownGuard(pub Arc<Shutdown>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.0.run().is_some() {
            warn!(target: "actlog::shutdown", "Shutdown ran from the exit guard");
        }
    }
}

/// Resolves on the first termination signal and names it.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    })
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

pub struct Service {
    consumer: Arc<Consumer>,
    shutdown: Arc<Shutdown>,
    drain_interval: Duration,
    flush_interval: Duration,
}

impl Service {
    pub fn new(store: Arc<Store>, queue_dir: impl Into<std::path::PathBuf>) -> Self {
        let consumer = Arc::new(Consumer::new(store, queue_dir));
        Self {
            shutdown: Arc::new(Shutdown::new(consumer.clone())),
            consumer,
            drain_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(10),
        }
    }

    pub fn with_intervals(mut self, drain: Duration, flush: Duration) -> Self {
        self.drain_interval = drain;
        self.flush_interval = flush;
        self
    }

    pub fn shutdown(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// Run both loops until `stop` resolves, then shut down.
    ///
    /// Returns `None` when the shutdown already ran elsewhere.
    pub async fn run_until<F>(self, stop: F) -> Option<ShutdownOutcome>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, _) = broadcast::channel(1);
        let drain = spawn_drain_loop(self.consumer.clone(), self.drain_interval, stop_tx.subscribe());
        let flush = spawn_flush_loop(self.consumer.store().clone(), self.flush_interval, stop_tx.subscribe());
        info!(target: "actlog::startup", "Draining every {:?}, flushing every {:?}",
            self.drain_interval, self.flush_interval);

        stop.await;

        let _ = stop_tx.send(());
        for handle in [drain, flush] {
            if let Err(e) = handle.await {
                error!(target: "actlog::shutdown", "Background loop ended abnormally: {}", e);
            }
        }

        let shutdown = self.shutdown.clone();
        match tokio::task::spawn_blocking(move || shutdown.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(target: "actlog::shutdown", "Shutdown task failed: {}", e);
                None
            }
        }
    }
}

fn spawn_drain_loop(
    consumer: Arc<Consumer>,
    every: Duration,
    mut stop: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => {
                    let consumer = consumer.clone();
                    match tokio::task::spawn_blocking(move || consumer.drain()).await {
                        Ok(Ok(reports)) => log_drain(&reports),
                        Ok(Err(e)) => warn!(target: "actlog::consumer", "Drain failed, retrying next tick: {}", e),
                        Err(e) => error!(target: "actlog::consumer", "Drain task failed: {}", e),
                    }
                }
            }
        }
        debug!(target: "actlog::consumer", "Drain loop stopped");
    })
}

fn spawn_flush_loop(
    store: Arc<Store>,
    every: Duration,
    mut stop: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is dirty yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => {
                    let store = store.clone();
                    match tokio::task::spawn_blocking(move || store.flush_if_dirty()).await {
                        Ok(Ok(true)) => debug!(target: "actlog::store", "Periodic flush done"),
                        Ok(Ok(false)) => {}
                        Ok(Err(e)) => error!(target: "actlog::store", "Periodic flush failed, retrying next tick: {}", e),
                        Err(e) => error!(target: "actlog::store", "Flush task failed: {}", e),
                    }
                }
            }
        }
        debug!(target: "actlog::store", "Flush loop stopped");
    })
}

fn log_drain(reports: &[DrainReport]) {
    let inserted: usize = reports.iter().map(|r| r.inserted).sum();
    if inserted > 0 {
        debug!(target: "actlog::consumer", "Drain tick ingested {} records", inserted);
    }
}
