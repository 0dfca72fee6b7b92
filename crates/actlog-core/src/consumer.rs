//! Consumer side of the ingestion pipeline.
//!
//! A drain claims each queue by renaming `<kind>.jsonl` to `<kind>.draining`,
//! waits out in-flight producers with an exclusive lock, ingests every line,
//! flushes the store and only then deletes the claim. A claim left by a crash
//! is replayed first on the next drain; ids are deterministic per line, so the
//! replay is idempotent.

use crate::fsutil::lock;
use crate::queue::{claim_path, parse_lines, queue_path, QueueLine};
use crate::store::Store;
use crate::Result;
use actlog_types::{DraftFallbacks, Hook, QueueEntry, QueueKind, Transaction, TransactionDraft};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of draining one queue kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub kind: QueueKind,
    /// Non-blank lines seen, including skipped ones.
    pub read: usize,
    pub inserted: usize,
    /// Entries whose id (or hook name) was already stored.
    pub duplicates: usize,
    /// Lines that did not parse as an envelope.
    pub skipped: usize,
    /// Envelopes whose payload could not be turned into a record.
    pub failed: usize,
}

impl DrainReport {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            read: 0,
            inserted: 0,
            duplicates: 0,
            skipped: 0,
            failed: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read == 0
    }
}

pub struct Consumer {
    store: Arc<Store>,
    queue_dir: PathBuf,
    platform: String,
}

impl Consumer {
    pub fn new(store: Arc<Store>, queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            queue_dir: queue_dir.into(),
            platform: std::env::consts::OS.to_string(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    /// Drain every queue kind.
    ///
    /// A failing kind does not stop the others; the first error is returned
    /// after all kinds were attempted.
    pub fn drain(&self) -> Result<Vec<DrainReport>> {
        let mut reports = Vec::with_capacity(QueueKind::ALL.len());
        let mut first_error = None;

        for kind in QueueKind::ALL {
            match self.drain_kind(kind) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(target: "actlog::consumer", "Draining {} queue failed: {}", kind, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Replay a leftover claim, then claim and ingest the live queue.
    pub fn drain_kind(&self, kind: QueueKind) -> Result<DrainReport> {
        let mut report = DrainReport::new(kind);
        let claim = claim_path(&self.queue_dir, kind);

        if claim.exists() {
            info!(target: "actlog::consumer", "Replaying leftover claim {}", claim.display());
            self.ingest_claim(kind, &claim, &mut report)?;
        }

        match fs::rename(queue_path(&self.queue_dir, kind), &claim) {
            Ok(()) => self.ingest_claim(kind, &claim, &mut report)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !report.is_empty() {
            info!(
                target: "actlog::consumer",
                "Drained {} queue: {} read, {} inserted, {} duplicates, {} skipped, {} failed",
                kind, report.read, report.inserted, report.duplicates, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// Ingest a claimed file and delete it once every line was attempted and
    /// the store image holding them is on disk. A failed flush keeps the claim.
    fn ingest_claim(&self, kind: QueueKind, claim: &Path, report: &mut DrainReport) -> Result<()> {
        let mut file = File::open(claim)?;
        lock::exclusive(&file)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let parsed = parse_lines(&content);
        for skip in &parsed.skipped {
            warn!(target: "actlog::consumer", "{} in {}", skip, claim.display());
        }
        report.read += parsed.skipped.len();
        report.skipped += parsed.skipped.len();

        for line in &parsed.entries {
            report.read += 1;
            if line.entry.kind != kind {
                warn!(target: "actlog::consumer", "Skipped queue line {}: {} entry in {} queue",
                    line.line_no, line.entry.kind, kind);
                report.skipped += 1;
                continue;
            }
            self.ingest_line(line, report)?;
        }

        // The claim is the only durable copy until the image is on disk.
        if self.store.flush_if_dirty()? {
            debug!(target: "actlog::consumer", "Flushed store before releasing {}", claim.display());
        }
        fs::remove_file(claim)?;
        debug!(target: "actlog::consumer", "Removed claim {}", claim.display());
        Ok(())
    }

    /// Insert one entry. Bad payloads are counted; store errors abort the drain.
    fn ingest_line(&self, line: &QueueLine, report: &mut DrainReport) -> Result<()> {
        let inserted = match line.entry.kind {
            QueueKind::Transactions => match entry_to_transaction(&line.entry, &line.raw, &self.platform) {
                Ok(tx) => self.store.put_transaction(&tx, None)?,
                Err(reason) => {
                    reject(line, reason, report);
                    return Ok(());
                }
            },
            QueueKind::Hooks => match entry_to_hook(&line.entry, &line.raw) {
                Ok(hook) => self.store.put_hook(&hook)?,
                Err(reason) => {
                    reject(line, reason, report);
                    return Ok(());
                }
            },
        };

        if inserted {
            report.inserted += 1;
        } else {
            report.duplicates += 1;
        }
        Ok(())
    }
}

fn reject(line: &QueueLine, reason: String, report: &mut DrainReport) {
    warn!(target: "actlog::consumer", "Rejected {} entry on line {}: {}",
        line.entry.kind, line.line_no, reason);
    report.failed += 1;
}

/// Record id for an entry whose payload carries none: the producer's dedup
/// token, else a digest of the raw line. Both are stable under replay.
pub fn fallback_id(entry: &QueueEntry, raw_line: &str) -> String {
    match entry.dedup_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => format!("{:x}", Sha256::digest(raw_line.as_bytes())),
    }
}

/// Canonicalize a transaction entry.
pub fn entry_to_transaction(
    entry: &QueueEntry,
    raw_line: &str,
    platform: &str,
) -> std::result::Result<Transaction, String> {
    let draft: TransactionDraft =
        serde_json::from_value(entry.payload.clone()).map_err(|e| e.to_string())?;

    let timestamp = if entry.enqueued_at > 0 {
        entry.enqueued_at
    } else {
        actlog_types::now_ms()
    };

    Ok(draft.finalize(DraftFallbacks {
        id: fallback_id(entry, raw_line),
        timestamp,
        platform: platform.to_string(),
    }))
}

/// Canonicalize a hook entry, assigning an id when the payload has none.
pub fn entry_to_hook(entry: &QueueEntry, raw_line: &str) -> std::result::Result<Hook, String> {
    let mut hook: Hook = serde_json::from_value(entry.payload.clone()).map_err(|e| e.to_string())?;
    if hook.name.trim().is_empty() {
        return Err("hook has an empty name".to_string());
    }
    if hook.id.trim().is_empty() {
        hook.id = fallback_id(entry, raw_line);
    }
    Ok(hook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueWriter;
    use serde_json::json;
    use std::sync::Barrier;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<Store>,
        writer: QueueWriter,
        consumer: Consumer,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("actlog.db")).unwrap());
        let queue_dir = dir.path().join("queue");
        Fixture {
            writer: QueueWriter::new(&queue_dir),
            consumer: Consumer::new(store.clone(), &queue_dir),
            store,
            _dir: dir,
        }
    }

    fn tx_report(reports: &[DrainReport]) -> &DrainReport {
        reports.iter().find(|r| r.kind == QueueKind::Transactions).unwrap()
    }

    #[test]
    fn test_fix_bug_entry_gets_id_and_timestamp() {
        let f = fixture();
        let before = actlog_types::now_ms();
        f.writer
            .append(QueueKind::Transactions, json!({"prompt": "fix bug", "result": {"success": true}}))
            .unwrap();

        let reports = f.consumer.drain().unwrap();
        assert_eq!(tx_report(&reports).inserted, 1);

        let found = f.store.search_text("fix bug", 10).unwrap();
        assert_eq!(found.len(), 1);
        let tx = &found[0];
        assert!(!tx.id.is_empty());
        assert!(tx.timestamp >= before && tx.timestamp <= actlog_types::now_ms());
        assert!(tx.result.success);
        assert!(!queue_path(f.consumer.queue_dir(), QueueKind::Transactions).exists());
        assert!(!claim_path(f.consumer.queue_dir(), QueueKind::Transactions).exists());
    }

    #[test]
    fn test_poison_line_between_good_lines() {
        let f = fixture();
        f.writer.append(QueueKind::Transactions, json!({"prompt": "first"})).unwrap();
        let path = queue_path(f.consumer.queue_dir(), QueueKind::Transactions);
        let mut content = fs::read(&path).unwrap();
        content.extend_from_slice(b"{\"kind\": oops\n");
        fs::write(&path, content).unwrap();
        f.writer.append(QueueKind::Transactions, json!({"prompt": "second"})).unwrap();

        let report = f.consumer.drain_kind(QueueKind::Transactions).unwrap();
        assert_eq!(report.read, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(f.store.stats().unwrap().transaction_count, 2);
    }

    #[test]
    fn test_unconvertible_payload_counts_as_failed() {
        let f = fixture();
        f.writer.append(QueueKind::Transactions, json!({"prompt": 42})).unwrap();
        f.writer.append(QueueKind::Hooks, json!({"description": "no name"})).unwrap();

        let reports = f.consumer.drain().unwrap();
        assert!(reports.iter().all(|r| r.failed == 1 && r.inserted == 0));
        assert!(!claim_path(f.consumer.queue_dir(), QueueKind::Hooks).exists());
    }

    #[test]
    fn test_hooks_queue_assigns_ids() {
        let f = fixture();
        f.writer
            .append(QueueKind::Hooks, json!({"name": "lint", "triggers": ["PreToolUse"]}))
            .unwrap();
        f.writer.append(QueueKind::Hooks, json!({"name": "lint"})).unwrap();

        let report = f.consumer.drain_kind(QueueKind::Hooks).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);

        let hook = f.store.get_hook_by_name("lint").unwrap().unwrap();
        assert!(!hook.id.is_empty());
        assert!(hook.fires_on(actlog_types::HookPhase::PreToolUse));
    }

    #[test]
    fn test_entry_of_wrong_kind_is_skipped() {
        let f = fixture();
        let stray = QueueEntry::new(QueueKind::Hooks, json!({"name": "stray"}));
        fs::create_dir_all(f.consumer.queue_dir()).unwrap();
        fs::write(
            queue_path(f.consumer.queue_dir(), QueueKind::Transactions),
            format!("{}\n", serde_json::to_string(&stray).unwrap()),
        )
        .unwrap();

        let report = f.consumer.drain_kind(QueueKind::Transactions).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.store.stats().unwrap().hook_count, 0);
    }

    #[test]
    fn test_concurrent_producers() {
        let f = fixture();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["from producer a", "from producer b"]
            .into_iter()
            .map(|prompt| {
                let writer = f.writer.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    writer.append(QueueKind::Transactions, json!({"prompt": prompt})).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = f.consumer.drain_kind(QueueKind::Transactions).unwrap();
        assert_eq!(report.inserted, 2);

        let found = f.store.search_text("from producer", 10).unwrap();
        let mut prompts: Vec<&str> = found.iter().map(|t| t.prompt.raw.as_str()).collect();
        prompts.sort();
        assert_eq!(prompts, vec!["from producer a", "from producer b"]);
        assert_ne!(found[0].id, found[1].id);
    }

    #[test]
    fn test_crash_before_claim_deletion_replays_exactly_once() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("actlog.db");
        let queue_dir = dir.path().join("queue");
        let writer = QueueWriter::new(&queue_dir);
        for i in 0..5 {
            writer.append(QueueKind::Transactions, json!({"prompt": format!("entry {}", i)})).unwrap();
        }

        // First run: claim, insert two entries, flush, then die before deleting the claim.
        {
            let store = Arc::new(Store::open(&db).unwrap());
            let consumer = Consumer::new(store.clone(), &queue_dir);
            let claim = claim_path(&queue_dir, QueueKind::Transactions);
            fs::rename(queue_path(&queue_dir, QueueKind::Transactions), &claim).unwrap();

            let parsed = parse_lines(&fs::read(&claim).unwrap());
            let mut report = DrainReport::new(QueueKind::Transactions);
            for line in parsed.entries.iter().take(2) {
                consumer.ingest_line(line, &mut report).unwrap();
            }
            store.close().unwrap();
        }

        // A producer keeps going while the server is down.
        writer.append(QueueKind::Transactions, json!({"prompt": "entry 5"})).unwrap();

        let store = Arc::new(Store::open(&db).unwrap());
        let consumer = Consumer::new(store.clone(), &queue_dir);
        let report = consumer.drain_kind(QueueKind::Transactions).unwrap();

        assert_eq!(report.inserted, 4);
        assert_eq!(report.duplicates, 2);
        assert_eq!(store.stats().unwrap().transaction_count, 6);
        assert!(!claim_path(&queue_dir, QueueKind::Transactions).exists());
    }

    #[test]
    fn test_drained_records_survive_a_kill_before_the_flush_tick() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("actlog.db");
        let queue_dir = dir.path().join("queue");
        let writer = QueueWriter::new(&queue_dir);
        for i in 0..3 {
            writer.append(QueueKind::Transactions, json!({"prompt": format!("kill {}", i)})).unwrap();
        }

        let store = Arc::new(Store::open(&db).unwrap());
        let consumer = Consumer::new(store.clone(), &queue_dir);
        let report = consumer.drain_kind(QueueKind::Transactions).unwrap();
        assert_eq!(report.inserted, 3);
        assert!(!claim_path(&queue_dir, QueueKind::Transactions).exists());
        assert!(!store.is_dirty());

        // No close, no Drop: the process is gone.
        drop(consumer);
        std::mem::forget(store);

        let snapshot = Store::open_snapshot(&db).unwrap();
        assert_eq!(snapshot.stats().unwrap().transaction_count, 3);
    }

    #[test]
    fn test_failed_flush_keeps_the_claim() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("data").join("actlog.db");
        std::fs::create_dir_all(db.parent().unwrap()).unwrap();
        let queue_dir = dir.path().join("queue");
        QueueWriter::new(&queue_dir)
            .append(QueueKind::Transactions, json!({"prompt": "keep me"}))
            .unwrap();

        let store = Arc::new(Store::open(&db).unwrap());
        std::fs::remove_dir_all(db.parent().unwrap()).unwrap();
        let consumer = Consumer::new(store.clone(), &queue_dir);

        assert!(consumer.drain_kind(QueueKind::Transactions).is_err());
        assert!(claim_path(&queue_dir, QueueKind::Transactions).exists());
        assert!(store.is_dirty());
    }

    #[test]
    fn test_drain_without_queue_dir_is_empty() {
        let f = fixture();
        let reports = f.consumer.drain().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(DrainReport::is_empty));
    }

    #[test]
    fn test_fallback_id_prefers_token_then_digest() {
        let mut entry = QueueEntry::new(QueueKind::Transactions, json!({}));
        entry.dedup_token = Some("token-1".to_string());
        assert_eq!(fallback_id(&entry, "line"), "token-1");

        entry.dedup_token = None;
        let a = fallback_id(&entry, "line");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fallback_id(&entry, "line"));
        assert_ne!(a, fallback_id(&entry, "other line"));
    }

    #[test]
    fn test_payload_id_and_timestamp_win() {
        let mut entry = QueueEntry::new(
            QueueKind::Transactions,
            json!({"id": "given", "timestamp": 7, "prompt": "p"}),
        );
        entry.enqueued_at = 99;
        let tx = entry_to_transaction(&entry, "raw", "linux").unwrap();
        assert_eq!(tx.id, "given");
        assert_eq!(tx.timestamp, 7);

        let entry = QueueEntry::new(QueueKind::Transactions, json!({"prompt": "p"}));
        let tx = entry_to_transaction(&entry, "raw", "linux").unwrap();
        assert_eq!(tx.timestamp, entry.enqueued_at);
        assert_eq!(Some(tx.id), entry.dedup_token);
    }
}
