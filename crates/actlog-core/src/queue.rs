//! Producer side of the ingestion pipeline: per-kind append-only queue files.
//!
//! Each call appends exactly one JSON line with a single `write`. Producers
//! hold a shared lock while appending and re-check that the descriptor still
//! names the live queue file, so a concurrent claim by the consumer (rename to
//! `<kind>.draining`) never swallows a line.

use crate::fsutil::{self, lock};
use crate::{ActlogError, Result};
use actlog_types::{QueueEntry, QueueKind};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Largest line a producer writes, newline included.
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 4096;

/// Queue size beyond which appends are refused.
pub const DEFAULT_MAX_QUEUE_BYTES: u64 = 16 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "…[truncated]";
const MAX_OPEN_ATTEMPTS: usize = 3;

pub fn queue_path(dir: &Path, kind: QueueKind) -> PathBuf {
    dir.join(kind.file_name())
}

pub fn claim_path(dir: &Path, kind: QueueKind) -> PathBuf {
    dir.join(kind.claim_file_name())
}

#[derive(Debug, Clone)]
pub struct QueueWriter {
    dir: PathBuf,
    max_entry_bytes: usize,
    max_queue_bytes: u64,
}

impl QueueWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
        }
    }

    pub fn with_limits(mut self, max_entry_bytes: usize, max_queue_bytes: u64) -> Self {
        self.max_entry_bytes = max_entry_bytes;
        self.max_queue_bytes = max_queue_bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Wrap `payload` in a fresh envelope and append it.
    pub fn append(&self, kind: QueueKind, payload: Value) -> Result<QueueEntry> {
        self.append_entry(QueueEntry::new(kind, payload))
    }

    /// Append a prepared envelope. Returns it as written (possibly truncated).
    pub fn append_entry(&self, mut entry: QueueEntry) -> Result<QueueEntry> {
        let line = self.encode(&mut entry)?;

        fs::create_dir_all(&self.dir).map_err(|e| ActlogError::write_failure(&self.dir, e))?;
        let path = queue_path(&self.dir, entry.kind);
        let file = open_live(&path)?;

        let size = file
            .metadata()
            .map_err(|e| ActlogError::write_failure(&path, e))?
            .len();
        if size >= self.max_queue_bytes {
            return Err(ActlogError::QueueFull {
                path,
                size,
                limit: self.max_queue_bytes,
            });
        }

        let written = (&file)
            .write(line.as_bytes())
            .map_err(|e| ActlogError::write_failure(&path, e))?;
        if written != line.len() {
            return Err(ActlogError::write_failure(
                &path,
                format!("short write: {} of {} bytes", written, line.len()),
            ));
        }
        file.sync_data()
            .map_err(|e| ActlogError::write_failure(&path, e))?;

        debug!(target: "actlog::queue", "Appended {} bytes to {}", written, path.display());
        Ok(entry)
    }

    /// Serialize `entry` as one newline-terminated line within the size limit.
    fn encode(&self, entry: &mut QueueEntry) -> Result<String> {
        let mut line = serde_json::to_string(entry)?;
        let original = line.len() + 1;

        while line.len() + 1 > self.max_entry_bytes {
            let excess = line.len() + 1 - self.max_entry_bytes;
            if !truncate_longest_string(&mut entry.payload, excess) {
                return Err(ActlogError::EntryTooLarge {
                    size: original,
                    limit: self.max_entry_bytes,
                });
            }
            line = serde_json::to_string(entry)?;
        }

        if line.len() + 1 < original {
            warn!(target: "actlog::queue", "Truncated {} entry from {} to {} bytes",
                entry.kind, original, line.len() + 1);
        }
        line.push('\n');
        Ok(line)
    }
}

/// Open the queue for appending, retrying when a claim renamed it underneath us.
fn open_live(path: &Path) -> Result<File> {
    for attempt in 1..=MAX_OPEN_ATTEMPTS {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ActlogError::write_failure(path, e))?;
        lock::shared(&file).map_err(|e| ActlogError::write_failure(path, e))?;

        if fsutil::is_same_file(&file, path).map_err(|e| ActlogError::write_failure(path, e))? {
            return Ok(file);
        }
        debug!(target: "actlog::queue", "Queue {} was claimed while opening (attempt {})",
            path.display(), attempt);
    }
    Err(ActlogError::write_failure(path, "queue file kept moving during open"))
}

/// Cut the longest string leaf of `value` by at least `excess` bytes.
///
/// Returns `false` when no string can get any shorter.
fn truncate_longest_string(value: &mut Value, excess: usize) -> bool {
    let Some(longest) = longest_string(value) else {
        return false;
    };

    let mut cut = longest.len().saturating_sub(excess + TRUNCATION_MARKER.len());
    while !longest.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut + TRUNCATION_MARKER.len() >= longest.len() {
        return false;
    }

    longest.truncate(cut);
    longest.push_str(TRUNCATION_MARKER);
    true
}

fn longest_string(value: &mut Value) -> Option<&mut String> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(items) => items
            .iter_mut()
            .filter_map(longest_string)
            .max_by_key(|s| s.len()),
        Value::Object(map) => map
            .values_mut()
            .filter_map(longest_string)
            .max_by_key(|s| s.len()),
        _ => None,
    }
}

/// One well-formed line of a queue file.
#[derive(Debug, Clone)]
pub struct QueueLine {
    /// 1-based line number within the file.
    pub line_no: usize,
    pub raw: String,
    pub entry: QueueEntry,
}

/// A queue file split into usable entries and skipped lines.
#[derive(Debug, Default)]
pub struct ParsedQueue {
    pub entries: Vec<QueueLine>,
    /// Always `ActlogError::ParseSkip`.
    pub skipped: Vec<ActlogError>,
}

/// Parse queue content line by line. Bad lines never affect their neighbours.
///
/// An unterminated last line is treated as partial and skipped.
pub fn parse_lines(content: &[u8]) -> ParsedQueue {
    let mut parsed = ParsedQueue::default();
    let complete = content.ends_with(b"\n");
    let segments: Vec<&[u8]> = content.split(|b| *b == b'\n').collect();
    let last = segments.len().saturating_sub(1);

    for (idx, segment) in segments.into_iter().enumerate() {
        let line_no = idx + 1;
        if segment.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let skip = |reason: String| ActlogError::ParseSkip { line: line_no, reason };

        if idx == last && !complete {
            parsed.skipped.push(skip("partial trailing line".to_string()));
            continue;
        }
        let raw = match std::str::from_utf8(segment) {
            Ok(raw) => raw.trim_end_matches('\r'),
            Err(e) => {
                parsed.skipped.push(skip(format!("invalid UTF-8: {}", e)));
                continue;
            }
        };
        match serde_json::from_str::<QueueEntry>(raw) {
            Ok(entry) => parsed.entries.push(QueueLine {
                line_no,
                raw: raw.to_string(),
                entry,
            }),
            Err(e) => parsed.skipped.push(skip(e.to_string())),
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_creates_dir_and_lines() {
        let dir = TempDir::new().unwrap();
        let queue_dir = dir.path().join("queue");
        let writer = QueueWriter::new(&queue_dir);

        writer.append(QueueKind::Transactions, json!({"prompt": "one"})).unwrap();
        writer.append(QueueKind::Transactions, json!({"prompt": "two"})).unwrap();
        writer.append(QueueKind::Hooks, json!({"name": "lint"})).unwrap();

        let content = fs::read(queue_path(&queue_dir, QueueKind::Transactions)).unwrap();
        let parsed = parse_lines(&content);
        assert!(parsed.skipped.is_empty());
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[1].entry.payload["prompt"], "two");
        assert!(queue_path(&queue_dir, QueueKind::Hooks).exists());
    }

    #[test]
    fn test_oversized_payload_is_truncated() {
        let dir = TempDir::new().unwrap();
        let writer = QueueWriter::new(dir.path()).with_limits(512, DEFAULT_MAX_QUEUE_BYTES);

        let entry = writer
            .append(
                QueueKind::Transactions,
                json!({"prompt": "short", "result": {"output": "x".repeat(5000)}}),
            )
            .unwrap();

        let output = entry.payload["result"]["output"].as_str().unwrap();
        assert!(output.ends_with(TRUNCATION_MARKER));
        assert_eq!(entry.payload["prompt"], "short");

        let content = fs::read(queue_path(dir.path(), QueueKind::Transactions)).unwrap();
        assert!(content.len() <= 512);
        assert_eq!(parse_lines(&content).entries.len(), 1);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let dir = TempDir::new().unwrap();
        let writer = QueueWriter::new(dir.path()).with_limits(400, DEFAULT_MAX_QUEUE_BYTES);
        let entry = writer
            .append(QueueKind::Transactions, json!({"prompt": "é".repeat(1000)}))
            .unwrap();
        assert!(entry.payload["prompt"].as_str().unwrap().ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_entry_too_large_without_strings() {
        let dir = TempDir::new().unwrap();
        let writer = QueueWriter::new(dir.path()).with_limits(200, DEFAULT_MAX_QUEUE_BYTES);
        let numbers: Vec<u64> = (0..500).collect();

        let err = writer.append(QueueKind::Transactions, json!({"n": numbers})).unwrap_err();
        assert!(matches!(err, ActlogError::EntryTooLarge { limit: 200, .. }));
        assert!(!queue_path(dir.path(), QueueKind::Transactions).exists());
    }

    #[test]
    fn test_full_queue_refuses_append() {
        let dir = TempDir::new().unwrap();
        let writer = QueueWriter::new(dir.path()).with_limits(DEFAULT_MAX_ENTRY_BYTES, 64);

        writer.append(QueueKind::Hooks, json!({"name": "first"})).unwrap();
        let err = writer.append(QueueKind::Hooks, json!({"name": "second"})).unwrap_err();
        assert!(matches!(err, ActlogError::QueueFull { limit: 64, .. }));
    }

    #[test]
    fn test_append_after_claim_goes_to_fresh_file() {
        let dir = TempDir::new().unwrap();
        let writer = QueueWriter::new(dir.path());
        writer.append(QueueKind::Transactions, json!({"prompt": "before"})).unwrap();

        fs::rename(
            queue_path(dir.path(), QueueKind::Transactions),
            claim_path(dir.path(), QueueKind::Transactions),
        )
        .unwrap();
        writer.append(QueueKind::Transactions, json!({"prompt": "after"})).unwrap();

        let claimed = parse_lines(&fs::read(claim_path(dir.path(), QueueKind::Transactions)).unwrap());
        let live = parse_lines(&fs::read(queue_path(dir.path(), QueueKind::Transactions)).unwrap());
        assert_eq!(claimed.entries.len(), 1);
        assert_eq!(live.entries.len(), 1);
        assert_eq!(live.entries[0].entry.payload["prompt"], "after");
    }

    #[test]
    fn test_parse_skips_bad_and_partial_lines() {
        let good = serde_json::to_string(&QueueEntry::new(QueueKind::Transactions, json!({"prompt": "a"}))).unwrap();
        let content = format!("{good}\n{{not json\n\n{good}\n{{\"kind\":\"transac");

        let parsed = parse_lines(content.as_bytes());
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[1].line_no, 4);
        assert_eq!(parsed.skipped.len(), 2);
        assert!(matches!(parsed.skipped[0], ActlogError::ParseSkip { line: 2, .. }));
        assert!(matches!(parsed.skipped[1], ActlogError::ParseSkip { line: 5, .. }));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8_line_only() {
        let good = serde_json::to_string(&QueueEntry::new(QueueKind::Hooks, json!({"name": "h"}))).unwrap();
        let mut content = vec![0xff, 0xfe, b'\n'];
        content.extend_from_slice(good.as_bytes());
        content.push(b'\n');

        let parsed = parse_lines(&content);
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.skipped.len(), 1);
    }

    proptest! {
        #[test]
        fn parse_never_panics_on_garbage(content in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let parsed = parse_lines(&content);
            let lines = content.split(|b| *b == b'\n').count();
            prop_assert!(parsed.entries.len() + parsed.skipped.len() <= lines);
        }

        #[test]
        fn good_lines_survive_interleaved_garbage(garbage in "[^\n]{1,64}", n in 1usize..8) {
            let good = serde_json::to_string(&QueueEntry::new(QueueKind::Transactions, json!({"prompt": "p"}))).unwrap();
            let mut content = String::new();
            for _ in 0..n {
                content.push_str(&good);
                content.push('\n');
                content.push_str(&garbage);
                content.push('\n');
            }
            let parsed = parse_lines(content.as_bytes());
            let garbage_lines = if garbage.bytes().all(|b| b.is_ascii_whitespace()) { 0 } else { n };
            prop_assert!(parsed.entries.len() >= n);
            prop_assert_eq!(parsed.entries.len() + parsed.skipped.len(), n + garbage_lines);
        }
    }
}
