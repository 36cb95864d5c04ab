//! Diagnostics for invalid markdown files.
//!
//! The diagnostics set is the *current* set of `.md` files that fail
//! validation or cannot be read — not an append-only log (that is the
//! separate error log). Entries live in memory for synchronous reads and
//! are persisted to a JSON file through a single-writer background queue,
//! so callers never wait for disk and writes never race.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ErrorDetail;

/// One invalid file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsEntry {
    /// Absolute path of the offending file
    pub file_path: PathBuf,
    /// Table whose directory contains it
    pub table_name: String,
    /// Plain filename within the table directory
    pub filename: String,
    /// What failed
    pub error: ErrorDetail,
    /// When the failure was first seen
    pub timestamp: DateTime<Utc>,
}

enum WriterMessage {
    Persist(String),
    Flush(oneshot::Sender<()>),
}

/// In-memory diagnostics map with persistent JSON mirror.
pub struct DiagnosticsManager {
    entries: Mutex<BTreeMap<String, DiagnosticsEntry>>,
    tx: Mutex<Option<mpsc::UnboundedSender<WriterMessage>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DiagnosticsManager {
    /// Open the diagnostics file, starting empty if it is absent or
    /// corrupt, and start the background writer.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries: BTreeMap<String, DiagnosticsEntry> =
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(entries) => entries,
                    Err(e) => {
                        log::warn!(
                            "diagnostics file '{}' is corrupt, starting empty: {e}",
                            path.display()
                        );
                        BTreeMap::new()
                    }
                },
                Err(_) => BTreeMap::new(),
            };

        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Persist(json) => {
                        if let Some(parent) = path.parent() {
                            let _ = tokio::fs::create_dir_all(parent).await;
                        }
                        if let Err(e) = tokio::fs::write(&path, json).await {
                            log::warn!(
                                "failed to persist diagnostics to '{}': {e}",
                                path.display()
                            );
                        }
                    }
                    WriterMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            entries: Mutex::new(entries),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Record or refresh an entry, keyed by the file's absolute path.
    ///
    /// A pre-existing entry for the same path keeps its first-seen
    /// timestamp. Returns whether the path was newly diagnosed.
    pub fn add(&self, entry: DiagnosticsEntry) -> bool {
        let key = entry.file_path.to_string_lossy().to_string();
        let is_new;
        {
            let mut entries = self.entries.lock().unwrap();
            let entry = match entries.remove(&key) {
                Some(existing) => {
                    is_new = false;
                    DiagnosticsEntry {
                        timestamp: existing.timestamp,
                        ..entry
                    }
                }
                None => {
                    is_new = true;
                    entry
                }
            };
            entries.insert(key, entry);
        }
        self.enqueue_persist();
        is_new
    }

    /// Remove the entry for a path. Returns whether one was present.
    pub fn remove(&self, path: &Path) -> bool {
        let key = path.to_string_lossy().to_string();
        let removed = self.entries.lock().unwrap().remove(&key).is_some();
        if removed {
            self.enqueue_persist();
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
        self.enqueue_persist();
    }

    /// Whether a path currently has an entry.
    pub fn has(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&path.to_string_lossy().to_string())
    }

    /// Snapshot of every entry.
    pub fn get_all(&self) -> Vec<DiagnosticsEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Number of current entries.
    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Wait until every write enqueued so far has hit disk.
    pub async fn flush(&self) {
        let ack = {
            let tx = self.tx.lock().unwrap();
            let Some(tx) = tx.as_ref() else { return };
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(WriterMessage::Flush(ack_tx)).is_err() {
                return;
            }
            ack_rx
        };
        let _ = ack.await;
    }

    /// Flush and stop the background writer.
    pub async fn close(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    fn enqueue_persist(&self) {
        let json = {
            let entries = self.entries.lock().unwrap();
            match serde_json::to_string_pretty(&*entries) {
                Ok(json) => json,
                Err(e) => {
                    log::warn!("failed to serialize diagnostics: {e}");
                    return;
                }
            }
        };
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(WriterMessage::Persist(json));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EpicenterError;

    fn entry(path: &str) -> DiagnosticsEntry {
        DiagnosticsEntry {
            file_path: PathBuf::from(path),
            table_name: "posts".to_string(),
            filename: "bad.md".to_string(),
            error: EpicenterError::Markdown {
                path: PathBuf::from(path),
                message: "unreadable".to_string(),
            }
            .to_detail(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reads_reflect_memory_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DiagnosticsManager::open(dir.path().join("diag.json")).await;

        manager.add(entry("/tmp/posts/bad.md"));
        assert!(manager.has(Path::new("/tmp/posts/bad.md")));
        assert_eq!(manager.count(), 1);

        assert!(manager.remove(Path::new("/tmp/posts/bad.md")));
        assert!(!manager.remove(Path::new("/tmp/posts/bad.md")));
        assert_eq!(manager.count(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.json");

        {
            let manager = DiagnosticsManager::open(&path).await;
            manager.add(entry("/tmp/posts/bad.md"));
            manager.flush().await;
            manager.close().await;
        }

        let manager = DiagnosticsManager::open(&path).await;
        assert_eq!(manager.count(), 1);
        let all = manager.get_all();
        assert_eq!(all[0].error.kind, "MarkdownError");
        manager.close().await;
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.json");
        tokio::fs::write(&path, "not json at all").await.unwrap();

        let manager = DiagnosticsManager::open(&path).await;
        assert_eq!(manager.count(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn re_adding_keeps_first_seen_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DiagnosticsManager::open(dir.path().join("diag.json")).await;

        let first = entry("/tmp/posts/bad.md");
        let first_seen = first.timestamp;
        manager.add(first);

        let mut second = entry("/tmp/posts/bad.md");
        second.timestamp = first_seen + chrono::Duration::seconds(30);
        manager.add(second);

        assert_eq!(manager.get_all()[0].timestamp, first_seen);
        manager.close().await;
    }
}
