//! Append-only NDJSON error log.
//!
//! Every markdown sync failure is recorded as one JSON object per line.
//! Records pass through an asynchronous single-writer queue so appends
//! never race and callers never wait for disk; `close` flushes.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{EpicenterError, ErrorDetail};

/// One log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the failure happened
    pub timestamp: DateTime<Utc>,
    /// Stable error kind string
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Structured context
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    /// Underlying cause, where one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl LogRecord {
    /// Build a record from an error, stamped now.
    pub fn from_error(error: &EpicenterError, cause: Option<String>) -> Self {
        let ErrorDetail {
            kind,
            message,
            context,
        } = error.to_detail();
        Self {
            timestamp: Utc::now(),
            kind,
            message,
            context,
            cause,
        }
    }
}

enum WriterMessage {
    Append(String),
    Flush(oneshot::Sender<()>),
}

/// The append-only error log for one workspace markdown index.
pub struct ErrorLog {
    tx: Mutex<Option<mpsc::UnboundedSender<WriterMessage>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl ErrorLog {
    /// Open the log file for appending and start the background writer.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMessage>();

        let writer = tokio::spawn(async move {
            let mut file: Option<tokio::fs::File> = None;
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Append(line) => {
                        if file.is_none() {
                            if let Some(parent) = path.parent() {
                                let _ = tokio::fs::create_dir_all(parent).await;
                            }
                            match tokio::fs::OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(&path)
                                .await
                            {
                                Ok(f) => file = Some(f),
                                Err(e) => {
                                    log::warn!(
                                        "failed to open error log '{}': {e}",
                                        path.display()
                                    );
                                    continue;
                                }
                            }
                        }
                        if let Some(f) = file.as_mut()
                            && let Err(e) = f.write_all(line.as_bytes()).await
                        {
                            log::warn!("failed to append to error log: {e}");
                        }
                    }
                    WriterMessage::Flush(ack) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush().await;
                        }
                        let _ = ack.send(());
                    }
                }
            }
            if let Some(mut f) = file.take() {
                let _ = f.flush().await;
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Append one record.
    pub fn append(&self, record: LogRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                log::warn!("failed to serialize log record: {e}");
                return;
            }
        };
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(WriterMessage::Append(line));
        }
    }

    /// Append a record built from an error.
    pub fn append_error(&self, error: &EpicenterError, cause: Option<String>) {
        self.append(LogRecord::from_error(error, cause));
    }

    /// Wait until every record enqueued so far has hit disk.
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    async fn read_records(path: &Path) -> Vec<LogRecord> {
        let content = tokio::fs::read_to_string(path).await.unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn appends_one_json_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.log");
        let log = ErrorLog::open(&path).await;

        log.append_error(
            &EpicenterError::Markdown {
                path: PathBuf::from("/tmp/posts/bad.md"),
                message: "unreadable".to_string(),
            },
            None,
        );
        log.append_error(
            &EpicenterError::NotFound {
                table: "posts".to_string(),
                id: "x".to_string(),
            },
            Some("file deleted externally".to_string()),
        );
        log.close().await;

        let records = read_records(&path).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "MarkdownError");
        assert_eq!(records[1].kind, "NotFound");
        assert_eq!(
            records[1].cause.as_deref(),
            Some("file deleted externally")
        );
    }

    #[tokio::test]
    async fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.log");

        for _ in 0..2 {
            let log = ErrorLog::open(&path).await;
            log.append_error(
                &EpicenterError::Persistence {
                    message: "boom".to_string(),
                },
                None,
            );
            log.close().await;
        }

        assert_eq!(read_records(&path).await.len(), 2);
    }
}
