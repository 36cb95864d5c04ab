//! CRDT byte-state persistence.
//!
//! A [`PersistenceStore`] is a dumb byte sink: load the stored state (if
//! any), save a new one. [`Persistence`] wires a store to a workspace
//! document — load on attach (before any observer registers), auto-save on
//! every document update through a single background task, flush on destroy.
//!
//! Failure policy: load errors are logged and treated as "no prior state";
//! save errors are logged and never propagate (best-effort).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::BoxFuture;
use crate::error::{EpicenterError, Result};
use crate::store::WorkspaceDoc;

/// Storage backend for CRDT byte-state.
///
/// Implementations exist for the filesystem ([`FsStore`]) and for in-memory
/// key-value storage ([`MemoryStore`], the browser-storage stand-in used by
/// tests).
pub trait PersistenceStore: Send + Sync {
    /// Read the stored byte-state, or `None` if nothing was saved yet.
    fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Persist a new byte-state, replacing any previous one.
    fn save<'a>(&'a self, state: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// Filesystem-backed store: one binary file per workspace.
pub struct FsStore {
    path: PathBuf,
}

impl FsStore {
    /// Store state at the given file path. Parent directories are created
    /// on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceStore for FsStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            match tokio::fs::read(&self.path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(EpicenterError::Persistence {
                    message: format!("failed to read '{}': {e}", self.path.display()),
                }),
            }
        })
    }

    fn save<'a>(&'a self, state: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write via temp file and rename so readers never observe a
            // half-written state.
            let tmp = self.path.with_extension("crdt.tmp");
            tokio::fs::write(&tmp, state).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok(())
        })
    }
}

/// In-memory store. Data is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().clone()) })
    }

    fn save<'a>(&'a self, state: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self.state.lock().unwrap() = Some(state.to_vec());
            Ok(())
        })
    }
}

/// A store attached to a document: loads on attach, auto-saves on update.
pub struct Persistence {
    inner: Mutex<Option<PersistenceInner>>,
}

struct PersistenceInner {
    subscription: yrs::Subscription,
    dirty_tx: mpsc::UnboundedSender<()>,
    saver: JoinHandle<()>,
}

impl Persistence {
    /// Load prior state into the document and start the auto-save loop.
    ///
    /// Must run before any observer registers so that hydration is not
    /// mistaken for live mutations. A corrupt or unreadable prior state is
    /// logged and treated as empty.
    pub async fn attach(doc: Arc<WorkspaceDoc>, store: Arc<dyn PersistenceStore>) -> Self {
        match store.load().await {
            Ok(Some(state)) => {
                if let Err(e) = doc.apply_state(&state) {
                    log::warn!(
                        "discarding corrupt persisted state for workspace '{}': {e}",
                        doc.workspace_id()
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!(
                    "failed to load persisted state for workspace '{}', starting empty: {e}",
                    doc.workspace_id()
                );
            }
        }

        // Update callbacks only mark the document dirty; the saver task
        // owns all I/O and always persists the latest full state, so
        // coalescing can never reorder saves.
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();
        let subscription = {
            let dirty_tx = dirty_tx.clone();
            doc.observe_updates(move |_update| {
                let _ = dirty_tx.send(());
            })
        };

        let saver = {
            let doc = Arc::clone(&doc);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                while dirty_rx.recv().await.is_some() {
                    // Coalesce a burst of updates into one save
                    while dirty_rx.try_recv().is_ok() {}
                    let state = doc.encode_state();
                    if let Err(e) = store.save(&state).await {
                        log::warn!(
                            "failed to persist state for workspace '{}': {e}",
                            doc.workspace_id()
                        );
                    }
                }
            })
        };

        Self {
            inner: Mutex::new(Some(PersistenceInner {
                subscription,
                dirty_tx,
                saver,
            })),
        }
    }

    /// Stop the save subscription and flush any pending write.
    ///
    /// Idempotent: calls after the first are no-ops.
    pub async fn destroy(&self) {
        let inner = self.inner.lock().unwrap().take();
        if let Some(inner) = inner {
            // Dropping the subscription and the local sender closes the
            // channel; the saver drains whatever is queued and exits.
            drop(inner.subscription);
            drop(inner.dirty_tx);
            if let Err(e) = inner.saver.await {
                log::warn!("persistence saver task failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, TableSchema};
    use crate::store::Table;
    use serde_json::json;

    fn posts_schema() -> TableSchema {
        TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&[1, 2, 3]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn fs_store_missing_file_is_no_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("ws.crdt"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fs_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("nested").join("ws.crdt"));
        store.save(&[9, 8, 7]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(vec![9, 8, 7]));
    }

    #[tokio::test]
    async fn state_survives_reattach() {
        let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());

        {
            let doc = Arc::new(WorkspaceDoc::new("ws"));
            let persistence = Persistence::attach(Arc::clone(&doc), Arc::clone(&store)).await;
            let table = Table::new(Arc::clone(&doc), "posts", posts_schema());
            table
                .insert(serde_json::from_value(json!({"id": "a", "title": "Hello"})).unwrap())
                .await
                .unwrap();
            persistence.destroy().await;
        }

        let doc = Arc::new(WorkspaceDoc::new("ws"));
        let _persistence = Persistence::attach(Arc::clone(&doc), store).await;
        let table = Table::new(doc, "posts", posts_schema());
        assert!(table.has("a"));
    }

    #[tokio::test]
    async fn corrupt_state_starts_empty() {
        let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
        store.save(&[0xde, 0xad]).await.unwrap();

        let doc = Arc::new(WorkspaceDoc::new("ws"));
        let _persistence = Persistence::attach(Arc::clone(&doc), store).await;
        let table = Table::new(doc, "posts", posts_schema());
        assert!(table.is_empty());
    }
}
