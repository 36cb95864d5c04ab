//! Bidirectional markdown index.
//!
//! Maintains one markdown file per row under
//! `<epicenter-dir>/<workspace-id>/<table>/`, kept in sync with the CRDT in
//! both directions: CRDT mutations write files through table observers, and
//! external file edits flow back through a file-system watcher. Invalid
//! files accumulate in a diagnostics index instead of blocking startup.
//!
//! Startup order matters and is fixed: directories, diagnostics, the
//! initial scan (no CRDT mutation), bidirectional map population from the
//! CRDT, and only then observer and watcher registration.

mod bimap;
mod codec;
mod coordinator;
mod diagnostics;
mod error_log;
mod sync;
mod watcher;

pub use bimap::FilenameMap;
pub use codec::{
    DeserializeFn, DeserializeInput, MarkdownFile, MarkdownTableConfig, SerializeFn, TableContext,
    default_deserialize, default_serialize,
};
pub use coordinator::{CrdtChangeGuard, FileChangeGuard, SyncCoordinator};
pub use diagnostics::{DiagnosticsEntry, DiagnosticsManager};
pub use error_log::{ErrorLog, LogRecord};
pub use watcher::{DirectoryWatcher, WatchEvent};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::BoxFuture;
use crate::error::Result;
use crate::store::{ObserverHandle, Table, TableObserver};
use crate::validator::Validated;
use sync::{MarkdownEngine, TableSync};

/// Configuration for one workspace markdown index.
#[derive(Default, Clone)]
pub struct MarkdownConfig {
    tables: HashMap<String, MarkdownTableConfig>,
}

impl MarkdownConfig {
    /// Default configuration: every table uses the default
    /// serialize/deserialize pair.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override serialization for one table.
    pub fn with_table(mut self, table: impl Into<String>, config: MarkdownTableConfig) -> Self {
        self.tables.insert(table.into(), config);
        self
    }
}

/// Where the markdown index keeps its artefacts.
pub struct MarkdownLayout {
    /// Workspace markdown root; one sub-directory per table
    pub root: PathBuf,
    /// Diagnostics JSON file
    pub diagnostics_file: PathBuf,
    /// Append-only NDJSON error log
    pub error_log_file: PathBuf,
}

/// The live markdown index for one workspace.
pub struct MarkdownIndex {
    engine: Arc<MarkdownEngine>,
    observer_handles: Mutex<Vec<ObserverHandle>>,
    watcher: Mutex<Option<DirectoryWatcher>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl MarkdownIndex {
    /// Build the index: create directories, load diagnostics, scan disk,
    /// seed the bidirectional maps, then go live (observers + watcher).
    pub async fn attach(
        workspace_id: &str,
        layout: MarkdownLayout,
        tables: &[Arc<Table>],
        config: &MarkdownConfig,
    ) -> Result<Self> {
        // 1. Directories
        tokio::fs::create_dir_all(&layout.root).await?;
        for table in tables {
            tokio::fs::create_dir_all(layout.root.join(table.name())).await?;
        }

        // 2. Diagnostics and error log
        let diagnostics = DiagnosticsManager::open(&layout.diagnostics_file).await;
        let log = ErrorLog::open(&layout.error_log_file).await;

        let mut table_syncs = IndexMap::new();
        for table in tables {
            let overrides = config.tables.get(table.name());
            let serialize = overrides
                .and_then(|c| c.serialize.clone())
                .unwrap_or_else(|| default_serialize(table.schema()));
            let deserialize = overrides
                .and_then(|c| c.deserialize.clone())
                .unwrap_or_else(default_deserialize);
            table_syncs.insert(
                table.name().to_string(),
                Arc::new(TableSync {
                    name: table.name().to_string(),
                    dir: layout.root.join(table.name()),
                    table: Arc::clone(table),
                    serialize,
                    deserialize,
                    context: TableContext {
                        name: table.name().to_string(),
                        schema: table.schema().clone(),
                        validator: Arc::clone(table.validator()),
                    },
                    map: Mutex::new(FilenameMap::new()),
                }),
            );
        }

        let engine = Arc::new(MarkdownEngine {
            workspace_id: workspace_id.to_string(),
            tables: table_syncs,
            coordinator: SyncCoordinator::new(),
            diagnostics,
            log,
        });

        // 3. Initial scan; invalid files become diagnostics, not failures
        engine.startup_scan().await?;

        // 4. Seed row-id ↔ filename maps before anything can fire
        engine.populate_maps()?;

        // 5. Observers and watcher
        let observer_handles = engine
            .tables
            .values()
            .map(|sync| {
                sync.table.observe(Arc::new(MarkdownObserver {
                    engine: Arc::clone(&engine),
                    sync: Arc::clone(sync),
                }))
            })
            .collect();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WatchEvent>();
        let dirs: Vec<(String, PathBuf)> = engine
            .tables
            .values()
            .map(|sync| (sync.name.clone(), sync.dir.clone()))
            .collect();
        let watcher = DirectoryWatcher::start(&dirs, event_tx)?;

        let drain = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if let Some(sync) = engine.tables.get(&event.table) {
                        engine.on_file_event(sync, &event.path).await;
                    }
                }
            })
        };

        Ok(Self {
            engine,
            observer_handles: Mutex::new(observer_handles),
            watcher: Mutex::new(Some(watcher)),
            drain: Mutex::new(Some(drain)),
        })
    }

    /// The operations handle exported to actions.
    pub fn ops(&self) -> MarkdownOps {
        MarkdownOps {
            engine: Arc::clone(&self.engine),
        }
    }

    /// Stop both sync directions, then flush diagnostics and the error
    /// log. After this returns no further file write or CRDT mutation
    /// originates from this index.
    pub async fn destroy(&self) {
        self.observer_handles.lock().unwrap().clear();
        // Dropping the watcher drops the event sender; the drain task
        // finishes whatever is queued and exits
        let watcher = self.watcher.lock().unwrap().take();
        drop(watcher);
        let drain = self.drain.lock().unwrap().take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }
        self.engine.diagnostics.flush().await;
        self.engine.diagnostics.close().await;
        self.engine.log.flush().await;
        self.engine.log.close().await;
    }
}

/// Manual operations and diagnostics access, exported by the index.
#[derive(Clone)]
pub struct MarkdownOps {
    engine: Arc<MarkdownEngine>,
}

impl MarkdownOps {
    /// Delete every row file, then rewrite one per CRDT row.
    pub async fn pull_to_markdown(&self) -> Result<()> {
        self.engine.pull_to_markdown().await
    }

    /// Clear every table and rebuild the CRDT from what is on disk.
    pub async fn push_from_markdown(&self) -> Result<()> {
        self.engine.push_from_markdown().await
    }

    /// Rebuild diagnostics from scratch by re-reading every file.
    pub async fn scan_for_errors(&self) -> Result<()> {
        self.engine.scan_for_errors().await
    }

    /// Snapshot of current diagnostics entries.
    pub fn diagnostics(&self) -> Vec<DiagnosticsEntry> {
        self.engine.diagnostics.get_all()
    }

    /// Number of files currently failing validation.
    pub fn diagnostics_count(&self) -> usize {
        self.engine.diagnostics.count()
    }

    /// Whether a file currently has a diagnostics entry.
    pub fn has_diagnostic(&self, path: &std::path::Path) -> bool {
        self.engine.diagnostics.has(path)
    }

    /// Await all pending diagnostics and log writes. Used at shutdown and
    /// by tests to settle.
    pub async fn flush(&self) {
        self.engine.diagnostics.flush().await;
        self.engine.log.flush().await;
    }
}

/// Index provider attaching a [`MarkdownIndex`] under
/// `<epicenter-dir>/<workspace-id>/`.
#[derive(Default, Clone)]
pub struct MarkdownProvider {
    config: MarkdownConfig,
}

impl MarkdownProvider {
    /// Provider with default per-table serialization.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with per-table overrides.
    pub fn with_config(config: MarkdownConfig) -> Self {
        Self { config }
    }
}

impl crate::workspace::IndexProvider for MarkdownProvider {
    fn name(&self) -> &str {
        "markdown"
    }

    fn attach<'a>(
        &'a self,
        ctx: &'a crate::workspace::IndexContext,
    ) -> BoxFuture<'a, crate::error::Result<crate::workspace::IndexHandle>> {
        Box::pin(async move {
            let layout = MarkdownLayout {
                root: ctx.paths.markdown_root(&ctx.workspace_id).as_path().to_path_buf(),
                diagnostics_file: ctx
                    .paths
                    .diagnostics_file(&ctx.workspace_id)
                    .as_path()
                    .to_path_buf(),
                error_log_file: ctx
                    .paths
                    .error_log_file(&ctx.workspace_id)
                    .as_path()
                    .to_path_buf(),
            };
            let index =
                MarkdownIndex::attach(&ctx.workspace_id, layout, &ctx.table_list(), &self.config)
                    .await?;
            let ops = index.ops();
            Ok(crate::workspace::IndexHandle {
                exports: crate::workspace::IndexExports::Markdown(ops),
                destroy: Some(Box::new(move || -> BoxFuture<'static, ()> {
                    Box::pin(async move { index.destroy().await })
                })),
            })
        })
    }
}

struct MarkdownObserver {
    engine: Arc<MarkdownEngine>,
    sync: Arc<TableSync>,
}

impl TableObserver for MarkdownObserver {
    fn on_add<'a>(&'a self, row: &'a Validated) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.engine.on_row_upserted(&self.sync, row).await })
    }

    fn on_update<'a>(&'a self, row: &'a Validated) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.engine.on_row_upserted(&self.sync, row).await })
    }

    fn on_delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.engine.on_row_deleted(&self.sync, id).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, TableSchema};
    use crate::store::WorkspaceDoc;
    use serde_json::json;
    use std::path::Path;

    fn layout(root: &Path) -> MarkdownLayout {
        MarkdownLayout {
            root: root.join("ws"),
            diagnostics_file: root.join("markdown").join("ws-diagnostics.json"),
            error_log_file: root.join("markdown").join("ws.log"),
        }
    }

    fn posts_table() -> Arc<Table> {
        let doc = Arc::new(WorkspaceDoc::new("ws"));
        let schema = TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
            (
                "category".to_string(),
                FieldType::select(["tech", "personal", "tutorial"]),
            ),
        ])
        .unwrap();
        Arc::new(Table::new(doc, "posts", schema))
    }

    fn row(value: serde_json::Value) -> crate::schema::SerializedRow {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn insert_writes_one_file_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let table = posts_table();
        let index = MarkdownIndex::attach(
            "ws",
            layout(dir.path()),
            &[Arc::clone(&table)],
            &MarkdownConfig::new(),
        )
        .await
        .unwrap();

        table
            .insert(row(json!({"id": "x", "title": "Hello", "category": "tech"})))
            .await
            .unwrap();

        let path = dir.path().join("ws").join("posts").join("x.md");
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("---\n"));
        assert!(content.contains("title: Hello"));
        index.destroy().await;
    }

    #[tokio::test]
    async fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = posts_table();
        let index = MarkdownIndex::attach(
            "ws",
            layout(dir.path()),
            &[Arc::clone(&table)],
            &MarkdownConfig::new(),
        )
        .await
        .unwrap();

        table
            .insert(row(json!({"id": "x", "title": "Hello", "category": "tech"})))
            .await
            .unwrap();
        let path = dir.path().join("ws").join("posts").join("x.md");
        assert!(path.exists());

        table.delete("x").await.unwrap();
        assert!(!path.exists());
        index.destroy().await;
    }

    #[tokio::test]
    async fn startup_scan_diagnoses_invalid_files_without_touching_the_crdt() {
        let dir = tempfile::tempdir().unwrap();
        let posts_dir = dir.path().join("ws").join("posts");
        tokio::fs::create_dir_all(&posts_dir).await.unwrap();
        // Missing required "title"
        tokio::fs::write(posts_dir.join("bad.md"), "---\ncategory: tech\n---\n")
            .await
            .unwrap();

        let table = posts_table();
        let index = MarkdownIndex::attach(
            "ws",
            layout(dir.path()),
            &[Arc::clone(&table)],
            &MarkdownConfig::new(),
        )
        .await
        .unwrap();

        assert!(table.is_empty());
        let ops = index.ops();
        assert_eq!(ops.diagnostics_count(), 1);
        let entry = &ops.diagnostics()[0];
        assert_eq!(entry.table_name, "posts");
        assert_eq!(entry.error.kind, "ValidationError");
        index.destroy().await;
    }

    #[tokio::test]
    async fn pull_then_pull_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let table = posts_table();
        let index = MarkdownIndex::attach(
            "ws",
            layout(dir.path()),
            &[Arc::clone(&table)],
            &MarkdownConfig::new(),
        )
        .await
        .unwrap();
        let ops = index.ops();

        for id in ["a", "b"] {
            table
                .insert(row(json!({"id": id, "title": "t", "category": "tech"})))
                .await
                .unwrap();
        }

        ops.pull_to_markdown().await.unwrap();
        let posts_dir = dir.path().join("ws").join("posts");
        let first: Vec<_> = std::fs::read_dir(&posts_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        ops.pull_to_markdown().await.unwrap();
        let second: Vec<_> = std::fs::read_dir(&posts_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        let mut first = first;
        let mut second = second;
        first.sort();
        second.sort();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        index.destroy().await;
    }

    #[tokio::test]
    async fn push_restores_rows_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let table = posts_table();
        let index = MarkdownIndex::attach(
            "ws",
            layout(dir.path()),
            &[Arc::clone(&table)],
            &MarkdownConfig::new(),
        )
        .await
        .unwrap();
        let ops = index.ops();

        table
            .insert(row(json!({"id": "a", "title": "Keep", "category": "tech"})))
            .await
            .unwrap();
        ops.pull_to_markdown().await.unwrap();

        // Wipe the CRDT, then restore from disk
        ops.push_from_markdown().await.unwrap();
        assert_eq!(table.len(), 1);
        let restored = table.get("a").unwrap();
        assert_eq!(restored.valid().unwrap()["title"], json!("Keep"));
        index.destroy().await;
    }
}
