//! The bidirectional sync engine.
//!
//! Outbound: table observers serialise rows to disk, cleaning up old
//! filenames on rename. Inbound: watcher events deserialise files back into
//! the CRDT. The [`SyncCoordinator`] flags keep the two directions from
//! echoing; as a second line of defence against watcher latency, inbound
//! upserts that equal the stored row are skipped entirely.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use indexmap::IndexMap;

use super::bimap::FilenameMap;
use super::codec::{self, DeserializeFn, DeserializeInput, SerializeFn, TableContext};
use super::coordinator::SyncCoordinator;
use super::diagnostics::{DiagnosticsEntry, DiagnosticsManager};
use super::error_log::ErrorLog;
use crate::error::{EpicenterError, Result};
use crate::frontmatter;
use crate::schema::SerializedRow;
use crate::store::Table;
use crate::validator::Validated;

/// Sync state for one table.
pub(crate) struct TableSync {
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) table: Arc<Table>,
    pub(crate) serialize: SerializeFn,
    pub(crate) deserialize: DeserializeFn,
    pub(crate) context: TableContext,
    pub(crate) map: Mutex<FilenameMap>,
}

/// Shared engine behind the observers, the watcher drain task, and the
/// manual operations.
pub(crate) struct MarkdownEngine {
    pub(crate) workspace_id: String,
    pub(crate) tables: IndexMap<String, Arc<TableSync>>,
    pub(crate) coordinator: SyncCoordinator,
    pub(crate) diagnostics: DiagnosticsManager,
    pub(crate) log: ErrorLog,
}

impl MarkdownEngine {
    // ==================== Startup ====================

    /// Scan every table directory, recording diagnostics for files that
    /// fail to read or validate. Does not touch the CRDT.
    pub(crate) async fn startup_scan(&self) -> Result<()> {
        for sync in self.tables.values() {
            for path in list_md_files(&sync.dir).await? {
                if let Err(e) = self.check_file(sync, &path).await {
                    self.record_failure(sync, &path, &e);
                }
            }
        }
        Ok(())
    }

    /// Compute every row's filename and seed the bidirectional maps.
    ///
    /// Runs before any observer or watcher fires so a later update can
    /// locate the prior filename. A serializer producing an illegal
    /// filename aborts startup.
    pub(crate) fn populate_maps(&self) -> Result<()> {
        for sync in self.tables.values() {
            let mut map = sync.map.lock().unwrap();
            for validated in sync.table.get_all() {
                let Some(row) = validated.valid() else {
                    continue;
                };
                let Some(id) = sync.table.schema().row_id(row) else {
                    continue;
                };
                let file = (sync.serialize)(row);
                codec::validate_filename(&sync.name, &file.filename)?;
                map.set(id, file.filename);
            }
        }
        Ok(())
    }

    // ==================== Outbound (CRDT → file) ====================

    /// Handle an add/update observer event for one table.
    pub(crate) async fn on_row_upserted(&self, sync: &TableSync, validated: &Validated) {
        if self.coordinator.is_processing_file_change() {
            return;
        }
        let _guard = self.coordinator.begin_crdt_change();

        let Some(row) = validated.valid() else {
            return;
        };
        if let Err(e) = self.write_row(sync, row).await {
            log::warn!(
                "markdown write failed for table '{}' in '{}': {e}",
                sync.name,
                self.workspace_id
            );
            self.log.append_error(&e, None);
        }
    }

    /// Handle a delete observer event for one table.
    pub(crate) async fn on_row_deleted(&self, sync: &TableSync, id: &str) {
        if self.coordinator.is_processing_file_change() {
            return;
        }
        let _guard = self.coordinator.begin_crdt_change();

        let filename = sync.map.lock().unwrap().delete_by_row(id);
        let Some(filename) = filename else {
            // The file was never materialised; nothing to clean up
            return;
        };
        let path = sync.dir.join(&filename);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            let err = EpicenterError::Markdown {
                path,
                message: format!("failed to delete row file: {e}"),
            };
            log::warn!("{err}");
            self.log.append_error(&err, None);
        }
    }

    /// Serialise one row to disk, deleting the old file first on a
    /// filename change. The write goes through a temp file and rename so
    /// readers never observe a half-written file.
    pub(crate) async fn write_row(&self, sync: &TableSync, row: &SerializedRow) -> Result<()> {
        let file = (sync.serialize)(row);
        codec::validate_filename(&sync.name, &file.filename)?;
        let id = sync
            .table
            .schema()
            .row_id(row)
            .ok_or_else(|| EpicenterError::Config {
                message: format!("table '{}' produced a row without an id", sync.name),
            })?
            .to_string();

        let previous = sync
            .map
            .lock()
            .unwrap()
            .get_filename(&id)
            .map(str::to_string);
        if let Some(previous) = previous
            && previous != file.filename
        {
            let old_path = sync.dir.join(&previous);
            if let Err(e) = tokio::fs::remove_file(&old_path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                log::warn!("failed to delete renamed row file '{}': {e}", old_path.display());
            }
        }
        sync.map.lock().unwrap().set(&id, file.filename.clone());

        let content = frontmatter::serialize(&file.frontmatter, &file.body)?;
        let target = sync.dir.join(&file.filename);
        let tmp = sync.dir.join(format!("{}.tmp", file.filename));
        tokio::fs::write(&tmp, content.as_bytes())
            .await
            .map_err(|e| EpicenterError::Markdown {
                path: tmp.clone(),
                message: format!("failed to write row file: {e}"),
            })?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| EpicenterError::Markdown {
                path: target.clone(),
                message: format!("failed to finalise row file: {e}"),
            })?;
        Ok(())
    }

    // ==================== Inbound (file → CRDT) ====================

    /// Handle one watcher event.
    pub(crate) async fn on_file_event(&self, sync: &TableSync, path: &Path) {
        if self.coordinator.is_processing_crdt_change() {
            return;
        }
        if tokio::fs::metadata(path).await.is_ok() {
            self.apply_file(sync, path).await;
        } else {
            self.handle_removed(sync, path).await;
        }
    }

    /// Read, validate, and apply one file into the CRDT.
    async fn apply_file(&self, sync: &TableSync, path: &Path) {
        let filename = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => return,
        };

        let row = match self.check_file(sync, path).await {
            Ok(row) => row,
            Err(e) => {
                self.record_failure(sync, path, &e);
                return;
            }
        };
        if self.diagnostics.has(path) {
            self.diagnostics.remove(path);
        }

        let Some(id) = sync.table.schema().row_id(&row).map(str::to_string) else {
            return;
        };

        let _guard = self.coordinator.begin_file_change();
        let result = if sync.table.has(&id) {
            // Skip echoes of our own outbound writes: an identical row
            // means the file already mirrors the CRDT
            let unchanged = sync
                .table
                .get(&id)
                .ok()
                .and_then(Validated::into_valid)
                .is_some_and(|current| current == row);
            if unchanged {
                Ok(())
            } else {
                sync.table.update(row).await.map(|_| ())
            }
        } else {
            sync.table.insert(row).await.map(|_| ())
        };

        match result {
            Ok(()) => {
                sync.map.lock().unwrap().set(&id, &filename);
            }
            Err(e) => {
                log::warn!(
                    "failed to apply file '{}' to table '{}': {e}",
                    path.display(),
                    sync.name
                );
                self.log.append_error(&e, None);
            }
        }
    }

    /// Handle an externally deleted file.
    async fn handle_removed(&self, sync: &TableSync, path: &Path) {
        let filename = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => return,
        };

        // A deleted invalid file no longer belongs in diagnostics
        self.diagnostics.remove(path);

        let row_id = sync.map.lock().unwrap().delete_by_filename(&filename);
        match row_id {
            Some(id) => {
                let _guard = self.coordinator.begin_file_change();
                if let Err(e) = sync.table.delete(&id).await {
                    log::warn!("failed to delete row '{id}' from '{}': {e}", sync.name);
                    self.log.append_error(&e, None);
                }
            }
            None => {
                log::debug!(
                    "untracked file '{}' removed from table '{}'",
                    path.display(),
                    sync.name
                );
            }
        }
    }

    // ==================== Manual operations ====================

    /// Delete every row file, then rewrite one per CRDT row.
    pub(crate) async fn pull_to_markdown(&self) -> Result<()> {
        let _guard = self.coordinator.begin_crdt_change();

        for sync in self.tables.values() {
            for path in list_md_files(&sync.dir).await? {
                tokio::fs::remove_file(&path).await?;
            }
            sync.map.lock().unwrap().clear();

            for validated in sync.table.get_all() {
                if let Some(row) = validated.valid() {
                    self.write_row(sync, row).await?;
                }
            }
        }
        Ok(())
    }

    /// Clear every table, then rebuild the CRDT from what is on disk.
    pub(crate) async fn push_from_markdown(&self) -> Result<()> {
        let _guard = self.coordinator.begin_file_change();
        self.diagnostics.clear();

        for sync in self.tables.values() {
            sync.table.clear().await?;
            sync.map.lock().unwrap().clear();

            for path in list_md_files(&sync.dir).await? {
                let filename = match path.file_name() {
                    Some(name) => name.to_string_lossy().to_string(),
                    None => continue,
                };
                match self.check_file(sync, &path).await {
                    Ok(row) => {
                        let id = sync.table.schema().row_id(&row).map(str::to_string);
                        match sync.table.insert(row).await {
                            Ok(_) => {
                                if let Some(id) = id {
                                    sync.map.lock().unwrap().set(id, filename);
                                }
                            }
                            Err(e) => {
                                self.record_failure(sync, &path, &e);
                            }
                        }
                    }
                    Err(e) => self.record_failure(sync, &path, &e),
                }
            }
        }
        Ok(())
    }

    /// Rebuild diagnostics from scratch by re-reading every file. Does not
    /// touch the CRDT.
    pub(crate) async fn scan_for_errors(&self) -> Result<()> {
        self.diagnostics.clear();
        for sync in self.tables.values() {
            for path in list_md_files(&sync.dir).await? {
                if let Err(e) = self.check_file(sync, &path).await {
                    self.record_failure(sync, &path, &e);
                }
            }
        }
        Ok(())
    }

    // ==================== Shared helpers ====================

    /// Read and deserialise one file, without touching the CRDT.
    async fn check_file(&self, sync: &TableSync, path: &Path) -> Result<SerializedRow> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| EpicenterError::Markdown {
                    path: path.to_path_buf(),
                    message: format!("failed to read file: {e}"),
                })?;
        let parsed =
            frontmatter::parse_or_empty(&content).map_err(|e| EpicenterError::Markdown {
                path: path.to_path_buf(),
                message: format!("failed to parse frontmatter: {e}"),
            })?;

        (sync.deserialize)(&DeserializeInput {
            frontmatter: &parsed.frontmatter,
            body: &parsed.body,
            filename: &filename,
            table: &sync.context,
        })
    }

    fn record_failure(&self, sync: &TableSync, path: &Path, error: &EpicenterError) {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let newly_diagnosed = self.diagnostics.add(DiagnosticsEntry {
            file_path: path.to_path_buf(),
            table_name: sync.name.clone(),
            filename,
            error: error.to_detail(),
            timestamp: Utc::now(),
        });
        // The watcher can deliver several events for one write; log a
        // failing file once until it is fixed or removed
        if newly_diagnosed {
            self.log.append_error(error, None);
        }
    }
}

/// Markdown files directly inside a directory, sorted for determinism.
pub(crate) async fn list_md_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "md")
            && entry.file_type().await.is_ok_and(|ty| ty.is_file())
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
