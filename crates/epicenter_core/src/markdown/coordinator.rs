//! Loop-guard flags for bidirectional sync.
//!
//! Two flags per workspace index keep the file watcher and the CRDT
//! observers from echoing each other: outbound writes hold the "processing
//! CRDT change" flag across the awaited disk write so the watcher returns
//! immediately, and inbound writes hold the "processing file change" flag
//! across the CRDT update so the observers return immediately.
//!
//! The flags are atomic counters rather than booleans so overlapping
//! guarded sections (e.g. two tables flushing at once) release correctly.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Coordinator state shared by the watcher and the observers of one
/// workspace markdown index.
#[derive(Debug, Default)]
pub struct SyncCoordinator {
    processing_file_change: AtomicUsize,
    processing_crdt_change: AtomicUsize,
}

impl SyncCoordinator {
    /// Fresh coordinator with both flags clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an inbound file change is currently being applied to the
    /// CRDT.
    pub fn is_processing_file_change(&self) -> bool {
        self.processing_file_change.load(Ordering::Acquire) > 0
    }

    /// Whether an outbound CRDT change is currently being written to disk.
    pub fn is_processing_crdt_change(&self) -> bool {
        self.processing_crdt_change.load(Ordering::Acquire) > 0
    }

    /// Mark an inbound file change as in progress for the guard's lifetime.
    pub fn begin_file_change(&self) -> FileChangeGuard<'_> {
        self.processing_file_change.fetch_add(1, Ordering::AcqRel);
        FileChangeGuard { coordinator: self }
    }

    /// Mark an outbound CRDT change as in progress for the guard's
    /// lifetime.
    pub fn begin_crdt_change(&self) -> CrdtChangeGuard<'_> {
        self.processing_crdt_change.fetch_add(1, Ordering::AcqRel);
        CrdtChangeGuard { coordinator: self }
    }
}

/// Clears the file-change flag on drop.
pub struct FileChangeGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for FileChangeGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .processing_file_change
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clears the CRDT-change flag on drop.
pub struct CrdtChangeGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for CrdtChangeGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .processing_crdt_change
            .fetch_sub(1, Ordering::AcqRel);
    }
}
