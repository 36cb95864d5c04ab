//! Workspace CRDT document.
//!
//! [`WorkspaceDoc`] wraps a yrs [`Doc`] keyed by workspace id. Tables live
//! as named root maps (`table:<name>`); rows are nested maps inside them.
//! The document is mutated only through the [`Table`](super::Table) helper;
//! this type owns byte-state encoding for persistence and the raw update
//! observation hook the persistence provider subscribes to.

use yrs::updates::decoder::Decode;
use yrs::{Doc, MapRef, ReadTxn, StateVector, Transact, Update};

use crate::error::{EpicenterError, Result};

/// Prefix for table root maps inside the document.
const TABLE_PREFIX: &str = "table:";

/// The CRDT document backing one workspace.
pub struct WorkspaceDoc {
    doc: Doc,
    workspace_id: String,
}

impl WorkspaceDoc {
    /// Create an empty document for the given workspace.
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            doc: Doc::new(),
            workspace_id: workspace_id.into(),
        }
    }

    /// The workspace id this document belongs to.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// The underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The root map holding a table's rows, created on first use.
    pub fn table_map(&self, table: &str) -> MapRef {
        self.doc.get_or_insert_map(format!("{TABLE_PREFIX}{table}").as_str())
    }

    /// Encode the full document state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply previously encoded byte-state to this document.
    ///
    /// # Errors
    ///
    /// Returns [`EpicenterError::Persistence`] if the bytes cannot be
    /// decoded or integrated.
    pub fn apply_state(&self, state: &[u8]) -> Result<()> {
        let update = Update::decode_v1(state).map_err(|e| EpicenterError::Persistence {
            message: format!("failed to decode CRDT state: {e}"),
        })?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| EpicenterError::Persistence {
                message: format!("failed to apply CRDT state: {e}"),
            })?;
        Ok(())
    }

    /// Subscribe to document updates.
    ///
    /// The callback receives the binary update data whenever the document
    /// changes. Returns a subscription that unsubscribes when dropped.
    ///
    /// # Panics
    ///
    /// Panics if unable to register the observer.
    pub fn observe_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .expect("Failed to observe document updates")
    }
}

impl std::fmt::Debug for WorkspaceDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceDoc")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}
