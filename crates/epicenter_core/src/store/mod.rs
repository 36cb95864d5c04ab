//! CRDT store and table helpers.
//!
//! Each workspace owns one CRDT document ([`WorkspaceDoc`]); every table is
//! a named sub-map within that document, keyed by row id, with per-row
//! records as nested maps. The [`Table`] helper layers schema enforcement,
//! typed operations, and observer fan-out on top.

mod doc;
mod observer;
mod table;
mod value;

pub use doc::WorkspaceDoc;
pub use observer::{ObserverHandle, TableObserver};
pub use table::Table;
