#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;

/// A boxed future for object-safe async methods.
///
/// Used at every async seam that must be a trait object: table observers,
/// persistence stores, index providers, and action handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Query/mutation descriptors and the traversable action map
pub mod actions;

/// Error (common error types)
pub mod error;

/// Epicenter composition: dependency verification, topological
/// initialisation, the combined client
pub mod epicenter;

/// Markdown frontmatter parsing and serialization utilities
pub mod frontmatter;

/// Bidirectional markdown index
pub mod markdown;

/// Storage layout under `.epicenter/`
pub mod paths;

/// CRDT byte-state persistence providers
pub mod persistence;

/// Declarative table schemas and the serialized row shape
pub mod schema;

/// SQL projection of the CRDT tables
pub mod sql;

/// CRDT store and table helpers
pub mod store;

/// Row validation
pub mod validator;

/// Workspace assembly and lifecycle
pub mod workspace;

pub use actions::{Action, ActionKind, ActionMap, ActionNode};
pub use epicenter::{EpicenterClient, create_epicenter_client};
pub use error::{EpicenterError, ErrorDetail, Result};
pub use markdown::{MarkdownConfig, MarkdownProvider};
pub use paths::{AbsolutePath, EpicenterPaths};
pub use persistence::{FsStore, MemoryStore, Persistence, PersistenceStore};
pub use schema::{FieldType, SerializedRow, TableSchema, WorkspaceSchema};
pub use sql::SqlProvider;
pub use store::{ObserverHandle, Table, TableObserver, WorkspaceDoc};
pub use validator::{FieldError, SchemaValidator, Validated, Validator};
pub use workspace::{WorkspaceClient, WorkspaceDefinition};
