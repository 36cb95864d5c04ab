use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::FieldError;

/// Unified error type for Epicenter operations.
///
/// Every variant carries a stable `kind` string (see [`EpicenterError::kind`])
/// so that diagnostics entries and log records keep a machine-readable tag
/// across releases.
#[derive(Debug, Error)]
pub enum EpicenterError {
    /// A row, action input, or frontmatter map failed schema validation.
    ///
    /// Carries the field-level breakdown produced by the validator.
    #[error("validation failed for '{context}': {}", format_field_errors(.errors))]
    Validation {
        /// Table name, action name, or file that was being validated
        context: String,
        /// Per-field errors
        errors: Vec<FieldError>,
    },

    /// An insert targeted an id that already exists in the table.
    #[error("duplicate id '{id}' in table '{table}'")]
    DuplicateId {
        /// Table the insert targeted
        table: String,
        /// The conflicting id
        id: String,
    },

    /// A get or update referenced an id that does not exist in the table.
    #[error("row '{id}' not found in table '{table}'")]
    NotFound {
        /// Table the lookup targeted
        table: String,
        /// The missing id
        id: String,
    },

    /// A workspace declared a dependency on an id absent from the epicenter.
    ///
    /// Dependency resolution is flat: the declared id must name another
    /// workspace in the same set, no transitive walk is performed.
    #[error("workspace '{workspace}' depends on unknown workspace '{missing}'")]
    MissingDependency {
        /// The workspace with the unresolvable declaration
        workspace: String,
        /// The id that did not resolve
        missing: String,
    },

    /// The declared dependency graph contains a cycle.
    #[error("dependency cycle between workspaces: {}", .participants.join(", "))]
    DependencyCycle {
        /// Every workspace id left unresolved by the topological sort, sorted
        participants: Vec<String>,
    },

    /// A derived index could not apply a change or failed to attach.
    #[error("index '{index}' failed: {message}")]
    Index {
        /// Index name ("sql", "markdown", ...)
        index: String,
        /// What went wrong
        message: String,
    },

    /// An I/O or format error while reading or writing a markdown file.
    #[error("markdown error for '{path}': {message}")]
    Markdown {
        /// The file involved
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Loading or saving CRDT byte-state failed.
    ///
    /// Load failures are normally downgraded to "no prior state" by the
    /// persistence provider; this variant surfaces where that policy does
    /// not apply (e.g. an unwritable storage directory at startup).
    #[error("persistence error: {message}")]
    Persistence {
        /// What went wrong
        message: String,
    },

    /// A user-supplied action handler failed.
    #[error("action handler failed: {message}")]
    Handler {
        /// The handler's error, stringified
        message: String,
    },

    /// A workspace or index was misconfigured (e.g. a schema without an id
    /// field, or a serializer producing a filename with path separators).
    #[error("configuration error: {message}")]
    Config {
        /// What went wrong
        message: String,
    },

    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error while serializing or deserializing frontmatter YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error while encoding or decoding JSON (serialized rows,
    /// diagnostics, log records).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error from the embedded SQL database.
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for Epicenter operations.
pub type Result<T> = std::result::Result<T, EpicenterError>;

impl EpicenterError {
    /// The stable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            EpicenterError::Validation { .. } => "ValidationError",
            EpicenterError::DuplicateId { .. } => "DuplicateId",
            EpicenterError::NotFound { .. } => "NotFound",
            EpicenterError::MissingDependency { .. } => "MissingDependency",
            EpicenterError::DependencyCycle { .. } => "DependencyCycle",
            EpicenterError::Index { .. } => "IndexError",
            EpicenterError::Markdown { .. } => "MarkdownError",
            EpicenterError::Persistence { .. } => "PersistenceError",
            EpicenterError::Handler { .. } => "HandlerError",
            EpicenterError::Config { .. } => "ConfigError",
            EpicenterError::Io(_) => "IoError",
            EpicenterError::Yaml(_) => "YamlError",
            EpicenterError::Json(_) => "JsonError",
            EpicenterError::Sql(_) => "SqlError",
        }
    }

    /// Convert to the serializable representation used by diagnostics
    /// entries and log records.
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail::from(self)
    }
}

/// A serializable representation of an [`EpicenterError`].
///
/// This is the shape persisted into the diagnostics JSON file and the
/// NDJSON error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error kind string
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Structured context (field errors, paths, ids) where available
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl From<&EpicenterError> for ErrorDetail {
    fn from(err: &EpicenterError) -> Self {
        let context = match err {
            EpicenterError::Validation { context, errors } => serde_json::json!({
                "context": context,
                "errors": errors,
            }),
            EpicenterError::DuplicateId { table, id }
            | EpicenterError::NotFound { table, id } => serde_json::json!({
                "table": table,
                "id": id,
            }),
            EpicenterError::MissingDependency { workspace, missing } => serde_json::json!({
                "workspace": workspace,
                "missing": missing,
            }),
            EpicenterError::DependencyCycle { participants } => serde_json::json!({
                "participants": participants,
            }),
            EpicenterError::Index { index, .. } => serde_json::json!({ "index": index }),
            EpicenterError::Markdown { path, .. } => serde_json::json!({ "path": path }),
            _ => serde_json::Value::Null,
        };

        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let err = EpicenterError::DuplicateId {
            table: "posts".to_string(),
            id: "a".to_string(),
        };
        assert_eq!(err.kind(), "DuplicateId");

        let err = EpicenterError::Validation {
            context: "posts".to_string(),
            errors: vec![FieldError::new("title", "missing required field")],
        };
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn detail_carries_structured_context() {
        let err = EpicenterError::NotFound {
            table: "posts".to_string(),
            id: "x".to_string(),
        };
        let detail = err.to_detail();
        assert_eq!(detail.kind, "NotFound");
        assert_eq!(detail.context["table"], "posts");
        assert_eq!(detail.context["id"], "x");
    }

    #[test]
    fn detail_round_trips_through_json() {
        let err = EpicenterError::Markdown {
            path: PathBuf::from("/tmp/posts/bad.md"),
            message: "unreadable".to_string(),
        };
        let json = serde_json::to_string(&err.to_detail()).unwrap();
        let back: ErrorDetail = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "MarkdownError");
    }
}
