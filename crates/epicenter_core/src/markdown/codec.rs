//! Row ↔ markdown file conversion.
//!
//! Each table carries a `serialize` function producing
//! `{frontmatter, body, filename}` from a serialized row, and a
//! `deserialize` function recovering a row from file content. The defaults
//! here put every field except the id into frontmatter, leave the body
//! empty, name the file `<id>.md`, and on the way back take the id from the
//! basename and validate the remaining frontmatter against the table
//! schema. Tables can override either direction.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{EpicenterError, Result};
use crate::frontmatter::Frontmatter;
use crate::schema::{SerializedRow, TableSchema};
use crate::validator::{Validated, Validator};

/// The on-disk shape of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownFile {
    /// YAML frontmatter fields
    pub frontmatter: Frontmatter,
    /// Content after the closing delimiter
    pub body: String,
    /// Plain filename within the table directory (no path separators)
    pub filename: String,
}

/// Table-level context handed to `deserialize` implementations.
pub struct TableContext {
    /// The table name
    pub name: String,
    /// The table schema
    pub schema: TableSchema,
    /// The validator enforced on entry
    pub validator: Arc<dyn Validator>,
}

/// Everything a `deserialize` implementation gets to work with.
pub struct DeserializeInput<'a> {
    /// Parsed frontmatter
    pub frontmatter: &'a Frontmatter,
    /// File body
    pub body: &'a str,
    /// Plain filename within the table directory
    pub filename: &'a str,
    /// The owning table
    pub table: &'a TableContext,
}

/// Produces the on-disk shape of a serialized row.
pub type SerializeFn = Arc<dyn Fn(&SerializedRow) -> MarkdownFile + Send + Sync>;

/// Recovers a serialized row from file content.
pub type DeserializeFn = Arc<dyn Fn(&DeserializeInput<'_>) -> Result<SerializedRow> + Send + Sync>;

/// Per-table overrides for the markdown index.
#[derive(Default, Clone)]
pub struct MarkdownTableConfig {
    /// Custom serializer, or the default when absent
    pub serialize: Option<SerializeFn>,
    /// Custom deserializer, or the default when absent
    pub deserialize: Option<DeserializeFn>,
}

/// The default serializer for a table schema.
///
/// Frontmatter holds every field except the id, in schema order; the body
/// is empty; the filename is `<id>.md`.
pub fn default_serialize(schema: &TableSchema) -> SerializeFn {
    let id_field = schema.id_field().to_string();
    Arc::new(move |row: &SerializedRow| {
        let mut frontmatter = Frontmatter::new();
        let mut id = String::new();
        for (field, value) in row {
            if *field == id_field {
                if let Value::String(s) = value {
                    id = s.clone();
                }
            } else {
                frontmatter.insert(field.clone(), value.clone());
            }
        }
        MarkdownFile {
            frontmatter,
            body: String::new(),
            filename: format!("{id}.md"),
        }
    })
}

/// The default deserializer.
///
/// Takes the id from the file basename, merges it into the frontmatter
/// fields, and validates the result against the table schema.
pub fn default_deserialize() -> DeserializeFn {
    Arc::new(|input: &DeserializeInput<'_>| {
        let id = file_stem(input.filename);
        let mut row: SerializedRow = input.frontmatter.clone();
        row.insert(
            input.table.schema.id_field().to_string(),
            Value::String(id.to_string()),
        );

        match input.table.validator.validate(&row) {
            Validated::Valid(row) => Ok(row),
            Validated::Invalid(errors) => Err(EpicenterError::Validation {
                context: format!("{}/{}", input.table.name, input.filename),
                errors,
            }),
        }
    })
}

/// The basename of a markdown filename without its `.md` extension.
pub fn file_stem(filename: &str) -> &str {
    filename.strip_suffix(".md").unwrap_or(filename)
}

/// Enforce the filename invariant: a plain name, no path separators.
///
/// A violation is a configuration error in the table's `serialize`
/// function, not a data error.
pub fn validate_filename(table: &str, filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(EpicenterError::Config {
            message: format!(
                "table '{table}' serialized a row to illegal filename '{filename}'"
            ),
        });
    }
    Ok(())
}
