//! Declarative table schemas.
//!
//! A workspace declares its tables as maps from field name to
//! [`FieldType`] descriptor. Exactly one field per table must be the
//! [`FieldType::Id`] primary key; every other descriptor carries its own
//! nullability and default configuration.
//!
//! Rows cross every boundary (disk, SQL, actions) in their serialized form:
//! a plain ordered map of JSON values ([`SerializedRow`]). Rich-text and
//! multi-select fields keep their CRDT identity inside the document and
//! appear here as a string / string array.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EpicenterError, Result};

/// The plain-value shape of a row: field name to scalar/array JSON value.
///
/// This is the `toJSON()` form used for disk, network, and relational
/// storage. Field order follows the table schema.
pub type SerializedRow = IndexMap<String, Value>;

/// A field descriptor within a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// The primary-key field. Exactly one per table; value is a non-empty
    /// string, immutable after insert.
    Id,
    /// A plain text field.
    Text {
        /// Whether null/absent is a legal stored value
        #[serde(default)]
        nullable: bool,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Collaborative text. Backed by a CRDT text type inside the document;
    /// serialized as a plain string. Absent on entry means empty.
    RichText,
    /// A 64-bit integer field.
    Integer {
        /// Whether null/absent is a legal stored value
        #[serde(default)]
        nullable: bool,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<i64>,
    },
    /// A 64-bit float field.
    Real {
        /// Whether null/absent is a legal stored value
        #[serde(default)]
        nullable: bool,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
    },
    /// A boolean field.
    Boolean {
        /// Whether null/absent is a legal stored value
        #[serde(default)]
        nullable: bool,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
    },
    /// An RFC 3339 timestamp field, serialized as a string.
    Timestamp {
        /// Whether null/absent is a legal stored value
        #[serde(default)]
        nullable: bool,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// One value out of a fixed option set.
    Select {
        /// The legal values
        options: Vec<String>,
        /// Whether null/absent is a legal stored value
        #[serde(default)]
        nullable: bool,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// A set of values out of a fixed option set. Backed by a CRDT sequence
    /// inside the document so concurrent edits merge; serialized as a
    /// string array. Absent on entry means the default (or empty).
    MultiSelect {
        /// The legal values
        options: Vec<String>,
        /// Value applied when the field is absent on entry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Vec<String>>,
    },
}

impl FieldType {
    /// A non-nullable text field with no default.
    pub fn text() -> Self {
        FieldType::Text {
            nullable: false,
            default: None,
        }
    }

    /// A non-nullable integer field with no default.
    pub fn integer() -> Self {
        FieldType::Integer {
            nullable: false,
            default: None,
        }
    }

    /// A non-nullable real field with no default.
    pub fn real() -> Self {
        FieldType::Real {
            nullable: false,
            default: None,
        }
    }

    /// A non-nullable boolean field with no default.
    pub fn boolean() -> Self {
        FieldType::Boolean {
            nullable: false,
            default: None,
        }
    }

    /// A non-nullable timestamp field with no default.
    pub fn timestamp() -> Self {
        FieldType::Timestamp {
            nullable: false,
            default: None,
        }
    }

    /// A non-nullable select field over the given options.
    pub fn select<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldType::Select {
            options: options.into_iter().map(Into::into).collect(),
            nullable: false,
            default: None,
        }
    }

    /// A multi-select field over the given options.
    pub fn multi_select<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldType::MultiSelect {
            options: options.into_iter().map(Into::into).collect(),
            default: None,
        }
    }

    /// Return this descriptor with nullability enabled.
    ///
    /// No effect on `Id`, `RichText`, and `MultiSelect`, which have no
    /// nullable form.
    pub fn nullable(self) -> Self {
        match self {
            FieldType::Text { default, .. } => FieldType::Text {
                nullable: true,
                default,
            },
            FieldType::Integer { default, .. } => FieldType::Integer {
                nullable: true,
                default,
            },
            FieldType::Real { default, .. } => FieldType::Real {
                nullable: true,
                default,
            },
            FieldType::Boolean { default, .. } => FieldType::Boolean {
                nullable: true,
                default,
            },
            FieldType::Timestamp { default, .. } => FieldType::Timestamp {
                nullable: true,
                default,
            },
            FieldType::Select {
                options, default, ..
            } => FieldType::Select {
                options,
                nullable: true,
                default,
            },
            other => other,
        }
    }

    /// Return this descriptor with a default value, given as a JSON value
    /// matching the field shape. Values of the wrong shape are ignored.
    pub fn with_default(self, value: Value) -> Self {
        match (self, value) {
            (FieldType::Text { nullable, .. }, Value::String(s)) => FieldType::Text {
                nullable,
                default: Some(s),
            },
            (FieldType::Integer { nullable, .. }, Value::Number(n)) => FieldType::Integer {
                nullable,
                default: n.as_i64(),
            },
            (FieldType::Real { nullable, .. }, Value::Number(n)) => FieldType::Real {
                nullable,
                default: n.as_f64(),
            },
            (FieldType::Boolean { nullable, .. }, Value::Bool(b)) => FieldType::Boolean {
                nullable,
                default: Some(b),
            },
            (FieldType::Timestamp { nullable, .. }, Value::String(s)) => FieldType::Timestamp {
                nullable,
                default: chrono::DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&chrono::Utc)),
            },
            (
                FieldType::Select {
                    options, nullable, ..
                },
                Value::String(s),
            ) => FieldType::Select {
                options,
                nullable,
                default: Some(s),
            },
            (FieldType::MultiSelect { options, .. }, Value::Array(values)) => {
                let default = values
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect();
                FieldType::MultiSelect {
                    options,
                    default: Some(default),
                }
            }
            (other, _) => other,
        }
    }

    /// The default value for an absent field, if this descriptor has one.
    pub fn default_value(&self) -> Option<Value> {
        match self {
            FieldType::Id => None,
            FieldType::Text { default, .. } => default.clone().map(Value::String),
            // Absent rich text means empty content
            FieldType::RichText => Some(Value::String(String::new())),
            FieldType::Integer { default, .. } => default.map(Value::from),
            FieldType::Real { default, .. } => default.map(Value::from),
            FieldType::Boolean { default, .. } => default.map(Value::Bool),
            FieldType::Timestamp { default, .. } => {
                default.map(|dt| Value::String(dt.to_rfc3339()))
            }
            FieldType::Select { default, .. } => default.clone().map(Value::String),
            FieldType::MultiSelect { default, .. } => default
                .clone()
                .map(|values| Value::Array(values.into_iter().map(Value::String).collect())),
        }
    }

    /// Whether null/absent is a legal stored value for this field.
    pub fn is_nullable(&self) -> bool {
        match self {
            FieldType::Id | FieldType::RichText | FieldType::MultiSelect { .. } => false,
            FieldType::Text { nullable, .. }
            | FieldType::Integer { nullable, .. }
            | FieldType::Real { nullable, .. }
            | FieldType::Boolean { nullable, .. }
            | FieldType::Timestamp { nullable, .. }
            | FieldType::Select { nullable, .. } => *nullable,
        }
    }
}

/// The schema of one table: field name to descriptor, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    fields: IndexMap<String, FieldType>,
    id_field: String,
}

impl TableSchema {
    /// Build a table schema from field declarations.
    ///
    /// # Errors
    ///
    /// Fails with [`EpicenterError::Config`] unless the declarations contain
    /// exactly one [`FieldType::Id`] field.
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        let fields: IndexMap<String, FieldType> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let mut id_fields = fields
            .iter()
            .filter(|(_, ty)| matches!(ty, FieldType::Id))
            .map(|(name, _)| name.clone());

        let id_field = id_fields.next().ok_or_else(|| EpicenterError::Config {
            message: "table schema has no id field".to_string(),
        })?;
        if id_fields.next().is_some() {
            return Err(EpicenterError::Config {
                message: "table schema has more than one id field".to_string(),
            });
        }

        Ok(Self { fields, id_field })
    }

    /// The name of the primary-key field.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// The field declarations, in declaration order.
    pub fn fields(&self) -> &IndexMap<String, FieldType> {
        &self.fields
    }

    /// Look up one field descriptor.
    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// Extract the id value from a serialized row, if present and a string.
    pub fn row_id<'a>(&self, row: &'a SerializedRow) -> Option<&'a str> {
        row.get(&self.id_field).and_then(Value::as_str)
    }
}

/// The schemas of every table in a workspace, keyed by table name.
pub type WorkspaceSchema = IndexMap<String, TableSchema>;
