//! Row validation.
//!
//! The runtime treats validators as an abstract seam: anything implementing
//! [`Validator`] can guard a table or an action input. The built-in
//! [`SchemaValidator`] validates serialized rows against a [`TableSchema`] —
//! applying defaults, enforcing nullability, type shape, and option
//! membership.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{FieldType, SerializedRow, TableSchema};

/// A single field-level validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    /// The offending field
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    /// Build a field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The outcome of validating an input row.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// The input satisfies the schema; defaults have been applied and field
    /// order normalised to schema order.
    Valid(SerializedRow),
    /// The input violates the schema.
    Invalid(Vec<FieldError>),
}

impl Validated {
    /// The row, if valid.
    pub fn valid(&self) -> Option<&SerializedRow> {
        match self {
            Validated::Valid(row) => Some(row),
            Validated::Invalid(_) => None,
        }
    }

    /// The row, if valid, by value.
    pub fn into_valid(self) -> Option<SerializedRow> {
        match self {
            Validated::Valid(row) => Some(row),
            Validated::Invalid(_) => None,
        }
    }

    /// The field errors, if invalid.
    pub fn errors(&self) -> Option<&[FieldError]> {
        match self {
            Validated::Valid(_) => None,
            Validated::Invalid(errors) => Some(errors),
        }
    }

    /// Whether validation succeeded.
    pub fn is_valid(&self) -> bool {
        matches!(self, Validated::Valid(_))
    }
}

/// Validates serialized rows.
///
/// Implementations must be pure: the same input always produces the same
/// outcome, and `validate` never mutates shared state.
pub trait Validator: Send + Sync {
    /// Validate an input row, producing either the normalised row or the
    /// field-level breakdown of what failed.
    fn validate(&self, input: &SerializedRow) -> Validated;

    /// A validator for the same shape minus the named fields. Omitted
    /// fields are neither required nor permitted in the input.
    fn omit(&self, fields: &[&str]) -> Arc<dyn Validator>;
}

/// The built-in validator over a [`TableSchema`].
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    schema: TableSchema,
    omitted: HashSet<String>,
}

impl SchemaValidator {
    /// Build a validator for a table schema.
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            omitted: HashSet::new(),
        }
    }

    /// The schema this validator enforces.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn check_field(&self, name: &str, ty: &FieldType, value: &Value) -> Option<FieldError> {
        match ty {
            FieldType::Id => match value {
                Value::String(s) if !s.is_empty() => None,
                Value::String(_) => Some(FieldError::new(name, "id must not be empty")),
                _ => Some(FieldError::new(name, "id must be a string")),
            },
            FieldType::Text { nullable, .. } => match value {
                Value::String(_) => None,
                Value::Null if *nullable => None,
                _ => Some(FieldError::new(name, "expected a string")),
            },
            FieldType::RichText => match value {
                Value::String(_) => None,
                _ => Some(FieldError::new(name, "expected a string")),
            },
            FieldType::Integer { nullable, .. } => match value {
                Value::Number(n) if n.as_i64().is_some() => None,
                Value::Null if *nullable => None,
                _ => Some(FieldError::new(name, "expected an integer")),
            },
            FieldType::Real { nullable, .. } => match value {
                Value::Number(n) if n.as_f64().is_some() => None,
                Value::Null if *nullable => None,
                _ => Some(FieldError::new(name, "expected a number")),
            },
            FieldType::Boolean { nullable, .. } => match value {
                Value::Bool(_) => None,
                Value::Null if *nullable => None,
                _ => Some(FieldError::new(name, "expected a boolean")),
            },
            FieldType::Timestamp { nullable, .. } => match value {
                Value::String(s) => match chrono::DateTime::parse_from_rfc3339(s) {
                    Ok(_) => None,
                    Err(_) => Some(FieldError::new(name, "expected an RFC 3339 timestamp")),
                },
                Value::Null if *nullable => None,
                _ => Some(FieldError::new(name, "expected an RFC 3339 timestamp")),
            },
            FieldType::Select {
                options, nullable, ..
            } => match value {
                Value::String(s) if options.iter().any(|o| o == s) => None,
                Value::String(s) => Some(FieldError::new(
                    name,
                    format!("'{s}' is not one of the declared options"),
                )),
                Value::Null if *nullable => None,
                _ => Some(FieldError::new(name, "expected one of the declared options")),
            },
            FieldType::MultiSelect { options, .. } => match value {
                Value::Array(values) => {
                    for v in values {
                        match v {
                            Value::String(s) if options.iter().any(|o| o == s) => {}
                            Value::String(s) => {
                                return Some(FieldError::new(
                                    name,
                                    format!("'{s}' is not one of the declared options"),
                                ));
                            }
                            _ => return Some(FieldError::new(name, "expected an array of strings")),
                        }
                    }
                    None
                }
                _ => Some(FieldError::new(name, "expected an array of strings")),
            },
        }
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, input: &SerializedRow) -> Validated {
        let mut errors = Vec::new();
        let mut normalised = SerializedRow::new();

        for (name, ty) in self.schema.fields() {
            if self.omitted.contains(name) {
                continue;
            }

            let value = match input.get(name) {
                Some(v) => v.clone(),
                None => match ty.default_value() {
                    Some(default) => default,
                    None if ty.is_nullable() => Value::Null,
                    None => {
                        errors.push(FieldError::new(name, "missing required field"));
                        continue;
                    }
                },
            };

            if let Some(err) = self.check_field(name, ty, &value) {
                errors.push(err);
                continue;
            }
            normalised.insert(name.clone(), value);
        }

        for name in input.keys() {
            if self.schema.field(name).is_none() || self.omitted.contains(name) {
                errors.push(FieldError::new(name, "unknown field"));
            }
        }

        if errors.is_empty() {
            Validated::Valid(normalised)
        } else {
            Validated::Invalid(errors)
        }
    }

    fn omit(&self, fields: &[&str]) -> Arc<dyn Validator> {
        let mut omitted = self.omitted.clone();
        omitted.extend(fields.iter().map(|f| f.to_string()));
        Arc::new(SchemaValidator {
            schema: self.schema.clone(),
            omitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts_schema() -> TableSchema {
        TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
            ("content".to_string(), FieldType::RichText),
            (
                "category".to_string(),
                FieldType::select(["tech", "personal", "tutorial"]),
            ),
            (
                "tags".to_string(),
                FieldType::multi_select(["a", "b", "c"]),
            ),
            ("views".to_string(), FieldType::integer().nullable()),
        ])
        .unwrap()
    }

    fn row(value: Value) -> SerializedRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn valid_row_is_normalised_with_defaults() {
        let validator = SchemaValidator::new(posts_schema());
        let validated = validator.validate(&row(json!({
            "id": "a",
            "title": "Hello",
            "category": "tech",
            "tags": ["a"],
        })));

        let normalised = validated.into_valid().expect("row should be valid");
        // Absent rich text defaults to empty, nullable integer to null
        assert_eq!(normalised["content"], json!(""));
        assert_eq!(normalised["views"], Value::Null);
        // Field order follows the schema
        let keys: Vec<_> = normalised.keys().cloned().collect();
        assert_eq!(keys, ["id", "title", "content", "category", "tags", "views"]);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let validator = SchemaValidator::new(posts_schema());
        let validated = validator.validate(&row(json!({
            "id": "a",
            "category": "tech",
            "tags": [],
        })));

        let errors = validated.errors().expect("row should be invalid");
        assert!(errors.iter().any(|e| e.field == "title"));
    }

    #[test]
    fn select_membership_is_enforced() {
        let validator = SchemaValidator::new(posts_schema());
        let validated = validator.validate(&row(json!({
            "id": "a",
            "title": "Hello",
            "category": "bogus",
            "tags": ["a", "z"],
        })));

        let errors = validated.errors().unwrap();
        assert!(errors.iter().any(|e| e.field == "category"));
        assert!(errors.iter().any(|e| e.field == "tags"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let validator = SchemaValidator::new(posts_schema());
        let validated = validator.validate(&row(json!({
            "id": "a",
            "title": "Hello",
            "category": "tech",
            "tags": [],
            "extra": 1,
        })));
        let errors = validated.errors().unwrap();
        assert!(errors.iter().any(|e| e.field == "extra"));
    }

    #[test]
    fn omit_drops_fields_from_both_sides() {
        let validator = SchemaValidator::new(posts_schema());
        let without_id = validator.omit(&["id"]);

        // No longer required...
        let validated = without_id.validate(&row(json!({
            "title": "Hello",
            "category": "tech",
            "tags": [],
        })));
        assert!(validated.is_valid());

        // ...and no longer permitted.
        let validated = without_id.validate(&row(json!({
            "id": "a",
            "title": "Hello",
            "category": "tech",
            "tags": [],
        })));
        assert!(!validated.is_valid());
    }

    #[test]
    fn timestamps_must_parse() {
        let schema = TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("at".to_string(), FieldType::timestamp()),
        ])
        .unwrap();
        let validator = SchemaValidator::new(schema);

        assert!(
            validator
                .validate(&row(json!({"id": "a", "at": "2026-08-01T12:00:00Z"})))
                .is_valid()
        );
        assert!(
            !validator
                .validate(&row(json!({"id": "a", "at": "yesterday"})))
                .is_valid()
        );
    }
}
