//! Row materialisation between yrs structures and serialized rows.
//!
//! Scalar fields are stored as plain values, rich text as a nested `Y.Text`
//! and multi-select as a nested `Y.Array` of strings, so concurrent edits to
//! those fields merge at the CRDT level instead of last-writer-wins.

use std::collections::HashSet;

use serde_json::Value;
use yrs::types::text::TextPrelim;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Text,
    TextRef, TransactionMut,
};

use crate::schema::{FieldType, SerializedRow, TableSchema};

/// Convert a yrs scalar to its JSON form.
pub(crate) fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        _ => Value::Null,
    }
}

/// Convert a JSON scalar to its yrs form.
pub(crate) fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::from(i),
            None => Any::from(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Any::from(s.as_str()),
        Value::Array(items) => Any::from(items.iter().map(json_to_any).collect::<Vec<_>>()),
        Value::Object(_) => Any::Null,
    }
}

fn string_items(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Write a complete row as a fresh nested map under `id`.
///
/// Any previous value under the same key is replaced wholesale; callers that
/// need to preserve field identity go through [`apply_row_fields`] instead.
pub(crate) fn write_full_row(
    txn: &mut TransactionMut,
    table: &MapRef,
    id: &str,
    row: &SerializedRow,
    schema: &TableSchema,
) {
    let row_map: MapRef = table.insert(txn, id, MapPrelim::default());
    for (field, value) in row {
        let Some(ty) = schema.field(field) else {
            continue;
        };
        match ty {
            FieldType::RichText => {
                let content = value.as_str().unwrap_or_default();
                row_map.insert(txn, field.as_str(), TextPrelim::new(content));
            }
            FieldType::MultiSelect { .. } => {
                let array: ArrayRef = row_map.insert(txn, field.as_str(), ArrayPrelim::default());
                for item in string_items(value) {
                    array.push_back(txn, Any::from(item));
                }
            }
            _ => {
                row_map.insert(txn, field.as_str(), json_to_any(value));
            }
        }
    }
}

/// Apply a field-level diff onto an existing row map.
///
/// Untouched fields keep their CRDT identity: rich text receives a minimal
/// splice, multi-select a set difference against the stored sequence, and
/// scalars an overwrite.
pub(crate) fn apply_row_fields(
    txn: &mut TransactionMut,
    row_map: &MapRef,
    fields: &SerializedRow,
    schema: &TableSchema,
) {
    for (field, value) in fields {
        let Some(ty) = schema.field(field) else {
            continue;
        };
        match ty {
            FieldType::RichText => {
                let content = value.as_str().unwrap_or_default();
                match row_map.get(&*txn, field) {
                    Some(Out::YText(text)) => set_text_diff(txn, &text, content),
                    _ => {
                        row_map.insert(txn, field.as_str(), TextPrelim::new(content));
                    }
                }
            }
            FieldType::MultiSelect { .. } => {
                let target = string_items(value);
                match row_map.get(&*txn, field) {
                    Some(Out::YArray(array)) => set_multi_select(txn, &array, &target),
                    _ => {
                        let array: ArrayRef =
                            row_map.insert(txn, field.as_str(), ArrayPrelim::default());
                        for item in target {
                            array.push_back(txn, Any::from(item));
                        }
                    }
                }
            }
            _ => {
                row_map.insert(txn, field.as_str(), json_to_any(value));
            }
        }
    }
}

/// Read a row map back into its serialized form, in schema field order.
pub(crate) fn read_row<T: ReadTxn>(txn: &T, row_map: &MapRef, schema: &TableSchema) -> SerializedRow {
    let mut row = SerializedRow::new();
    for (field, ty) in schema.fields() {
        let Some(out) = row_map.get(txn, field) else {
            continue;
        };
        let value = match (ty, out) {
            (FieldType::RichText, Out::YText(text)) => Value::String(text.get_string(txn)),
            (FieldType::MultiSelect { .. }, Out::YArray(array)) => Value::Array(
                array
                    .iter(txn)
                    .filter_map(|item| match item {
                        Out::Any(any) => match any_to_json(&any) {
                            Value::String(s) => Some(Value::String(s)),
                            _ => None,
                        },
                        _ => None,
                    })
                    .collect(),
            ),
            (_, Out::Any(any)) => any_to_json(&any),
            _ => continue,
        };
        row.insert(field.clone(), value);
    }
    row
}

/// Replace a text's content with a minimal common prefix/suffix splice.
///
/// Instead of delete-all + insert-all (which breaks CRDT merging), only the
/// changed span is removed and reinserted, so operation identity is
/// preserved where content has not changed. Offsets are in bytes, aligned
/// to char boundaries.
pub(crate) fn set_text_diff(txn: &mut TransactionMut, text: &TextRef, new: &str) {
    let current = text.get_string(&*txn);
    if current == new {
        return;
    }

    let prefix = common_prefix_bytes(&current, new);
    let suffix = common_suffix_bytes(&current[prefix..], &new[prefix..]);

    let delete_len = current.len() - prefix - suffix;
    if delete_len > 0 {
        text.remove_range(txn, prefix as u32, delete_len as u32);
    }

    let insert_chunk = &new[prefix..new.len() - suffix];
    if !insert_chunk.is_empty() {
        text.insert(txn, prefix as u32, insert_chunk);
    }
}

fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

fn common_suffix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().rev().zip(b.chars().rev()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

/// Reconcile a stored multi-select sequence with a target set.
///
/// Removals and insertions are applied as per-element sequence operations
/// so concurrent edits to the same field merge sensibly.
pub(crate) fn set_multi_select(txn: &mut TransactionMut, array: &ArrayRef, target: &[String]) {
    let current: Vec<String> = array
        .iter(&*txn)
        .filter_map(|item| match item {
            Out::Any(Any::String(s)) => Some(s.to_string()),
            _ => None,
        })
        .collect();

    let target_set: HashSet<&str> = target.iter().map(String::as_str).collect();
    let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();

    // Remove back-to-front so remaining indices stay valid
    for index in (0..current.len()).rev() {
        if !target_set.contains(current[index].as_str()) {
            array.remove(txn, index as u32);
        }
    }

    for item in target {
        if !current_set.contains(item.as_str()) {
            array.push_back(txn, Any::from(item.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkspaceDoc;
    use serde_json::json;
    use yrs::Transact;

    fn posts_schema() -> TableSchema {
        TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
            ("content".to_string(), FieldType::RichText),
            ("tags".to_string(), FieldType::multi_select(["a", "b", "c"])),
            ("views".to_string(), FieldType::integer().nullable()),
        ])
        .unwrap()
    }

    fn row(value: serde_json::Value) -> SerializedRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn full_row_round_trips() {
        let doc = WorkspaceDoc::new("ws");
        let table = doc.table_map("posts");
        let schema = posts_schema();
        let input = row(json!({
            "id": "x",
            "title": "Hello",
            "content": "Body text",
            "tags": ["a", "b"],
            "views": 3,
        }));

        {
            let mut txn = doc.doc().transact_mut();
            write_full_row(&mut txn, &table, "x", &input, &schema);
        }

        let txn = doc.doc().transact();
        let row_map = match table.get(&txn, "x") {
            Some(Out::YMap(map)) => map,
            other => panic!("expected a row map, got {other:?}"),
        };
        let back = read_row(&txn, &row_map, &schema);
        assert_eq!(back, input);
    }

    #[test]
    fn scalar_update_overwrites_only_named_fields() {
        let doc = WorkspaceDoc::new("ws");
        let table = doc.table_map("posts");
        let schema = posts_schema();
        let input = row(json!({
            "id": "x",
            "title": "Hello",
            "content": "Body",
            "tags": [],
            "views": 1,
        }));

        {
            let mut txn = doc.doc().transact_mut();
            write_full_row(&mut txn, &table, "x", &input, &schema);
        }
        {
            let mut txn = doc.doc().transact_mut();
            let row_map = match table.get(&txn, "x") {
                Some(Out::YMap(map)) => map,
                _ => unreachable!(),
            };
            apply_row_fields(
                &mut txn,
                &row_map,
                &row(json!({"views": 2})),
                &schema,
            );
        }

        let txn = doc.doc().transact();
        let row_map = match table.get(&txn, "x") {
            Some(Out::YMap(map)) => map,
            _ => unreachable!(),
        };
        let back = read_row(&txn, &row_map, &schema);
        assert_eq!(back["views"], json!(2));
        assert_eq!(back["title"], json!("Hello"));
    }

    #[test]
    fn text_diff_preserves_unchanged_span() {
        let doc = WorkspaceDoc::new("ws");
        let table = doc.table_map("posts");
        let schema = posts_schema();
        let input = row(json!({
            "id": "x", "title": "t", "content": "Hello brave world", "tags": [], "views": null,
        }));
        {
            let mut txn = doc.doc().transact_mut();
            write_full_row(&mut txn, &table, "x", &input, &schema);
        }
        {
            let mut txn = doc.doc().transact_mut();
            let row_map = match table.get(&txn, "x") {
                Some(Out::YMap(map)) => map,
                _ => unreachable!(),
            };
            let text = match row_map.get(&txn, "content") {
                Some(Out::YText(text)) => text,
                _ => unreachable!(),
            };
            set_text_diff(&mut txn, &text, "Hello new world");
        }

        let txn = doc.doc().transact();
        let row_map = match table.get(&txn, "x") {
            Some(Out::YMap(map)) => map,
            _ => unreachable!(),
        };
        let back = read_row(&txn, &row_map, &schema);
        assert_eq!(back["content"], json!("Hello new world"));
    }

    #[test]
    fn multi_select_applies_set_difference() {
        let doc = WorkspaceDoc::new("ws");
        let table = doc.table_map("posts");
        let schema = posts_schema();
        let input = row(json!({
            "id": "x", "title": "t", "content": "", "tags": ["a", "b"], "views": null,
        }));
        {
            let mut txn = doc.doc().transact_mut();
            write_full_row(&mut txn, &table, "x", &input, &schema);
        }
        {
            let mut txn = doc.doc().transact_mut();
            let row_map = match table.get(&txn, "x") {
                Some(Out::YMap(map)) => map,
                _ => unreachable!(),
            };
            let array = match row_map.get(&txn, "tags") {
                Some(Out::YArray(array)) => array,
                _ => unreachable!(),
            };
            set_multi_select(&mut txn, &array, &["b".to_string(), "c".to_string()]);
        }

        let txn = doc.doc().transact();
        let row_map = match table.get(&txn, "x") {
            Some(Out::YMap(map)) => map,
            _ => unreachable!(),
        };
        let back = read_row(&txn, &row_map, &schema);
        assert_eq!(back["tags"], json!(["b", "c"]));
    }

    #[test]
    fn diff_helpers_handle_multibyte_content() {
        assert_eq!(common_prefix_bytes("héllo", "héllx"), "héll".len());
        assert_eq!(common_suffix_bytes("aé", "bé"), "é".len());
    }
}
