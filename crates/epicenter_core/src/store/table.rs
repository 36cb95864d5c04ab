//! Typed table operations over the workspace document.
//!
//! The [`Table`] helper is the only writer of its root map. Every mutation
//! validates on entry, commits inside one atomic transaction, and then fans
//! the result out to registered observers in commit order.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use yrs::{Map, MapRef, Out, Transact};

use super::doc::WorkspaceDoc;
use super::observer::{ObserverHandle, Registry, TableObserver};
use super::value;
use crate::error::{EpicenterError, Result};
use crate::schema::{SerializedRow, TableSchema};
use crate::validator::{FieldError, SchemaValidator, Validated, Validator};

/// One table inside a workspace: a keyed collection of validated rows.
pub struct Table {
    name: String,
    doc: Arc<WorkspaceDoc>,
    map: MapRef,
    schema: TableSchema,
    validator: Arc<dyn Validator>,
    observers: Arc<Mutex<Registry>>,
}

impl Table {
    /// Create the helper for a table, backed by the given document.
    pub fn new(doc: Arc<WorkspaceDoc>, name: impl Into<String>, schema: TableSchema) -> Self {
        let name = name.into();
        let map = doc.table_map(&name);
        let validator: Arc<dyn Validator> = Arc::new(SchemaValidator::new(schema.clone()));
        Self {
            name,
            doc,
            map,
            schema,
            validator,
            observers: Arc::new(Mutex::new(Registry::new())),
        }
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The validator enforced on entry.
    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    /// The document this table lives in.
    pub fn doc(&self) -> &Arc<WorkspaceDoc> {
        &self.doc
    }

    /// Insert a new row.
    ///
    /// A missing id field is minted as a UUID before validation. Fails with
    /// [`EpicenterError::DuplicateId`] if the id already exists, or
    /// [`EpicenterError::Validation`] if the row does not satisfy the
    /// schema. Observers see one `on_add` after the transaction commits.
    pub async fn insert(&self, mut row: SerializedRow) -> Result<SerializedRow> {
        let id_field = self.schema.id_field().to_string();
        if !row.contains_key(&id_field) {
            row.insert(id_field, Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let row = self.validate(&row)?;
        let id = self.require_id(&row)?;

        {
            let mut txn = self.doc.doc().transact_mut();
            if self.map.get(&txn, &id).is_some() {
                return Err(EpicenterError::DuplicateId {
                    table: self.name.clone(),
                    id,
                });
            }
            value::write_full_row(&mut txn, &self.map, &id, &row, &self.schema);
        }

        self.dispatch_add(&Validated::Valid(row.clone())).await;
        Ok(row)
    }

    /// Insert the row if its id is absent, fully replace it otherwise.
    ///
    /// Observers see `on_add` or `on_update` accordingly. Replacement is
    /// applied field by field so rich-text and multi-select fields keep
    /// their CRDT identity.
    pub async fn upsert(&self, row: SerializedRow) -> Result<SerializedRow> {
        let row = self.validate(&row)?;
        let id = self.require_id(&row)?;

        let existed;
        {
            let mut txn = self.doc.doc().transact_mut();
            match self.map.get(&txn, &id) {
                Some(Out::YMap(row_map)) => {
                    existed = true;
                    value::apply_row_fields(&mut txn, &row_map, &row, &self.schema);
                }
                _ => {
                    existed = false;
                    value::write_full_row(&mut txn, &self.map, &id, &row, &self.schema);
                }
            }
        }

        let validated = Validated::Valid(row.clone());
        if existed {
            self.dispatch_update(&validated).await;
        } else {
            self.dispatch_add(&validated).await;
        }
        Ok(row)
    }

    /// Apply a partial update to an existing row.
    ///
    /// The partial must carry the id. Only the named fields are touched;
    /// the merged row is validated before anything is written. Fails with
    /// [`EpicenterError::NotFound`] for an unknown id.
    pub async fn update(&self, partial: SerializedRow) -> Result<SerializedRow> {
        let id = match self.schema.row_id(&partial) {
            Some(id) => id.to_string(),
            None => {
                return Err(EpicenterError::Validation {
                    context: self.name.clone(),
                    errors: vec![FieldError::new(
                        self.schema.id_field(),
                        "update requires an id",
                    )],
                });
            }
        };

        let current = {
            let txn = self.doc.doc().transact();
            match self.map.get(&txn, &id) {
                Some(Out::YMap(row_map)) => value::read_row(&txn, &row_map, &self.schema),
                _ => {
                    return Err(EpicenterError::NotFound {
                        table: self.name.clone(),
                        id,
                    });
                }
            }
        };

        let mut merged = current;
        for (field, fresh) in &partial {
            merged.insert(field.clone(), fresh.clone());
        }
        let merged = self.validate(&merged)?;

        {
            let mut txn = self.doc.doc().transact_mut();
            match self.map.get(&txn, &id) {
                Some(Out::YMap(row_map)) => {
                    // Only touch the fields named by the partial
                    let mut changed = SerializedRow::new();
                    for field in partial.keys() {
                        if let Some(v) = merged.get(field) {
                            changed.insert(field.clone(), v.clone());
                        }
                    }
                    value::apply_row_fields(&mut txn, &row_map, &changed, &self.schema);
                }
                _ => {
                    return Err(EpicenterError::NotFound {
                        table: self.name.clone(),
                        id,
                    });
                }
            }
        }

        self.dispatch_update(&Validated::Valid(merged.clone())).await;
        Ok(merged)
    }

    /// Delete a row by id. Deleting an unknown id is a silent no-op.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = {
            let mut txn = self.doc.doc().transact_mut();
            self.map.remove(&mut txn, id).is_some()
        };
        if removed {
            self.dispatch_delete(id).await;
        }
        Ok(())
    }

    /// Remove every row in one transaction.
    ///
    /// Observers see one `on_delete` per row, in the map's iteration order.
    pub async fn clear(&self) -> Result<()> {
        let ids: Vec<String> = {
            let mut txn = self.doc.doc().transact_mut();
            let ids: Vec<String> = self
                .map
                .iter(&txn)
                .map(|(key, _)| key.to_string())
                .collect();
            for id in &ids {
                self.map.remove(&mut txn, id);
            }
            ids
        };

        for id in &ids {
            self.dispatch_delete(id).await;
        }
        Ok(())
    }

    /// Read a row by id, validated against the schema.
    ///
    /// # Errors
    ///
    /// Fails with [`EpicenterError::NotFound`] for an unknown id; use
    /// [`has`](Table::has) for non-erroring membership checks.
    pub fn get(&self, id: &str) -> Result<Validated> {
        let txn = self.doc.doc().transact();
        match self.map.get(&txn, id) {
            Some(Out::YMap(row_map)) => {
                let raw = value::read_row(&txn, &row_map, &self.schema);
                Ok(self.validator.validate(&raw))
            }
            _ => Err(EpicenterError::NotFound {
                table: self.name.clone(),
                id: id.to_string(),
            }),
        }
    }

    /// Whether a row with this id exists.
    pub fn has(&self, id: &str) -> bool {
        let txn = self.doc.doc().transact();
        self.map.get(&txn, id).is_some()
    }

    /// Read every row, validated, in the map's iteration order.
    pub fn get_all(&self) -> Vec<Validated> {
        let txn = self.doc.doc().transact();
        self.map
            .iter(&txn)
            .filter_map(|(_, out)| match out {
                Out::YMap(row_map) => {
                    let raw = value::read_row(&txn, &row_map, &self.schema);
                    Some(self.validator.validate(&raw))
                }
                _ => None,
            })
            .collect()
    }

    /// Number of rows in the table.
    pub fn len(&self) -> usize {
        let txn = self.doc.doc().transact();
        self.map.len(&txn) as usize
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an observer. Events already emitted are not replayed.
    pub fn observe(&self, observer: Arc<dyn TableObserver>) -> ObserverHandle {
        let id = self.observers.lock().unwrap().register(observer);
        ObserverHandle::new(id, &self.observers)
    }

    fn validate(&self, row: &SerializedRow) -> Result<SerializedRow> {
        match self.validator.validate(row) {
            Validated::Valid(row) => Ok(row),
            Validated::Invalid(errors) => Err(EpicenterError::Validation {
                context: self.name.clone(),
                errors,
            }),
        }
    }

    fn require_id(&self, row: &SerializedRow) -> Result<String> {
        self.schema
            .row_id(row)
            .map(str::to_string)
            .ok_or_else(|| EpicenterError::Validation {
                context: self.name.clone(),
                errors: vec![FieldError::new(self.schema.id_field(), "missing id")],
            })
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn TableObserver>> {
        self.observers.lock().unwrap().snapshot()
    }

    async fn dispatch_add(&self, row: &Validated) {
        for observer in self.observer_snapshot() {
            observer.on_add(row).await;
        }
    }

    async fn dispatch_update(&self, row: &Validated) {
        for observer in self.observer_snapshot() {
            observer.on_update(row).await;
        }
    }

    async fn dispatch_delete(&self, id: &str) {
        for observer in self.observer_snapshot() {
            observer.on_delete(id).await;
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("rows", &self.len())
            .finish()
    }
}
