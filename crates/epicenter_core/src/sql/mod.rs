//! Relational projection of the CRDT tables.
//!
//! Every table is mirrored into an embedded SQLite database so actions can
//! run plain SQL against current workspace state. The projection is a
//! derived view: it is cleared and rebuilt from the CRDT on attach, kept in
//! sync by a table observer afterwards, and can always be thrown away.
//!
//! # Thread Safety
//!
//! The connection is wrapped in a `Mutex` for thread-safe access. SQLite
//! itself runs in WAL mode with a single writer (the observer); action
//! consumers receive a [`SqlHandle`] restricted to read-only statements.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params_from_iter};
use serde_json::Value;

use crate::BoxFuture;
use crate::error::{EpicenterError, Result};
use crate::schema::{FieldType, SerializedRow, TableSchema};
use crate::store::{ObserverHandle, Table, TableObserver};
use crate::validator::Validated;

/// The SQL index for one workspace.
pub struct SqlIndex {
    conn: Arc<Mutex<Connection>>,
    observer_handles: Vec<ObserverHandle>,
}

impl SqlIndex {
    /// Open (or create) the database file and project every table into it.
    ///
    /// Existing rows are removed first: the SQL store mirrors exactly the
    /// current CRDT contents after attach. Registers one observer per
    /// table before returning.
    pub async fn attach(path: &Path, tables: &[Arc<Table>]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::attach_with_connection(conn, tables)
    }

    /// Project into an in-memory database. Data is lost on destroy; used
    /// by tests.
    pub fn in_memory(tables: &[Arc<Table>]) -> Result<Self> {
        Self::attach_with_connection(Connection::open_in_memory()?, tables)
    }

    fn attach_with_connection(conn: Connection, tables: &[Arc<Table>]) -> Result<Self> {
        let conn = Arc::new(Mutex::new(conn));

        for table in tables {
            create_table(&conn.lock().unwrap(), table.name(), table.schema())?;
            backfill(&conn.lock().unwrap(), table)?;
        }

        let observer_handles = tables
            .iter()
            .map(|table| {
                let observer = Arc::new(SqlObserver {
                    conn: Arc::clone(&conn),
                    table: table.name().to_string(),
                    schema: table.schema().clone(),
                });
                table.observe(observer)
            })
            .collect();

        Ok(Self {
            conn,
            observer_handles,
        })
    }

    /// A read-only handle for action consumers.
    pub fn handle(&self) -> SqlHandle {
        SqlHandle {
            conn: Arc::clone(&self.conn),
        }
    }

    /// Unsubscribe the observers, checkpoint the write-ahead log, and close
    /// the database.
    pub async fn destroy(mut self) {
        self.observer_handles.clear();
        {
            let conn = self.conn.lock().unwrap();
            let checkpoint =
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()));
            if let Err(e) = checkpoint {
                log::warn!("failed to checkpoint WAL: {e}");
            }
        }
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex.into_inner().unwrap();
                if let Err((_, e)) = conn.close() {
                    log::warn!("failed to close SQL database: {e}");
                }
            }
            Err(shared) => {
                // Readers still hold handles; the connection closes when
                // the last one drops.
                log::debug!(
                    "SQL connection still shared at destroy ({} handles)",
                    Arc::strong_count(&shared)
                );
            }
        }
    }
}

/// Read-only access to the projected database.
///
/// Only statements SQLite reports as read-only are accepted; anything else
/// fails with an [`EpicenterError::Index`] before execution.
#[derive(Clone)]
pub struct SqlHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SqlHandle {
    /// Run a SELECT and map every result row.
    pub fn query_map<T, F>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        mut f: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(EpicenterError::Index {
                index: "sql".to_string(),
                message: "the SQL handle is read-only".to_string(),
            });
        }
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(f(row)?);
        }
        Ok(out)
    }

    /// Run a SELECT expected to produce exactly one row.
    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn rusqlite::ToSql], f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(EpicenterError::Index {
                index: "sql".to_string(),
                message: "the SQL handle is read-only".to_string(),
            });
        }
        Ok(stmt.query_row(params_from_iter(params.iter()), f)?)
    }
}

/// Index provider attaching a [`SqlIndex`] at
/// `<epicenter-dir>/<workspace-id>.db`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlProvider;

impl crate::workspace::IndexProvider for SqlProvider {
    fn name(&self) -> &str {
        "sql"
    }

    fn attach<'a>(
        &'a self,
        ctx: &'a crate::workspace::IndexContext,
    ) -> BoxFuture<'a, Result<crate::workspace::IndexHandle>> {
        Box::pin(async move {
            let path = ctx.paths.sql_database(&ctx.workspace_id);
            let index = SqlIndex::attach(path.as_path(), &ctx.table_list()).await?;
            let handle = index.handle();
            Ok(crate::workspace::IndexHandle {
                exports: crate::workspace::IndexExports::Sql(handle),
                destroy: Some(Box::new(move || -> BoxFuture<'static, ()> {
                    Box::pin(index.destroy())
                })),
            })
        })
    }
}

struct SqlObserver {
    conn: Arc<Mutex<Connection>>,
    table: String,
    schema: TableSchema,
}

impl TableObserver for SqlObserver {
    fn on_add<'a>(&'a self, row: &'a Validated) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(row) = row.valid() else { return };
            let conn = self.conn.lock().unwrap();
            if let Err(e) = insert_row(&conn, &self.table, &self.schema, row) {
                log::warn!("SQL projection insert failed for '{}': {e}", self.table);
            }
        })
    }

    fn on_update<'a>(&'a self, row: &'a Validated) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(row) = row.valid() else { return };
            let conn = self.conn.lock().unwrap();
            if let Err(e) = update_row(&conn, &self.table, &self.schema, row) {
                log::warn!("SQL projection update failed for '{}': {e}", self.table);
            }
        })
    }

    fn on_delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().unwrap();
            let sql = format!(
                r#"DELETE FROM "{}" WHERE "{}" = ?1"#,
                self.table,
                self.schema.id_field()
            );
            if let Err(e) = conn.execute(&sql, [id]) {
                log::warn!("SQL projection delete failed for '{}': {e}", self.table);
            }
        })
    }
}

fn create_table(conn: &Connection, table: &str, schema: &TableSchema) -> Result<()> {
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|(name, ty)| format!(r#""{name}" {}"#, column_ddl(ty)))
        .collect();
    conn.execute_batch(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{table}" ({});"#,
        columns.join(", ")
    ))?;
    Ok(())
}

fn column_ddl(ty: &FieldType) -> String {
    let (sql_type, not_null): (&str, bool) = match ty {
        FieldType::Id => return "TEXT PRIMARY KEY NOT NULL".to_string(),
        FieldType::Text { nullable, .. } => ("TEXT", !nullable),
        FieldType::RichText => ("TEXT", true),
        FieldType::Integer { nullable, .. } => ("INTEGER", !nullable),
        FieldType::Real { nullable, .. } => ("REAL", !nullable),
        FieldType::Boolean { nullable, .. } => ("INTEGER", !nullable),
        FieldType::Timestamp { nullable, .. } => ("TEXT", !nullable),
        FieldType::Select { nullable, .. } => ("TEXT", !nullable),
        FieldType::MultiSelect { .. } => ("TEXT", true),
    };

    let mut ddl = sql_type.to_string();
    if not_null {
        ddl.push_str(" NOT NULL");
    }
    if let Some(default) = ty.default_value() {
        ddl.push_str(&format!(" DEFAULT {}", sql_literal(&default)));
    }
    ddl
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Convert a serialized field value to its SQL storage form.
fn to_sql_value(ty: &FieldType, value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match (ty, value) {
        (_, Value::Null) => Sql::Null,
        (FieldType::Boolean { .. }, Value::Bool(b)) => Sql::Integer(*b as i64),
        (FieldType::Integer { .. }, Value::Number(n)) => {
            n.as_i64().map(Sql::Integer).unwrap_or(Sql::Null)
        }
        (FieldType::Real { .. }, Value::Number(n)) => {
            n.as_f64().map(Sql::Real).unwrap_or(Sql::Null)
        }
        (FieldType::MultiSelect { .. }, v) => Sql::Text(v.to_string()),
        (_, Value::String(s)) => Sql::Text(s.clone()),
        (_, v) => Sql::Text(v.to_string()),
    }
}

fn row_values(schema: &TableSchema, row: &SerializedRow) -> Vec<rusqlite::types::Value> {
    schema
        .fields()
        .iter()
        .map(|(name, ty)| {
            row.get(name)
                .map(|v| to_sql_value(ty, v))
                .unwrap_or(rusqlite::types::Value::Null)
        })
        .collect()
}

fn insert_row(
    conn: &Connection,
    table: &str,
    schema: &TableSchema,
    row: &SerializedRow,
) -> Result<()> {
    let columns: Vec<String> = schema
        .fields()
        .keys()
        .map(|name| format!(r#""{name}""#))
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        r#"INSERT INTO "{table}" ({}) VALUES ({})"#,
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(row_values(schema, row)))?;
    Ok(())
}

fn update_row(
    conn: &Connection,
    table: &str,
    schema: &TableSchema,
    row: &SerializedRow,
) -> Result<()> {
    let id_field = schema.id_field();
    let mut assignments = Vec::new();
    let mut values = Vec::new();
    for (name, ty) in schema.fields() {
        if name == id_field {
            continue;
        }
        values.push(
            row.get(name)
                .map(|v| to_sql_value(ty, v))
                .unwrap_or(rusqlite::types::Value::Null),
        );
        assignments.push(format!(r#""{name}" = ?{}"#, values.len()));
    }
    let id = schema.row_id(row).unwrap_or_default().to_string();
    values.push(rusqlite::types::Value::Text(id));
    let sql = format!(
        r#"UPDATE "{table}" SET {} WHERE "{id_field}" = ?{}"#,
        assignments.join(", "),
        values.len()
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn backfill(conn: &Connection, table: &Table) -> Result<()> {
    conn.execute(&format!(r#"DELETE FROM "{}""#, table.name()), [])?;
    for validated in table.get_all() {
        if let Some(row) = validated.valid() {
            if let Err(e) = insert_row(conn, table.name(), table.schema(), row) {
                log::warn!("SQL backfill skipped a row in '{}': {e}", table.name());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkspaceDoc;
    use serde_json::json;

    fn posts_table() -> Arc<Table> {
        let doc = Arc::new(WorkspaceDoc::new("ws"));
        let schema = TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
            ("views".to_string(), FieldType::integer().nullable()),
            ("tags".to_string(), FieldType::multi_select(["a", "b"])),
        ])
        .unwrap();
        Arc::new(Table::new(doc, "posts", schema))
    }

    fn row(value: serde_json::Value) -> SerializedRow {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn projection_tracks_mutations() {
        let table = posts_table();
        let index = SqlIndex::in_memory(&[Arc::clone(&table)]).unwrap();
        let handle = index.handle();

        for id in ["a", "b", "c"] {
            table
                .insert(row(json!({"id": id, "title": "t", "tags": []})))
                .await
                .unwrap();
        }
        let count: i64 = handle
            .query_row("SELECT count(*) FROM posts", &[], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);

        table.delete("b").await.unwrap();
        let count: i64 = handle
            .query_row("SELECT count(*) FROM posts", &[], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        table
            .update(row(json!({"id": "a", "views": 7})))
            .await
            .unwrap();
        let views: i64 = handle
            .query_row("SELECT views FROM posts WHERE id = ?1", &[&"a"], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(views, 7);
    }

    #[tokio::test]
    async fn backfill_mirrors_existing_rows() {
        let table = posts_table();
        table
            .insert(row(json!({"id": "x", "title": "pre", "tags": ["a"]})))
            .await
            .unwrap();

        let index = SqlIndex::in_memory(&[Arc::clone(&table)]).unwrap();
        let titles = index
            .handle()
            .query_map("SELECT title, tags FROM posts", &[], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .unwrap();
        assert_eq!(titles, vec![("pre".to_string(), "[\"a\"]".to_string())]);
    }

    #[tokio::test]
    async fn handle_rejects_writes() {
        let table = posts_table();
        let index = SqlIndex::in_memory(&[table]).unwrap();
        let err = index
            .handle()
            .query_map("DELETE FROM posts", &[], |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), "IndexError");
    }

    #[tokio::test]
    async fn destroy_stops_the_projection() {
        let table = posts_table();
        let index = SqlIndex::in_memory(&[Arc::clone(&table)]).unwrap();
        let handle = index.handle();
        drop(handle);
        index.destroy().await;

        // No observer left; the mutation only touches the CRDT
        table
            .insert(row(json!({"id": "late", "title": "t", "tags": []})))
            .await
            .unwrap();
    }
}
