//! Workspace assembly and lifecycle.
//!
//! A [`WorkspaceDefinition`] declares everything one workspace is: its id,
//! table schemas, dependency ids, persistence, index providers, and an
//! exports factory. [`build_workspace`] turns that into a live
//! [`WorkspaceClient`] in a fixed order — document, persistence (so later
//! providers load from a hydrated document), tables, indexes in insertion
//! order, exports — and `destroy` releases everything leaves-to-root.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::BoxFuture;
use crate::actions::ActionMap;
use crate::error::{EpicenterError, Result};
use crate::markdown::MarkdownOps;
use crate::paths::EpicenterPaths;
use crate::persistence::{FsStore, MemoryStore, Persistence, PersistenceStore};
use crate::schema::{TableSchema, WorkspaceSchema};
use crate::sql::SqlHandle;
use crate::store::{Table, WorkspaceDoc};

/// What an index provider gets handed on attach.
pub struct IndexContext {
    /// The owning workspace id
    pub workspace_id: String,
    /// The table helpers, in schema order
    pub tables: IndexMap<String, Arc<Table>>,
    /// The declared table schemas
    pub schema: WorkspaceSchema,
    /// The resolved storage layout
    pub paths: EpicenterPaths,
}

impl IndexContext {
    /// The tables as a slice, in schema order.
    pub fn table_list(&self) -> Vec<Arc<Table>> {
        self.tables.values().cloned().collect()
    }
}

/// The resources an index exposes to the exports factory.
#[derive(Clone)]
pub enum IndexExports {
    /// Read-only SQL access
    Sql(SqlHandle),
    /// Markdown manual operations and diagnostics
    Markdown(MarkdownOps),
    /// Anything a custom index exports
    Custom(Arc<dyn Any + Send + Sync>),
    /// The index exposes nothing
    None,
}

impl IndexExports {
    /// The SQL handle, when this export is one.
    pub fn as_sql(&self) -> Option<&SqlHandle> {
        match self {
            IndexExports::Sql(handle) => Some(handle),
            _ => None,
        }
    }

    /// The markdown operations, when this export is one.
    pub fn as_markdown(&self) -> Option<&MarkdownOps> {
        match self {
            IndexExports::Markdown(ops) => Some(ops),
            _ => None,
        }
    }
}

/// Deferred asynchronous teardown for one attached index.
pub type DestroyFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// What an index provider returns from attach.
pub struct IndexHandle {
    /// Resources for the exports factory
    pub exports: IndexExports,
    /// Teardown hook, run once on workspace destroy
    pub destroy: Option<DestroyFn>,
}

/// Attaches one derived index to a workspace.
pub trait IndexProvider: Send + Sync {
    /// Stable name, used as the key in the exports map.
    fn name(&self) -> &str;

    /// Build the index against a hydrated document. Runs after persistence
    /// load and before the exports factory.
    fn attach<'a>(&'a self, ctx: &'a IndexContext) -> BoxFuture<'a, Result<IndexHandle>>;
}

/// Produces a persistence store for a workspace.
pub type PersistenceFactory =
    Arc<dyn Fn(&EpicenterPaths, &str) -> Arc<dyn PersistenceStore> + Send + Sync>;

/// What the exports factory gets handed.
pub struct ExportsContext {
    /// The table helpers
    pub tables: IndexMap<String, Arc<Table>>,
    /// Exports of every attached index, keyed by provider name
    pub indexes: IndexMap<String, IndexExports>,
    /// Already-built clients for every declared dependency
    pub dependencies: HashMap<String, Arc<WorkspaceClient>>,
}

/// Produces a workspace's action map.
pub type ExportsFactory = Arc<dyn Fn(&ExportsContext) -> ActionMap + Send + Sync>;

/// Declarative description of one workspace.
#[derive(Clone)]
pub struct WorkspaceDefinition {
    /// Unique id within an epicenter
    pub id: String,
    /// Field-typed table schemas
    pub schema: WorkspaceSchema,
    /// Ids of workspaces this one depends on (flat, not transitive)
    pub dependencies: Vec<String>,
    /// Persistence store factory, applied before any index
    pub persistence: Option<PersistenceFactory>,
    /// Index providers, attached in insertion order
    pub indexes: Vec<Arc<dyn IndexProvider>>,
    /// Action map factory
    pub exports: Option<ExportsFactory>,
}

impl WorkspaceDefinition {
    /// A workspace with the given id and tables, no providers yet.
    pub fn new<I, S>(id: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = (S, TableSchema)>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            schema: tables.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            dependencies: Vec::new(),
            persistence: None,
            indexes: Vec::new(),
            exports: None,
        }
    }

    /// Declare dependencies on other workspaces by id.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Persist CRDT state to `<epicenter-dir>/<id>.crdt`.
    pub fn with_fs_persistence(mut self) -> Self {
        self.persistence = Some(Arc::new(|paths: &EpicenterPaths, id: &str| {
            Arc::new(FsStore::new(paths.persistence_file(id).as_path()))
                as Arc<dyn PersistenceStore>
        }));
        self
    }

    /// Persist CRDT state in memory (browser-storage stand-in, tests).
    pub fn with_memory_persistence(mut self) -> Self {
        self.persistence = Some(Arc::new(|_: &EpicenterPaths, _: &str| {
            Arc::new(MemoryStore::new()) as Arc<dyn PersistenceStore>
        }));
        self
    }

    /// Use a custom persistence store factory.
    pub fn with_persistence(mut self, factory: PersistenceFactory) -> Self {
        self.persistence = Some(factory);
        self
    }

    /// Attach an index provider. Providers attach in insertion order.
    pub fn with_index(mut self, provider: Arc<dyn IndexProvider>) -> Self {
        self.indexes.push(provider);
        self
    }

    /// Set the exports factory.
    pub fn with_exports<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ExportsContext) -> ActionMap + Send + Sync + 'static,
    {
        self.exports = Some(Arc::new(factory));
        self
    }
}

struct WorkspaceResources {
    index_destroys: Vec<DestroyFn>,
    persistence: Option<Persistence>,
    doc: Arc<WorkspaceDoc>,
}

/// A live workspace: its actions, tables, index exports, and teardown.
pub struct WorkspaceClient {
    id: String,
    tables: IndexMap<String, Arc<Table>>,
    indexes: IndexMap<String, IndexExports>,
    actions: ActionMap,
    resources: Mutex<Option<WorkspaceResources>>,
}

impl WorkspaceClient {
    /// The workspace id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The exported action map.
    pub fn actions(&self) -> &ActionMap {
        &self.actions
    }

    /// Invoke an action by its name path.
    pub async fn invoke(&self, path: &[&str], input: serde_json::Value) -> Result<serde_json::Value> {
        let action = self.actions.get(path).ok_or_else(|| EpicenterError::NotFound {
            table: format!("{}.actions", self.id),
            id: path.join("."),
        })?;
        action.invoke(input).await
    }

    /// One table helper by name.
    pub fn table(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables.get(name)
    }

    /// Every table helper, in schema order.
    pub fn tables(&self) -> &IndexMap<String, Arc<Table>> {
        &self.tables
    }

    /// One index's exports by provider name.
    pub fn index(&self, name: &str) -> Option<&IndexExports> {
        self.indexes.get(name)
    }

    /// The SQL handle, when a SQL index is attached.
    pub fn sql(&self) -> Option<SqlHandle> {
        self.indexes
            .values()
            .find_map(|exports| exports.as_sql().cloned())
    }

    /// The markdown operations, when a markdown index is attached.
    pub fn markdown(&self) -> Option<MarkdownOps> {
        self.indexes
            .values()
            .find_map(|exports| exports.as_markdown().cloned())
    }

    /// Release everything, exactly once: indexes (reverse attach order,
    /// each flushing its own diagnostics and logs), then persistence, then
    /// the document. Calls after the first are no-ops.
    pub async fn destroy(&self) -> Result<()> {
        let resources = self.resources.lock().unwrap().take();
        let Some(resources) = resources else {
            return Ok(());
        };

        for destroy in resources.index_destroys.into_iter().rev() {
            destroy().await;
        }
        if let Some(persistence) = resources.persistence {
            persistence.destroy().await;
        }
        drop(resources.doc);
        Ok(())
    }
}

impl std::fmt::Debug for WorkspaceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceClient")
            .field("id", &self.id)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build a live client from a definition.
///
/// `dependencies` must hold an already-built client per declared dependency
/// id; the epicenter composition layer guarantees this by building in
/// topological order.
pub async fn build_workspace(
    definition: &WorkspaceDefinition,
    paths: &EpicenterPaths,
    dependencies: HashMap<String, Arc<WorkspaceClient>>,
) -> Result<Arc<WorkspaceClient>> {
    // 1. The document
    let doc = Arc::new(WorkspaceDoc::new(definition.id.clone()));

    // 2. Persistence first, so indexes see a hydrated document
    let persistence = match &definition.persistence {
        Some(factory) => {
            let store = factory(paths, &definition.id);
            Some(Persistence::attach(Arc::clone(&doc), store).await)
        }
        None => None,
    };

    // 3. Table helpers
    let tables: IndexMap<String, Arc<Table>> = definition
        .schema
        .iter()
        .map(|(name, schema)| {
            (
                name.clone(),
                Arc::new(Table::new(Arc::clone(&doc), name.clone(), schema.clone())),
            )
        })
        .collect();

    // 4. Indexes, in insertion order
    let ctx = IndexContext {
        workspace_id: definition.id.clone(),
        tables: tables.clone(),
        schema: definition.schema.clone(),
        paths: paths.clone(),
    };
    let mut index_exports = IndexMap::new();
    let mut index_destroys = Vec::new();
    for provider in &definition.indexes {
        let handle = provider.attach(&ctx).await?;
        index_exports.insert(provider.name().to_string(), handle.exports);
        if let Some(destroy) = handle.destroy {
            index_destroys.push(destroy);
        }
    }

    // 5. Exports
    let actions = match &definition.exports {
        Some(factory) => factory(&ExportsContext {
            tables: tables.clone(),
            indexes: index_exports.clone(),
            dependencies,
        }),
        None => ActionMap::new(),
    };

    Ok(Arc::new(WorkspaceClient {
        id: definition.id.clone(),
        tables,
        indexes: index_exports,
        actions,
        resources: Mutex::new(Some(WorkspaceResources {
            index_destroys,
            persistence,
            doc,
        })),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::schema::FieldType;
    use serde_json::json;

    fn posts_schema() -> TableSchema {
        TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
        ])
        .unwrap()
    }

    fn paths(dir: &std::path::Path) -> EpicenterPaths {
        EpicenterPaths::resolve(Some(dir.to_path_buf())).unwrap()
    }

    #[tokio::test]
    async fn builds_tables_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let definition = WorkspaceDefinition::new("notes", [("posts", posts_schema())])
            .with_memory_persistence()
            .with_exports(|ctx| {
                let posts = Arc::clone(&ctx.tables["posts"]);
                ActionMap::new().action(
                    "countPosts",
                    Action::query(move |_| {
                        let posts = Arc::clone(&posts);
                        async move { Ok(json!(posts.len())) }
                    }),
                )
            });

        let client = build_workspace(&definition, &paths(dir.path()), HashMap::new())
            .await
            .unwrap();

        client
            .table("posts")
            .unwrap()
            .insert(serde_json::from_value(json!({"id": "a", "title": "t"})).unwrap())
            .await
            .unwrap();

        let count = client.invoke(&["countPosts"], json!(null)).await.unwrap();
        assert_eq!(count, json!(1));
        client.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let definition = WorkspaceDefinition::new("notes", [("posts", posts_schema())]);
        let client = build_workspace(&definition, &paths(dir.path()), HashMap::new())
            .await
            .unwrap();
        client.destroy().await.unwrap();
        client.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_action_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let definition = WorkspaceDefinition::new("notes", [("posts", posts_schema())]);
        let client = build_workspace(&definition, &paths(dir.path()), HashMap::new())
            .await
            .unwrap();
        let err = client.invoke(&["nope"], json!(null)).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        client.destroy().await.unwrap();
    }
}
