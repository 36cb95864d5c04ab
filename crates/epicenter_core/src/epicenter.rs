//! Epicenter composition.
//!
//! An epicenter assembles several workspace definitions, each with declared
//! dependency ids, into one client. Resolution is flat: every declared id
//! must name another workspace in the same set (no transitive walk). The
//! dependency graph is topologically sorted, workspaces are built in that
//! order (each exports factory receives its already-built dependency
//! clients), and destroy runs in reverse.
//!
//! Verification happens before anything is built, so a missing dependency
//! or a cycle leaves no document, file, or database behind.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{EpicenterError, Result};
use crate::paths::EpicenterPaths;
use crate::workspace::{WorkspaceClient, WorkspaceDefinition, build_workspace};

/// A set of live workspaces sharing one storage directory.
pub struct EpicenterClient {
    workspaces: HashMap<String, Arc<WorkspaceClient>>,
    order: Vec<String>,
    paths: EpicenterPaths,
}

impl EpicenterClient {
    /// One workspace client by id.
    pub fn workspace(&self, id: &str) -> Option<&Arc<WorkspaceClient>> {
        self.workspaces.get(id)
    }

    /// Every workspace id, in initialisation order.
    pub fn workspace_ids(&self) -> &[String] {
        &self.order
    }

    /// The resolved storage layout this epicenter is bound to.
    pub fn paths(&self) -> &EpicenterPaths {
        &self.paths
    }

    /// Destroy every workspace, in reverse topological order.
    pub async fn destroy(&self) -> Result<()> {
        for id in self.order.iter().rev() {
            if let Some(client) = self.workspaces.get(id) {
                client.destroy().await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EpicenterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpicenterClient")
            .field("workspaces", &self.order)
            .finish()
    }
}

/// Build an epicenter client bound to a storage root.
///
/// `root = None` binds it to the process working directory. Only one
/// epicenter client may be bound to a given directory at a time; the
/// persistence and index files cannot be safely shared.
pub async fn create_epicenter_client(
    definitions: Vec<WorkspaceDefinition>,
    root: Option<PathBuf>,
) -> Result<EpicenterClient> {
    let paths = EpicenterPaths::resolve(root)?;

    let ids: HashSet<&str> = definitions.iter().map(|d| d.id.as_str()).collect();
    if ids.len() != definitions.len() {
        return Err(EpicenterError::Config {
            message: "duplicate workspace ids in epicenter".to_string(),
        });
    }

    // Flat verification: every declared dependency must be in the set
    for definition in &definitions {
        for dep in &definition.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(EpicenterError::MissingDependency {
                    workspace: definition.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    let order = topological_order(&definitions)?;

    let by_id: HashMap<&str, &WorkspaceDefinition> =
        definitions.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut workspaces: HashMap<String, Arc<WorkspaceClient>> = HashMap::new();
    for id in &order {
        let definition = by_id[id.as_str()];
        let dependencies: HashMap<String, Arc<WorkspaceClient>> = definition
            .dependencies
            .iter()
            .map(|dep| (dep.clone(), Arc::clone(&workspaces[dep])))
            .collect();
        let client = build_workspace(definition, &paths, dependencies).await?;
        workspaces.insert(id.clone(), client);
    }

    Ok(EpicenterClient {
        workspaces,
        order,
        paths,
    })
}

/// Kahn's algorithm over the dependency edges, seeded in definition order
/// so initialisation is deterministic.
fn topological_order(definitions: &[WorkspaceDefinition]) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = definitions
        .iter()
        .map(|d| (d.id.as_str(), d.dependencies.len()))
        .collect();
    // dependency id -> dependents
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for definition in definitions {
        for dep in &definition.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(definition.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = definitions
        .iter()
        .filter(|d| d.dependencies.is_empty())
        .map(|d| d.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(definitions.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for child in children {
                let degree = in_degree.get_mut(child).expect("child is a known workspace");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if order.len() != definitions.len() {
        let mut participants: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        participants.sort();
        return Err(EpicenterError::DependencyCycle { participants });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, TableSchema};

    fn schema() -> TableSchema {
        TableSchema::new([
            ("id".to_string(), FieldType::Id),
            ("title".to_string(), FieldType::text()),
        ])
        .unwrap()
    }

    fn definition(id: &str, deps: &[&str]) -> WorkspaceDefinition {
        WorkspaceDefinition::new(id, [("posts", schema())]).depends_on(deps.iter().copied())
    }

    #[tokio::test]
    async fn builds_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let client = create_epicenter_client(
            vec![
                definition("app", &["auth", "storage"]),
                definition("auth", &[]),
                definition("storage", &["auth"]),
            ],
            Some(dir.path().to_path_buf()),
        )
        .await
        .unwrap();

        let order = client.workspace_ids();
        let position = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(position("auth") < position("storage"));
        assert!(position("storage") < position("app"));
        assert!(client.workspace("app").is_some());
        client.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_epicenter_client(
            vec![definition("app", &["ghost"])],
            Some(dir.path().to_path_buf()),
        )
        .await
        .unwrap_err();

        match err {
            EpicenterError::MissingDependency { workspace, missing } => {
                assert_eq!(workspace, "app");
                assert_eq!(missing, "ghost");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dependency_cycle_is_rejected_before_any_build() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_epicenter_client(
            vec![definition("a", &["b"]), definition("b", &["a"])],
            Some(dir.path().to_path_buf()),
        )
        .await
        .unwrap_err();

        match err {
            EpicenterError::DependencyCycle { participants } => {
                assert_eq!(participants, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
        // Verification failed before anything touched disk
        assert!(!dir.path().join(".epicenter").exists());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_epicenter_client(
            vec![definition("a", &[]), definition("a", &[])],
            Some(dir.path().to_path_buf()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[tokio::test]
    async fn exports_receive_dependency_clients() {
        use crate::actions::{Action, ActionMap};
        use serde_json::json;

        let dir = tempfile::tempdir().unwrap();
        let auth = definition("auth", &[]).with_exports(|_| {
            ActionMap::new().action("whoami", Action::query(|_| async { Ok(json!("admin")) }))
        });
        let app = definition("app", &["auth"]).with_exports(|ctx| {
            let auth = Arc::clone(&ctx.dependencies["auth"]);
            ActionMap::new().action(
                "greet",
                Action::query(move |_| {
                    let auth = Arc::clone(&auth);
                    async move {
                        let user = auth.invoke(&["whoami"], json!(null)).await?;
                        Ok(json!(format!("hello {}", user.as_str().unwrap_or("?"))))
                    }
                }),
            )
        });

        let client = create_epicenter_client(
            vec![app, auth],
            Some(dir.path().to_path_buf()),
        )
        .await
        .unwrap();

        let out = client
            .workspace("app")
            .unwrap()
            .invoke(&["greet"], json!(null))
            .await
            .unwrap();
        assert_eq!(out, json!("hello admin"));
        client.destroy().await.unwrap();
    }
}
