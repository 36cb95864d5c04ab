//! Storage layout resolution.
//!
//! Everything an epicenter persists lives under a single `.epicenter/`
//! directory inside the caller-supplied storage root (default: the process
//! working directory):
//!
//! ```text
//! .epicenter/
//!   <workspace-id>.crdt         # persistence byte-state (binary)
//!   <workspace-id>.db           # SQL index database (+ .db-wal, .db-shm)
//!   <workspace-id>/             # markdown-index sub-dir
//!     <table-name>/<filename>   # one markdown file per row
//!   markdown/
//!     <workspace-id>.log                # append-only error log (NDJSON)
//!     <workspace-id>-diagnostics.json   # current validation errors
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EpicenterError, Result};

/// Name of the directory holding all epicenter artefacts.
const EPICENTER_DIR_NAME: &str = ".epicenter";

/// Name of the sub-directory holding markdown diagnostics and error logs.
const MARKDOWN_META_DIR_NAME: &str = "markdown";

/// An absolute filesystem path.
///
/// Construction fails for relative paths, so holding one of these is proof
/// the path has been anchored to a storage root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbsolutePath(PathBuf);

impl AbsolutePath {
    /// Wrap an absolute path. Fails with [`EpicenterError::Config`] for
    /// relative input.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(EpicenterError::Config {
                message: format!("expected an absolute path, got '{}'", path.display()),
            });
        }
        Ok(Self(path))
    }

    /// The underlying path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Join a relative component, keeping the absolute brand.
    pub fn join(&self, component: impl AsRef<Path>) -> AbsolutePath {
        AbsolutePath(self.0.join(component))
    }
}

impl AsRef<Path> for AbsolutePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Resolved storage layout for one epicenter.
#[derive(Debug, Clone)]
pub struct EpicenterPaths {
    root: AbsolutePath,
}

impl EpicenterPaths {
    /// Resolve the layout against a storage root.
    ///
    /// `root = None` binds the epicenter to the process working directory.
    /// Relative roots are anchored to the working directory as well.
    pub fn resolve(root: Option<PathBuf>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let root = match root {
            None => cwd,
            Some(p) if p.is_absolute() => p,
            Some(p) => cwd.join(p),
        };
        Ok(Self {
            root: AbsolutePath::new(root)?,
        })
    }

    /// The storage root this epicenter is bound to.
    pub fn root(&self) -> &AbsolutePath {
        &self.root
    }

    /// `<root>/.epicenter`
    pub fn epicenter_dir(&self) -> AbsolutePath {
        self.root.join(EPICENTER_DIR_NAME)
    }

    /// `<root>/.epicenter/<workspace-id>.crdt`
    pub fn persistence_file(&self, workspace_id: &str) -> AbsolutePath {
        self.epicenter_dir().join(format!("{workspace_id}.crdt"))
    }

    /// `<root>/.epicenter/<workspace-id>.db`
    pub fn sql_database(&self, workspace_id: &str) -> AbsolutePath {
        self.epicenter_dir().join(format!("{workspace_id}.db"))
    }

    /// `<root>/.epicenter/<workspace-id>` — the markdown index root.
    pub fn markdown_root(&self, workspace_id: &str) -> AbsolutePath {
        self.epicenter_dir().join(workspace_id)
    }

    /// `<root>/.epicenter/<workspace-id>/<table-name>`
    pub fn markdown_table_dir(&self, workspace_id: &str, table: &str) -> AbsolutePath {
        self.markdown_root(workspace_id).join(table)
    }

    /// `<root>/.epicenter/markdown` — diagnostics and error logs.
    pub fn markdown_meta_dir(&self) -> AbsolutePath {
        self.epicenter_dir().join(MARKDOWN_META_DIR_NAME)
    }

    /// `<root>/.epicenter/markdown/<workspace-id>.log`
    pub fn error_log_file(&self, workspace_id: &str) -> AbsolutePath {
        self.markdown_meta_dir().join(format!("{workspace_id}.log"))
    }

    /// `<root>/.epicenter/markdown/<workspace-id>-diagnostics.json`
    pub fn diagnostics_file(&self, workspace_id: &str) -> AbsolutePath {
        self.markdown_meta_dir()
            .join(format!("{workspace_id}-diagnostics.json"))
    }
}
