//! File-system watching for table directories.
//!
//! One `notify` watcher covers every table directory of a workspace
//! (non-recursively). The watcher callback runs on notify's own thread and
//! only forwards relevant events into a tokio channel; all real work
//! happens on the drain task owned by the markdown index.

use std::collections::HashMap;
use std::path::PathBuf;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{EpicenterError, Result};

/// A change to one file inside a table directory.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The table whose directory the file lives in
    pub table: String,
    /// Absolute path of the changed file
    pub path: PathBuf,
}

/// Watches every table directory of one workspace markdown index.
///
/// Watching stops when this is dropped.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Watch the given `(table, directory)` pairs, forwarding `.md` file
    /// events into `tx`.
    pub fn start(
        dirs: &[(String, PathBuf)],
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self> {
        let table_by_dir: HashMap<PathBuf, String> = dirs
            .iter()
            .map(|(table, dir)| (dir.clone(), table.clone()))
            .collect();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("file watcher error: {e}");
                        return;
                    }
                };
                if !is_relevant(&event.kind) {
                    return;
                }
                for path in &event.paths {
                    if path.extension().is_none_or(|ext| ext != "md") {
                        continue;
                    }
                    let Some(table) = path
                        .parent()
                        .and_then(|parent| table_by_dir.get(parent))
                    else {
                        continue;
                    };
                    let _ = tx.send(WatchEvent {
                        table: table.clone(),
                        path: path.clone(),
                    });
                }
            },
            Config::default(),
        )
        .map_err(watch_error)?;

        for (_, dir) in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(watch_error)?;
        }

        Ok(Self { _watcher: watcher })
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn watch_error(e: notify::Error) -> EpicenterError {
    EpicenterError::Index {
        index: "markdown".to_string(),
        message: format!("file watcher failed: {e}"),
    }
}
