//! File watching for long-running hosts (requires the `service` feature).
//!
//! [`FileWatcher`] watches physical directories with `notify-debouncer-full` and forwards every
//! create, modify and remove event to [`BuildManager::file_changed`], which evicts the affected
//! cache entries. The next request for an evicted path rebuilds it.
//!
//! ```rust,no_run
//! use quire_core::{
//!     build::{BuildContext, BuildManager, ProcessToolchain},
//!     config::BuildConfig,
//!     vfs::PhysicalFileSystem,
//!     watch::FileWatcher,
//! };
//! use std::{path::PathBuf, sync::Arc};
//!
//! # fn main() -> Result<(), quire_core::QuireError> {
//! let root = PathBuf::from("./site");
//! let config = BuildConfig::default();
//! let toolchain = Arc::new(ProcessToolchain::new(config.toolchain.clone()));
//! let ctx = BuildContext::new(config, Arc::new(PhysicalFileSystem::new(&root)), toolchain);
//! let manager = Arc::new(BuildManager::new(ctx, None));
//!
//! let watcher = FileWatcher::new(manager.clone());
//! watcher.watch(&root)?;
//! # Ok(())
//! # }
//! ```

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{build::BuildManager, error::QuireError, paths::LogicalPath};

type RootWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

/// Install a `tracing` subscriber honoring `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .ok();
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Physical paths under `root` that should be reported as changed, mapped to logical paths.
fn changed_paths(root: &Path, paths: &[PathBuf]) -> Vec<LogicalPath> {
    paths
        .iter()
        .filter(|p| !is_hidden(p))
        .filter_map(|p| LogicalPath::from_physical(root, p).ok())
        .collect()
}

pub struct FileWatcher {
    manager: Arc<BuildManager>,
    debounce: Duration,
    watchers: Mutex<HashMap<PathBuf, RootWatcher>>,
}

impl FileWatcher {
    pub fn new(manager: Arc<BuildManager>) -> Self {
        FileWatcher::with_debounce(manager, Duration::from_millis(500))
    }

    pub fn with_debounce(manager: Arc<BuildManager>, debounce: Duration) -> Self {
        FileWatcher {
            manager,
            debounce,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `root`, whose contents map onto the logical root.
    pub fn watch(&self, root: &Path) -> Result<(), QuireError> {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(root) {
            return Err(QuireError::Custom(format!(
                "FileWatcher already watches {root:?}"
            )));
        }

        let manager = self.manager.clone();
        let watch_root = root.to_path_buf();
        let mut debouncer = new_debouncer(
            self.debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events.iter() {
                        match event.event.kind {
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                                for path in changed_paths(&watch_root, &event.paths) {
                                    let evicted = manager.file_changed(&path);
                                    tracing::debug!(
                                        "[Watch] {} changed, evicted {} entries",
                                        path,
                                        evicted.len()
                                    );
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Err(errors) => {
                    tracing::error!("[Watch] Notify debouncer returned errors: {:?}", errors);
                }
            },
        )?;
        debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
        tracing::info!("[Watch] watching {:?}", root);
        watchers.insert(root.to_path_buf(), debouncer);
        Ok(())
    }

    pub fn unwatch(&self, root: &Path) -> Result<(), QuireError> {
        if let Some(mut debouncer) = self.watchers.lock().remove(root) {
            let unwatch_res = debouncer.watcher().unwatch(root);
            tracing::debug!("[Watch] unwatch({:?}) = {:?}", root, unwatch_res);
            unwatch_res?;
        }
        Ok(())
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.watchers.lock().keys().cloned().collect();
        roots.sort();
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_paths_skip_hidden_files() {
        let root = PathBuf::from("/srv/site");
        let paths = vec![
            root.join("index.page"),
            root.join("parts").join(".menu.ctl.swp"),
            PathBuf::from("/elsewhere/a.page"),
        ];
        assert_eq!(
            changed_paths(&root, &paths),
            vec![LogicalPath::new("/index.page")]
        );
    }
}
