use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{error::QuireError, paths::LogicalPath};

/// Why a cache entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// A file in the entry's invalidation set changed.
    FileChanged,
    /// Removed explicitly through `invalidate`.
    Removed,
}

/// Notifications emitted by a [`crate::build::BuildManager`] while it builds and invalidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildEvent {
    /// Unit path, module id
    UnitCached(LogicalPath, String),
    /// Cache key, reason
    UnitEvicted(String, EvictionReason),
    /// Batch index, units in the batch, module id (None when nothing was compiled)
    BatchCompiled(usize, Vec<LogicalPath>, Option<String>),
    /// Batch index, attempt number, units removed before retrying
    BatchRetried(usize, usize, Vec<LogicalPath>),
    /// Unit path, reason. The unit was dropped from its batch without failing the build.
    UnitDropped(LogicalPath, String),
    /// Cumulative rebuild count crossed the configured threshold.
    RestartRequested(usize),
}

impl BuildEvent {
    pub fn to_json(&self) -> Result<String, QuireError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Display for BuildEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildEvent::UnitCached(path, module) => write!(f, "cached {path} in {module}"),
            BuildEvent::UnitEvicted(key, reason) => write!(f, "evicted {key} ({reason:?})"),
            BuildEvent::BatchCompiled(idx, units, module) => write!(
                f,
                "batch {idx} ({} units) -> {}",
                units.len(),
                module.as_deref().unwrap_or("<none>")
            ),
            BuildEvent::BatchRetried(idx, attempt, removed) => write!(
                f,
                "batch {idx} attempt {attempt}, removed {}",
                removed
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            BuildEvent::UnitDropped(path, reason) => write!(f, "dropped {path}: {reason}"),
            BuildEvent::RestartRequested(count) => {
                write!(f, "restart requested after {count} rebuilds")
            }
        }
    }
}
