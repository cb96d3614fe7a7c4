//! Persisted build records.
//!
//! A record remembers what one cached unit was built from so a later process can restore the
//! cache entry without recompiling, provided none of the recorded files changed. A record file
//! written by an offline precompile carries `precompiled = true`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};

use crate::{
    build::toolchain::ModuleHandle,
    cache::CacheEntry,
    error::QuireError,
    paths::LogicalPath,
    vfs::VirtualFileSystem,
};

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFile {
    pub path: LogicalPath,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub logical_path: LogicalPath,
    pub module_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_path: Option<PathBuf>,
    #[serde(default)]
    pub type_name: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_string: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<LogicalPath>,
    /// Every invalidation file with its hash at build time.
    #[serde(default)]
    pub dependency_files: Vec<RecordedFile>,
}

impl BuildRecord {
    /// Record `entry`, hashing its invalidation files through `vfs`.
    pub fn from_entry(
        entry: &CacheEntry,
        vfs: &dyn VirtualFileSystem,
    ) -> Result<BuildRecord, QuireError> {
        let mut dependency_files = Vec::new();
        for file in entry.invalidation_files.iter() {
            if vfs.is_directory(file) {
                continue;
            }
            dependency_files.push(RecordedFile {
                path: file.clone(),
                hash: content_hash(&vfs.open(file)?),
            });
        }
        Ok(BuildRecord {
            logical_path: entry.path.clone(),
            module_id: entry.module.id.clone(),
            module_path: entry.module.path.clone(),
            type_name: entry.type_name.clone(),
            content_hash: entry.content_hash.clone(),
            custom_string: entry.custom_string.clone(),
            dependencies: entry.dependencies.clone(),
            dependency_files,
        })
    }

    /// Why this record can no longer be trusted, if it cannot.
    pub fn staleness(&self, vfs: &dyn VirtualFileSystem) -> Option<String> {
        if let Some(module_path) = &self.module_path {
            if !module_path.exists() {
                return Some(format!("module {module_path:?} is missing"));
            }
        }
        for file in self.dependency_files.iter() {
            match vfs.open(&file.path) {
                Ok(bytes) if content_hash(&bytes) == file.hash => {}
                Ok(_) => return Some(format!("{} changed", file.path)),
                Err(_) => return Some(format!("{} is missing", file.path)),
            }
        }
        None
    }

    /// Cache entry restored from this record.
    pub fn to_entry(&self, precompiled: bool) -> CacheEntry {
        CacheEntry {
            key: String::new(),
            path: self.logical_path.clone(),
            module: ModuleHandle::new(self.module_id.clone(), self.module_path.clone()),
            type_name: self.type_name.clone(),
            custom_string: self.custom_string.clone(),
            invalidation_files: self
                .dependency_files
                .iter()
                .map(|f| f.path.clone())
                .collect(),
            dependencies: self.dependencies.clone(),
            content_hash: self.content_hash.clone(),
            precompiled,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecordFile {
    #[serde(default)]
    pub precompiled: bool,
    #[serde(default)]
    pub records: Vec<BuildRecord>,
}

/// TOML file holding a [`BuildRecordFile`].
#[derive(Debug, Clone)]
pub struct BuildRecordStore {
    path: PathBuf,
}

impl BuildRecordStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        BuildRecordStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An absent file loads as empty.
    pub fn load(&self) -> Result<BuildRecordFile, QuireError> {
        if !self.path.exists() {
            tracing::debug!("[BuildRecord] no record file at {:?}", self.path);
            return Ok(BuildRecordFile::default());
        }
        let content = read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, file: &BuildRecordFile) -> Result<(), QuireError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        write(&self.path, toml::to_string(file)?)?;
        tracing::debug!(
            "[BuildRecord] wrote {} records to {:?}",
            file.records.len(),
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFileSystem;

    fn entry() -> CacheEntry {
        CacheEntry {
            key: "/a.page".to_string(),
            path: LogicalPath::new("/a.page"),
            module: ModuleHandle::new("quire_batch_0", None),
            type_name: "Quire.Generated.a_page".to_string(),
            custom_string: None,
            invalidation_files: vec![LogicalPath::new("/a.page"), LogicalPath::new("/h.inc")],
            dependencies: Vec::new(),
            content_hash: content_hash(b"<p>a</p>"),
            precompiled: false,
        }
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_record_goes_stale_when_include_changes() {
        let vfs = MemoryFileSystem::with_files([("/a.page", "<p>a</p>"), ("/h.inc", "x")]);
        let record = BuildRecord::from_entry(&entry(), &vfs).unwrap();
        assert_eq!(record.dependency_files.len(), 2);
        assert_eq!(record.staleness(&vfs), None);

        vfs.write("/h.inc", "y");
        assert_eq!(record.staleness(&vfs), Some("/h.inc changed".to_string()));
        vfs.remove(&LogicalPath::new("/h.inc"));
        assert_eq!(record.staleness(&vfs), Some("/h.inc is missing".to_string()));

        let restored = record.to_entry(true);
        assert!(restored.precompiled);
        assert_eq!(restored.invalidation_files, entry().invalidation_files);
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BuildRecordStore::new(dir.path().join("records").join("quire.toml"));
        assert_eq!(store.load().unwrap(), BuildRecordFile::default());

        let vfs = MemoryFileSystem::with_files([("/a.page", "<p>a</p>"), ("/h.inc", "x")]);
        let file = BuildRecordFile {
            precompiled: true,
            records: vec![BuildRecord::from_entry(&entry(), &vfs).unwrap()],
        };
        store.save(&file).unwrap();
        assert_eq!(store.load().unwrap(), file);
    }
}
