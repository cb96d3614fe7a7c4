//! Virtual filesystem seam.
//!
//! Everything that reads sources (dependency scanning, tree building, unit discovery) goes
//! through [`VirtualFileSystem`], so overlays and in-memory sources behave like files on disk.

use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

use crate::{error::QuireError, paths::LogicalPath};

pub trait VirtualFileSystem: Send + Sync {
    /// True for existing files and directories.
    fn exists(&self, path: &LogicalPath) -> bool;

    fn is_directory(&self, path: &LogicalPath) -> bool;

    fn open(&self, path: &LogicalPath) -> Result<Vec<u8>, QuireError>;

    /// Files directly inside `dir`, sorted.
    fn enumerate(&self, dir: &LogicalPath) -> Result<Vec<LogicalPath>, QuireError>;

    fn read_to_string(&self, path: &LogicalPath) -> Result<String, QuireError> {
        String::from_utf8(self.open(path)?).map_err(|e| {
            QuireError::Serialization(format!("'{path}' is not valid UTF-8: {e}"))
        })
    }

    /// Physical location backing `path`, when there is one.
    fn physical_path(&self, _path: &LogicalPath) -> Option<PathBuf> {
        None
    }
}

/// Logical paths mapped beneath a directory on disk.
#[derive(Debug, Clone)]
pub struct PhysicalFileSystem {
    root: PathBuf,
}

impl PhysicalFileSystem {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        PhysicalFileSystem {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl VirtualFileSystem for PhysicalFileSystem {
    fn exists(&self, path: &LogicalPath) -> bool {
        path.to_physical(&self.root).exists()
    }

    fn is_directory(&self, path: &LogicalPath) -> bool {
        path.to_physical(&self.root).is_dir()
    }

    fn open(&self, path: &LogicalPath) -> Result<Vec<u8>, QuireError> {
        let physical = path.to_physical(&self.root);
        tracing::trace!("[Vfs] reading {:?}", physical);
        fs::read(&physical).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => QuireError::not_found(path),
            _ => e.into(),
        })
    }

    fn enumerate(&self, dir: &LogicalPath) -> Result<Vec<LogicalPath>, QuireError> {
        let physical = dir.to_physical(&self.root);
        let mut files = Vec::new();
        for entry in WalkDir::new(&physical)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(LogicalPath::from_physical(&self.root, entry.path())?);
            }
        }
        Ok(files)
    }

    fn physical_path(&self, path: &LogicalPath) -> Option<PathBuf> {
        Some(path.to_physical(&self.root))
    }
}

/// In-memory sources. Directories exist implicitly when a file lies beneath them.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<LogicalPath, Vec<u8>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        MemoryFileSystem::default()
    }

    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<LogicalPath>,
        C: Into<Vec<u8>>,
    {
        let vfs = MemoryFileSystem::new();
        for (path, content) in files {
            vfs.write(path, content);
        }
        vfs
    }

    pub fn write<P: Into<LogicalPath>, C: Into<Vec<u8>>>(&self, path: P, content: C) {
        self.files.write().insert(path.into(), content.into());
    }

    pub fn remove(&self, path: &LogicalPath) -> bool {
        self.files.write().remove(path).is_some()
    }
}

impl VirtualFileSystem for MemoryFileSystem {
    fn exists(&self, path: &LogicalPath) -> bool {
        self.files.read().contains_key(path) || self.is_directory(path)
    }

    fn is_directory(&self, path: &LogicalPath) -> bool {
        let files = self.files.read();
        if path.is_root() {
            return !files.is_empty();
        }
        files.keys().any(|file| file != path && file.is_within(path))
    }

    fn open(&self, path: &LogicalPath) -> Result<Vec<u8>, QuireError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| QuireError::not_found(path))
    }

    fn enumerate(&self, dir: &LogicalPath) -> Result<Vec<LogicalPath>, QuireError> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|file| !file.is_root() && &file.parent() == dir)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_fs() {
        let vfs = MemoryFileSystem::with_files([
            ("/a.page", "A"),
            ("/dir/b.ctl", "B"),
            ("/dir/sub/c.cs", "C"),
        ]);
        assert!(vfs.exists(&LogicalPath::new("/a.page")));
        assert!(vfs.exists(&LogicalPath::new("/dir")));
        assert!(vfs.is_directory(&LogicalPath::new("/dir")));
        assert!(!vfs.is_directory(&LogicalPath::new("/a.page")));
        assert!(!vfs.exists(&LogicalPath::new("/nope.page")));
        assert_eq!(
            vfs.enumerate(&LogicalPath::new("/dir")).unwrap(),
            vec![LogicalPath::new("/dir/b.ctl")]
        );
        assert_eq!(vfs.read_to_string(&LogicalPath::new("/a.page")).unwrap(), "A");
        assert!(matches!(
            vfs.open(&LogicalPath::new("/nope.page")),
            Err(QuireError::NotFound(_))
        ));
    }

    #[test]
    fn test_physical_fs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("code")).unwrap();
        fs::write(dir.path().join("code").join("b.cs"), "class B {}").unwrap();
        fs::write(dir.path().join("code").join("a.cs"), "class A {}").unwrap();
        fs::write(dir.path().join("index.page"), "Hello").unwrap();

        let vfs = PhysicalFileSystem::new(dir.path());
        assert!(vfs.exists(&LogicalPath::new("/index.page")));
        assert!(vfs.is_directory(&LogicalPath::new("/code")));
        assert_eq!(
            vfs.enumerate(&LogicalPath::new("/code")).unwrap(),
            vec![LogicalPath::new("/code/a.cs"), LogicalPath::new("/code/b.cs")]
        );
        assert_eq!(
            vfs.read_to_string(&LogicalPath::new("/index.page")).unwrap(),
            "Hello"
        );
        assert_eq!(
            vfs.open(&LogicalPath::new("/missing.page")).unwrap_err(),
            QuireError::not_found(&LogicalPath::new("/missing.page"))
        );
    }
}
