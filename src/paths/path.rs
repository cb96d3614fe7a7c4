use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt::{Display, Formatter},
    path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR},
};

use crate::error::QuireError;

/// Utility function to replace separators and convert to unicode (via to_string_lossy) on os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    let res = os_path_ref
        .as_ref()
        .components()
        .map(|c| match c {
            Component::RootDir => Cow::from("".to_string()),
            _ => c.as_os_str().to_string_lossy(),
        })
        .collect::<Vec<_>>()
        .join("/");
    tracing::trace!(
        "os_path_to_string: turned {:?} into {}",
        os_path_ref.as_ref().components(),
        res
    );
    res
}

pub fn string_to_os_path(path_string: &str) -> PathBuf {
    PathBuf::from(path_string.trim_start_matches('/').replace('/', MAIN_SEPARATOR_STR))
}

/// Host-level identity of a unit: rooted at `/`, `/`-separated, `.` and `..` resolved, case
/// preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalPath(String);

impl LogicalPath {
    /// Normalize `path`. `..` segments that would climb above the root are clamped at the root;
    /// use [`LogicalPath::resolve`] when escaping the root must be detected.
    pub fn new<S: AsRef<str>>(path: S) -> LogicalPath {
        let (parts, _) = normalize_parts(&[], path.as_ref());
        LogicalPath::from_parts(&parts)
    }

    pub fn root() -> LogicalPath {
        LogicalPath("/".to_string())
    }

    fn from_parts(parts: &[&str]) -> LogicalPath {
        LogicalPath(format!("/{}", parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    fn parts(&self) -> Vec<&str> {
        self.0.split('/').filter(|p| !p.is_empty()).collect()
    }

    /// Final path segment; empty for the root.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Extension of the final segment, without the dot. Dotfiles have no extension.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => name,
            Some(idx) => &name[..idx],
        }
    }

    /// The containing directory. The root is its own parent.
    pub fn parent(&self) -> LogicalPath {
        let mut parts = self.parts();
        parts.pop();
        LogicalPath::from_parts(&parts)
    }

    pub fn join<E: AsRef<str>>(&self, end: E) -> LogicalPath {
        LogicalPath::new(format!("{}/{}", self.0, end.as_ref()))
    }

    /// Resolve a reference written inside the document at `self`.
    ///
    /// `~/x` is relative to `app_root`, `/x` is absolute, anything else is relative to this
    /// path's directory. Returns `None` when the reference climbs above the filesystem root.
    pub fn resolve(&self, reference: &str, app_root: &LogicalPath) -> Option<LogicalPath> {
        let reference = reference.trim().replace('\\', "/");
        let parent = self.parent();
        let (base, rest) = if let Some(rest) = reference.strip_prefix("~/") {
            (app_root.parts(), rest.to_string())
        } else if reference == "~" {
            (app_root.parts(), String::new())
        } else if reference.starts_with('/') {
            (Vec::new(), reference)
        } else {
            (parent.parts(), reference)
        };
        let (parts, escaped) = normalize_parts(&base, &rest);
        if escaped {
            None
        } else {
            Some(LogicalPath::from_parts(&parts))
        }
    }

    /// True when `self` is `root` or lies beneath it.
    pub fn is_within(&self, root: &LogicalPath) -> bool {
        if root.is_root() || self == root {
            return true;
        }
        self.0
            .strip_prefix(root.as_str())
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    /// Map onto a physical location beneath `root`.
    pub fn to_physical(&self, root: &Path) -> PathBuf {
        root.join(string_to_os_path(&self.0))
    }

    /// Map a physical location beneath `root` back to its logical path.
    pub fn from_physical(root: &Path, physical: &Path) -> Result<LogicalPath, QuireError> {
        let relative = physical.strip_prefix(root)?;
        Ok(LogicalPath::new(os_path_to_string(relative)))
    }
}

/// Apply `path` onto `base`, returning the resulting segments and whether a `..` tried to climb
/// above the root.
fn normalize_parts<'a>(base: &[&'a str], path: &'a str) -> (Vec<&'a str>, bool) {
    let mut parts: Vec<&'a str> = base.to_vec();
    let mut escaped = false;
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    escaped = true;
                }
            }
            _ => parts.push(part),
        }
    }
    (parts, escaped)
}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for LogicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LogicalPath {
    fn from(s: &str) -> Self {
        LogicalPath::new(s)
    }
}

impl From<String> for LogicalPath {
    fn from(s: String) -> Self {
        LogicalPath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(LogicalPath::new("a/b/../c.page").as_str(), "/a/c.page");
        assert_eq!(LogicalPath::new("\\Dir\\.\\Index.page").as_str(), "/Dir/Index.page");
        assert_eq!(LogicalPath::new("//x//y/").as_str(), "/x/y");
        assert_eq!(LogicalPath::new("../../top").as_str(), "/top");
        assert_eq!(LogicalPath::new("").as_str(), "/");
        // case preserved
        assert_ne!(LogicalPath::new("/A.page"), LogicalPath::new("/a.page"));
    }

    #[test]
    fn test_components() {
        let path = LogicalPath::new("/site/docs/intro.page");
        assert_eq!(path.file_name(), "intro.page");
        assert_eq!(path.file_stem(), "intro");
        assert_eq!(path.extension(), Some("page"));
        assert_eq!(path.parent().as_str(), "/site/docs");
        assert_eq!(LogicalPath::root().parent(), LogicalPath::root());
        assert_eq!(LogicalPath::new("/.hidden").extension(), None);
    }

    #[test]
    fn test_resolve() {
        let root = LogicalPath::new("/app");
        let unit = LogicalPath::new("/app/pages/home.page");
        assert_eq!(
            unit.resolve("part.ctl", &root),
            Some(LogicalPath::new("/app/pages/part.ctl"))
        );
        assert_eq!(
            unit.resolve("../shared/site.master", &root),
            Some(LogicalPath::new("/app/shared/site.master"))
        );
        assert_eq!(
            unit.resolve("~/code/util.cs", &root),
            Some(LogicalPath::new("/app/code/util.cs"))
        );
        assert_eq!(
            unit.resolve("/other/x.page", &root),
            Some(LogicalPath::new("/other/x.page"))
        );
        assert_eq!(unit.resolve("../../../../etc/passwd", &root), None);
    }

    #[test]
    fn test_is_within() {
        let root = LogicalPath::new("/app");
        assert!(LogicalPath::new("/app/a.page").is_within(&root));
        assert!(LogicalPath::new("/app").is_within(&root));
        assert!(!LogicalPath::new("/application/a.page").is_within(&root));
        assert!(!LogicalPath::new("/a.page").is_within(&root));
        assert!(LogicalPath::new("/a.page").is_within(&LogicalPath::root()));
    }

    #[test]
    fn test_physical_round_trip() {
        let root = Path::new("/srv/site");
        let logical = LogicalPath::new("/docs/a.page");
        let physical = logical.to_physical(root);
        assert_eq!(LogicalPath::from_physical(root, &physical).unwrap(), logical);
    }
}
