use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{config::BuildConfig, error::QuireError, paths::LogicalPath, vfs::VirtualFileSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Page,
    Control,
    Master,
    Handler,
    /// The application entry unit. Always built alone, after everything else.
    Application,
    /// A raw source file in a target language.
    Code,
    /// Every source file directly inside a directory, compiled as one module.
    DirectoryAggregate,
}

impl UnitKind {
    /// Name of the directive that configures units of this kind.
    pub fn main_directive(&self) -> Option<&'static str> {
        match self {
            UnitKind::Page => Some("Page"),
            UnitKind::Control => Some("Control"),
            UnitKind::Master => Some("Master"),
            UnitKind::Handler => Some("Handler"),
            UnitKind::Application => Some("Application"),
            UnitKind::Code | UnitKind::DirectoryAggregate => None,
        }
    }

    pub fn is_markup(&self) -> bool {
        self.main_directive().is_some()
    }

    /// Standalone units never share a batch.
    pub fn is_standalone(&self) -> bool {
        matches!(self, UnitKind::Application | UnitKind::DirectoryAggregate)
    }

    /// Runtime base type generated classes derive from unless `Inherits` says otherwise.
    pub fn default_base_type(&self) -> &'static str {
        match self {
            UnitKind::Page => "Quire.Runtime.Page",
            UnitKind::Control => "Quire.Runtime.UserControl",
            UnitKind::Master => "Quire.Runtime.MasterPage",
            UnitKind::Handler => "Quire.Runtime.Handler",
            UnitKind::Application => "Quire.Runtime.Application",
            UnitKind::Code | UnitKind::DirectoryAggregate => "object",
        }
    }

    fn from_name(name: &str) -> Option<UnitKind> {
        match name.to_ascii_lowercase().as_str() {
            "page" => Some(UnitKind::Page),
            "control" => Some(UnitKind::Control),
            "master" => Some(UnitKind::Master),
            "handler" => Some(UnitKind::Handler),
            _ => None,
        }
    }

    /// Decide what kind of unit lives at `path`.
    pub fn classify(
        config: &BuildConfig,
        vfs: &dyn VirtualFileSystem,
        path: &LogicalPath,
    ) -> Result<UnitKind, QuireError> {
        if vfs.is_directory(path) {
            return Ok(UnitKind::DirectoryAggregate);
        }
        if path == &config.application_entry_path() {
            return Ok(UnitKind::Application);
        }
        let extension = path.extension().unwrap_or("");
        if let Some(kind) = config
            .unit_extensions
            .iter()
            .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
            .and_then(|(_, kind)| UnitKind::from_name(kind))
        {
            return Ok(kind);
        }
        if config.language_for_extension(extension).is_some() {
            return Ok(UnitKind::Code);
        }
        Err(QuireError::Custom(format!(
            "There is no build provider registered for the extension '.{extension}' ({path})."
        )))
    }
}

impl Display for UnitKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One source document on its way to becoming a module.
///
/// Units live for a single build attempt. Only the cache entry produced from them persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    pub path: LogicalPath,
    pub kind: UnitKind,
    pub language: String,
    /// Units that must be built first, in discovery order.
    pub dependencies: Vec<LogicalPath>,
    /// Source files of a directory aggregate.
    pub members: Vec<LogicalPath>,
    /// Position in discovery order; breaks ties deterministically.
    pub discovery_index: usize,
}

impl CompilationUnit {
    pub fn directory(&self) -> LogicalPath {
        match self.kind {
            UnitKind::DirectoryAggregate => self.path.clone(),
            _ => self.path.parent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFileSystem;

    #[test]
    fn test_classify() {
        let config = BuildConfig::default();
        let vfs = MemoryFileSystem::with_files([
            ("/global.app", ""),
            ("/index.page", ""),
            ("/parts/menu.ctl", ""),
            ("/site.master", ""),
            ("/code/util.cs", ""),
            ("/readme.txt", ""),
        ]);
        let kind = |p: &str| UnitKind::classify(&config, &vfs, &LogicalPath::new(p));
        assert_eq!(kind("/global.app").unwrap(), UnitKind::Application);
        assert_eq!(kind("/index.page").unwrap(), UnitKind::Page);
        assert_eq!(kind("/parts/menu.ctl").unwrap(), UnitKind::Control);
        assert_eq!(kind("/site.master").unwrap(), UnitKind::Master);
        assert_eq!(kind("/code/util.cs").unwrap(), UnitKind::Code);
        assert_eq!(kind("/code").unwrap(), UnitKind::DirectoryAggregate);
        assert!(kind("/readme.txt").is_err());
        assert!(UnitKind::Application.is_standalone());
        assert!(!UnitKind::Code.is_markup());
    }
}
