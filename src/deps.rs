//! Static dependency extraction.
//!
//! A cheap regex scan over a unit's directives, run ahead of and independently from tree
//! building. It never tokenizes markup bodies, so it cannot report structural errors; those
//! surface when the unit itself is parsed.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::{collections::HashMap, sync::Arc};

use crate::{
    build::unit::UnitKind,
    config::BuildConfig,
    error::QuireError,
    markup::tokenizer::strip_server_comments,
    paths::LogicalPath,
    vfs::VirtualFileSystem,
};

static DIRECTIVE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<%@(.*?)%>").expect("directive pattern is valid"));

static ATTRIBUTE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([\w:.\-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"']+))"#)
        .expect("attribute pattern is valid")
});

/// (directive, attribute) pairs naming build-time prerequisites.
const PATH_ATTRIBUTES: &[(&str, &str)] = &[
    ("*", "CodeFile"),
    ("*", "Src"),
    ("*", "MasterPageFile"),
    ("Register", "Src"),
    ("Reference", "VirtualPath"),
    ("Reference", "Page"),
    ("Reference", "Control"),
    ("MasterType", "VirtualPath"),
    ("PreviousPageType", "VirtualPath"),
    ("Assembly", "Src"),
];

/// What a directive scan learned about a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveScan {
    pub kind: UnitKind,
    /// Canonical language name.
    pub language: String,
    /// Units that must be built first, deduplicated, in discovery order.
    pub dependencies: Vec<LogicalPath>,
    /// Source files of a directory aggregate.
    pub members: Vec<LogicalPath>,
}

struct RawDirective<'t> {
    name: Option<&'t str>,
    attributes: Vec<(&'t str, &'t str)>,
}

impl RawDirective<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }
}

fn raw_directives(text: &str) -> Vec<RawDirective<'_>> {
    DIRECTIVE_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| {
            let body = body.as_str().trim_start();
            let word_end = body
                .find(|c: char| c.is_whitespace() || c == '=')
                .unwrap_or(body.len());
            let (name, rest) = if word_end > 0 && !body[word_end..].trim_start().starts_with('=') {
                (Some(&body[..word_end]), &body[word_end..])
            } else {
                (None, body)
            };
            let attributes = ATTRIBUTE_REGEX
                .captures_iter(rest)
                .filter_map(|caps| {
                    let key = caps.get(1)?.as_str();
                    let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?.as_str();
                    Some((key, value))
                })
                .collect();
            RawDirective { name, attributes }
        })
        .collect()
}

/// Scan the directives of a markup unit's `text`.
///
/// Dependency values starting with `~/` resolve against the application root; others resolve
/// against the unit's directory. Values escaping the application root are skipped with a warning.
pub fn scan_directives(
    text: &str,
    unit_path: &LogicalPath,
    kind: UnitKind,
    config: &BuildConfig,
) -> DirectiveScan {
    let text = strip_server_comments(text);
    let main = kind.main_directive().unwrap_or("Page");
    let mut language = None;
    let mut dependencies: Vec<LogicalPath> = Vec::new();

    for directive in raw_directives(&text) {
        let name = directive.name.unwrap_or(main);
        let is_main = name.eq_ignore_ascii_case(main);
        if is_main && language.is_none() {
            language = directive
                .get("Language")
                .and_then(|l| config.canonical_language(l));
        }
        let mut values: Vec<&str> = PATH_ATTRIBUTES
            .iter()
            .filter(|(owner, _)| {
                if *owner == "*" {
                    is_main
                } else {
                    owner.eq_ignore_ascii_case(name)
                }
            })
            .filter_map(|(_, attr)| directive.get(attr))
            .collect();
        // Inherits usually names a type; it is a dependency only when it names a source file.
        if is_main {
            if let Some(inherits) = directive.get("Inherits") {
                let ext = inherits.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
                if inherits.contains('/')
                    && (config.language_for_extension(ext).is_some()
                        || config.unit_extensions.contains_key(&ext.to_ascii_lowercase()))
                {
                    values.push(inherits);
                }
            }
        }

        for value in values {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match unit_path.resolve(value, &config.app_root) {
                Some(dep) if dep.is_within(&config.app_root) => {
                    if &dep != unit_path && !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }
                _ => tracing::warn!(
                    "[Deps] {}: skipping dependency '{}' outside the application root",
                    unit_path,
                    value
                ),
            }
        }
    }

    DirectiveScan {
        kind,
        language: language.unwrap_or_else(|| config.default_language.clone()),
        dependencies,
        members: Vec::new(),
    }
}

/// Read, classify and scan the unit at `path`.
pub fn extract_dependencies(
    vfs: &dyn VirtualFileSystem,
    path: &LogicalPath,
    config: &BuildConfig,
) -> Result<DirectiveScan, QuireError> {
    if !vfs.exists(path) {
        return Err(QuireError::not_found(path));
    }
    let kind = UnitKind::classify(config, vfs, path)?;
    match kind {
        UnitKind::DirectoryAggregate => {
            let mut language: Option<String> = None;
            let mut members = Vec::new();
            for file in vfs.enumerate(path)? {
                let Some(file_language) = file
                    .extension()
                    .and_then(|ext| config.language_for_extension(ext))
                else {
                    continue;
                };
                match &language {
                    Some(existing) if existing != file_language => {
                        return Err(QuireError::Custom(format!(
                            "The files in '{path}' use different languages ('{existing}' and '{file_language}')."
                        )))
                    }
                    Some(_) => {}
                    None => language = Some(file_language.to_string()),
                }
                members.push(file);
            }
            Ok(DirectiveScan {
                kind,
                language: language.unwrap_or_else(|| config.default_language.clone()),
                dependencies: Vec::new(),
                members,
            })
        }
        UnitKind::Code => {
            let language = path
                .extension()
                .and_then(|ext| config.language_for_extension(ext))
                .unwrap_or(config.default_language.as_str())
                .to_string();
            Ok(DirectiveScan {
                kind,
                language,
                dependencies: Vec::new(),
                members: Vec::new(),
            })
        }
        _ => {
            let text = vfs.read_to_string(path)?;
            Ok(scan_directives(&text, path, kind, config))
        }
    }
}

/// Memoizing wrapper around [`extract_dependencies`], keyed by unit identity.
#[derive(Default)]
pub struct DependencyExtractor {
    memo: RwLock<HashMap<LogicalPath, Arc<DirectiveScan>>>,
}

impl DependencyExtractor {
    pub fn new() -> Self {
        DependencyExtractor::default()
    }

    pub fn scan(
        &self,
        vfs: &dyn VirtualFileSystem,
        path: &LogicalPath,
        config: &BuildConfig,
    ) -> Result<Arc<DirectiveScan>, QuireError> {
        if let Some(found) = self.memo.read().get(path) {
            return Ok(found.clone());
        }
        let scan = Arc::new(extract_dependencies(vfs, path, config)?);
        tracing::trace!(
            "[Deps] {} ({}) depends on {:?}",
            path,
            scan.kind,
            scan.dependencies
        );
        self.memo.write().insert(path.clone(), scan.clone());
        Ok(scan)
    }

    /// Drop the memoized scan for `path` and for the directory aggregate containing it.
    pub fn forget(&self, path: &LogicalPath) {
        let mut memo = self.memo.write();
        memo.remove(path);
        memo.remove(&path.parent());
    }

    pub fn clear(&self) {
        self.memo.write().clear();
    }
}
