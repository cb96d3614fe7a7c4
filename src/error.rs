use std::{fmt, io, path::StripPrefixError};

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

use crate::{markup::tree::ParseLocation, paths::LogicalPath};

/// Severity of a toolchain or assembler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single per-file/line diagnostic. `file` is the compiland artifact the toolchain reported
/// against until the assembler maps it back, after which `unit` and `line` refer to the source
/// markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub code: Option<String>,
    pub message: String,
    pub unit: Option<LogicalPath>,
}

impl Diagnostic {
    pub fn error(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            file: file.into(),
            line,
            column: 0,
            code: None,
            message: message.into(),
            unit: None,
        }
    }

    pub fn warning(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(file, line, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self
            .unit
            .as_ref()
            .map(|u| u.as_str())
            .unwrap_or(self.file.as_str());
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{}({}): {}", file, self.line, severity)?;
        if let Some(code) = &self.code {
            write!(f, " {code}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// A markup error anchored at the span that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub location: ParseLocation,
    pub message: String,
}

impl ParseError {
    pub fn new(location: ParseLocation, message: impl Into<String>) -> Self {
        ParseError {
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

const DEBUG_NOTICE: &str = "******* DEBUG MODE MESSAGE *******\n\
This build ran with debugging enabled. Generated source is shown above; disable `debug` in the \
build configuration before deploying.";

/// The structured value every fatal build condition surfaces as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub message: String,
    pub implicated: Vec<LogicalPath>,
    pub diagnostics: Vec<Diagnostic>,
    pub source_snapshot: Option<String>,
}

impl BuildFailure {
    pub fn new(message: impl Into<String>) -> Self {
        BuildFailure {
            message: message.into(),
            implicated: Vec::new(),
            diagnostics: Vec::new(),
            source_snapshot: None,
        }
    }

    pub fn with_implicated(mut self, implicated: Vec<LogicalPath>) -> Self {
        self.implicated = implicated;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_snapshot(mut self, snapshot: Option<String>) -> Self {
        self.source_snapshot = snapshot;
        self
    }

    /// User-visible rendering. The generated source snapshot only appears in debug mode.
    pub fn render(&self, debug: bool, suppress_notice: bool) -> String {
        let mut out = self.to_string();
        for diagnostic in self.diagnostics.iter() {
            out.push('\n');
            out.push_str(&diagnostic.to_string());
        }
        if debug {
            if let Some(snapshot) = &self.source_snapshot {
                out.push_str("\n\n");
                out.push_str(snapshot);
            }
            if !suppress_notice {
                out.push_str("\n\n");
                out.push_str(DEBUG_NOTICE);
            }
        }
        out
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.implicated.is_empty() {
            let units = self
                .implicated
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " [{units}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum QuireError {
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Compilation error: {0}")]
    Compilation(Box<BuildFailure>),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Circular dependency between: {}", .0.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(" -> "))]
    DependencyCycle(Vec<LogicalPath>),
    #[error("Internal consistency error: {0}")]
    Internal(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Parser error: {0}")]
    Parse(ParseError),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Compiler toolchain unavailable: {0}")]
    ToolchainUnavailable(String),
}

impl QuireError {
    pub fn not_found(path: &LogicalPath) -> Self {
        QuireError::NotFound(format!("The file '{path}' does not exist."))
    }

    pub fn parse(location: ParseLocation, message: impl Into<String>) -> Self {
        QuireError::Parse(ParseError::new(location, message))
    }

    pub fn compilation(failure: BuildFailure) -> Self {
        QuireError::Compilation(Box::new(failure))
    }

    /// Only compilation failures are recovered at batch granularity.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuireError::Compilation(_))
    }

    /// Collapse any error into the structured failure shape hosts display.
    pub fn to_failure(&self) -> BuildFailure {
        match self {
            QuireError::Compilation(failure) => failure.as_ref().clone(),
            QuireError::Parse(err) => BuildFailure::new(err.message.clone())
                .with_implicated(vec![err.location.path.clone()])
                .with_diagnostics(vec![Diagnostic {
                    unit: Some(err.location.path.clone()),
                    column: err.location.begin.column,
                    ..Diagnostic::error(
                        err.location.path.as_str(),
                        err.location.begin.line,
                        err.message.clone(),
                    )
                }]),
            QuireError::DependencyCycle(members) => {
                BuildFailure::new(self.to_string()).with_implicated(members.clone())
            }
            other => BuildFailure::new(other.to_string()),
        }
    }
}

impl From<ParseError> for QuireError {
    fn from(src: ParseError) -> QuireError {
        QuireError::Parse(src)
    }
}

impl From<StripPrefixError> for QuireError {
    fn from(src: StripPrefixError) -> QuireError {
        QuireError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for QuireError {
    fn from(src: toml::de::Error) -> QuireError {
        QuireError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for QuireError {
    fn from(src: toml::ser::Error) -> QuireError {
        QuireError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for QuireError {
    fn from(src: JsonError) -> QuireError {
        QuireError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for QuireError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => QuireError::NotFound(format!("{x}")),
            _ => QuireError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<walkdir::Error> for QuireError {
    fn from(x: walkdir::Error) -> Self {
        match x.io_error() {
            Some(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                QuireError::NotFound(format!("{x}"))
            }
            _ => QuireError::Io(format!("Directory walk failed: {x}")),
        }
    }
}

impl From<fmt::Error> for QuireError {
    fn from(x: fmt::Error) -> Self {
        QuireError::Internal(format!("{x}"))
    }
}

impl From<RegexError> for QuireError {
    fn from(x: RegexError) -> Self {
        QuireError::Serialization(format!("Regex parse failed: {x}"))
    }
}

#[cfg(feature = "service")]
impl From<notify::Error> for QuireError {
    fn from(x: notify::Error) -> Self {
        QuireError::Io(format!("File watcher error: {x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = QuireError::not_found(&LogicalPath::new("/missing.page"));
        assert_eq!(err.to_string(), "The file '/missing.page' does not exist.");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_snapshot_hidden_outside_debug() {
        let failure = BuildFailure::new("Compilation failed.")
            .with_implicated(vec![LogicalPath::new("/a.page")])
            .with_snapshot(Some("class Page_a {}".to_string()));
        let quiet = failure.render(false, false);
        assert!(quiet.contains("Compilation failed. [/a.page]"));
        assert!(!quiet.contains("class Page_a"));
        assert!(!quiet.contains("DEBUG MODE"));

        let loud = failure.render(true, false);
        assert!(loud.contains("class Page_a"));
        assert!(loud.contains("DEBUG MODE"));

        let no_notice = failure.render(true, true);
        assert!(!no_notice.contains("DEBUG MODE"));
    }

    #[test]
    fn test_io_mapping() {
        let err: QuireError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, QuireError::NotFound(_)));
        let err: QuireError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, QuireError::Io(_)));
    }

    #[test]
    fn test_cycle_display() {
        let err = QuireError::DependencyCycle(vec![
            LogicalPath::new("/a.page"),
            LogicalPath::new("/b.page"),
        ]);
        assert_eq!(
            err.to_string(),
            "Circular dependency between: /a.page -> /b.page"
        );
        assert_eq!(err.to_failure().implicated.len(), 2);
    }
}
