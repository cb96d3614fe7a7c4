//! The external compiler seen as a black box.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    config::ToolchainConfig,
    error::{Diagnostic, QuireError, Severity},
};

/// `file(line[,col]): error|warning CODE: message`
static DIAGNOSTIC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<file>.+?)\((?P<line>\d+)(?:,(?P<col>\d+))?\)\s*:\s*(?P<sev>error|warning|info)\s*(?P<code>[A-Za-z]+\d+)?\s*:\s*(?P<msg>.*)$",
    )
    .expect("diagnostic pattern is valid")
});

/// Identity of a produced module. Cache entries of every unit in a batch share one handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleHandle {
    pub id: String,
    pub path: Option<PathBuf>,
}

impl ModuleHandle {
    pub fn new(id: impl Into<String>, path: Option<PathBuf>) -> Self {
        ModuleHandle {
            id: id.into(),
            path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub language: String,
    pub files: Vec<PathBuf>,
    /// Ids or paths of referenced modules.
    pub references: Vec<String>,
    pub options: Vec<String>,
    pub output_dir: PathBuf,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompileOutput {
    pub diagnostics: Vec<Diagnostic>,
    pub module: Option<ModuleHandle>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }
}

/// Any toolchain qualifies provided its diagnostics are per file, line and severity.
pub trait Toolchain: Send + Sync {
    /// Compile `request`. Compiler errors are reported in the output; `Err` is reserved for a
    /// toolchain that could not run at all.
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, QuireError>;
}

/// Parse one line of compiler output.
pub fn parse_diagnostic_line(line: &str) -> Option<Diagnostic> {
    let caps = DIAGNOSTIC_REGEX.captures(line.trim())?;
    let severity = match &caps["sev"] {
        "error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    };
    Some(Diagnostic {
        severity,
        file: caps["file"].to_string(),
        line: caps["line"].parse().ok()?,
        column: caps
            .name("col")
            .and_then(|c| c.as_str().parse().ok())
            .unwrap_or(0),
        code: caps.name("code").map(|c| c.as_str().to_string()),
        message: caps["msg"].to_string(),
        unit: None,
    })
}

/// Runs the configured external command once per compile.
///
/// Invocation: `command [args..] --language L --out DIR/NAME.module [--reference R].. [--define D]..
/// FILES..`. The module exists when the command exits successfully and wrote the output file.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    config: ToolchainConfig,
}

impl ProcessToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        ProcessToolchain { config }
    }

    fn output_path(request: &CompileRequest) -> PathBuf {
        request
            .output_dir
            .join(format!("{}.module", request.output_name))
    }
}

impl Toolchain for ProcessToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, QuireError> {
        if self.config.command.is_empty() {
            return Err(QuireError::ToolchainUnavailable(
                "no toolchain command configured".to_string(),
            ));
        }
        let out_path = ProcessToolchain::output_path(request);
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .arg("--language")
            .arg(&request.language)
            .arg("--out")
            .arg(&out_path);
        for reference in request.references.iter() {
            command.arg("--reference").arg(reference);
        }
        for option in request.options.iter() {
            command.arg("--define").arg(option);
        }
        command.args(&request.files);
        tracing::debug!(
            "[Toolchain] running {} on {} files",
            self.config.command,
            request.files.len()
        );

        let output = command.output().map_err(|err| match err.kind() {
            ErrorKind::NotFound => QuireError::ToolchainUnavailable(format!(
                "'{}' could not be started: {}",
                self.config.command, err
            )),
            _ => QuireError::from(err),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut diagnostics: Vec<Diagnostic> = stdout
            .lines()
            .chain(stderr.lines())
            .filter_map(parse_diagnostic_line)
            .collect();

        if !output.status.success() && !diagnostics.iter().any(|d| d.is_error()) {
            if !stderr.is_empty() {
                tracing::debug!("[Toolchain] stderr: {}", stderr);
            }
            diagnostics.push(Diagnostic::error(
                request.output_name.clone(),
                0,
                format!("compiler exited with status {}", output.status),
            ));
        }

        let module = if output.status.success() && Path::new(&out_path).exists() {
            Some(ModuleHandle::new(request.output_name.clone(), Some(out_path)))
        } else {
            None
        };
        Ok(CompileOutput {
            diagnostics,
            module,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diagnostic_line() {
        let diag = parse_diagnostic_line("/tmp/quire/quire_3.cs(12,5): error CS1002: ; expected").unwrap();
        assert_eq!(diag.file, "/tmp/quire/quire_3.cs");
        assert_eq!(diag.line, 12);
        assert_eq!(diag.column, 5);
        assert_eq!(diag.code.as_deref(), Some("CS1002"));
        assert_eq!(diag.message, "; expected");
        assert!(diag.is_error());

        let warning = parse_diagnostic_line("a.vb(3): warning: unused variable").unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.code, None);
        assert!(parse_diagnostic_line("Build succeeded.").is_none());
    }

    #[test]
    fn test_missing_command_is_unavailable() {
        let toolchain = ProcessToolchain::new(ToolchainConfig {
            command: "quire-no-such-compiler".to_string(),
            args: Vec::new(),
        });
        let dir = tempfile::tempdir().unwrap();
        let request = CompileRequest {
            language: "csharp".to_string(),
            files: Vec::new(),
            references: Vec::new(),
            options: Vec::new(),
            output_dir: dir.path().to_path_buf(),
            output_name: "quire_0".to_string(),
        };
        assert!(matches!(
            toolchain.compile(&request),
            Err(QuireError::ToolchainUnavailable(_))
        ));
    }
}
