//! Merges one batch's fragments into compiland artifacts and invokes the toolchain once.

use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    build::{
        codegen::{Member, PartialTypeFragment, SourceLine, SourceOrigin},
        toolchain::{CompileRequest, ModuleHandle, Toolchain},
    },
    config::BuildConfig,
    error::{Diagnostic, QuireError},
    paths::LogicalPath,
};

struct MergedType {
    namespace: String,
    type_name: String,
    base_type: String,
    imports: Vec<String>,
    members: Vec<Member>,
    /// Contributing units with their content hashes, in discovery order.
    units: Vec<(LogicalPath, String)>,
}

struct RawSource {
    unit: LogicalPath,
    source: LogicalPath,
    text: String,
    content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LineInfo {
    unit: Option<LogicalPath>,
    origin: Option<SourceOrigin>,
}

#[derive(Default)]
struct ArtifactWriter {
    text: String,
    lines: Vec<LineInfo>,
}

impl ArtifactWriter {
    fn line(
        &mut self,
        text: impl AsRef<str>,
        unit: Option<&LogicalPath>,
        origin: Option<SourceOrigin>,
    ) -> Result<(), QuireError> {
        writeln!(self.text, "{}", text.as_ref())?;
        self.lines.push(LineInfo {
            unit: unit.cloned(),
            origin,
        });
        Ok(())
    }

    /// Emit a generated line preceded by its source-map marker.
    fn source(
        &mut self,
        comment: &str,
        indent: &str,
        line: &SourceLine,
        unit: Option<&LogicalPath>,
    ) -> Result<(), QuireError> {
        if let Some(origin) = &line.origin {
            self.line(
                format!("{comment} line {} {}", origin.line, origin.path),
                unit,
                None,
            )?;
        }
        self.line(format!("{indent}{}", line.text), unit, line.origin.clone())
    }
}

/// One written compiland file and the map from its lines back to sources.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub text: String,
    pub units: Vec<LogicalPath>,
    lines: Vec<LineInfo>,
}

impl Artifact {
    /// Unit and source line behind 1-based artifact `line`.
    pub fn map_line(&self, line: usize) -> (Option<LogicalPath>, Option<SourceOrigin>) {
        let info = line
            .checked_sub(1)
            .and_then(|idx| self.lines.get(idx))
            .cloned()
            .unwrap_or(LineInfo {
                unit: None,
                origin: None,
            });
        let unit = match (info.unit, self.units.as_slice()) {
            (Some(unit), _) => Some(unit),
            (None, [only]) => Some(only.clone()),
            (None, _) => None,
        };
        (unit, info.origin)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssemblyOutcome {
    pub module: Option<ModuleHandle>,
    /// Diagnostics mapped back to source units where possible.
    pub diagnostics: Vec<Diagnostic>,
    /// Units implicated by error diagnostics, in discovery order.
    pub failed_units: Vec<LogicalPath>,
    /// True when some error could not be attributed to any unit.
    pub unattributed_errors: bool,
    /// Text of the first artifact with an error.
    pub snapshot: Option<String>,
    pub artifacts: Vec<PathBuf>,
}

impl AssemblyOutcome {
    pub fn succeeded(&self) -> bool {
        self.module.is_some() && !self.diagnostics.iter().any(|d| d.is_error())
    }
}

/// Accumulates one batch. Fragments sharing (namespace, type) merge into one partial type; when
/// two fragments declare a member of the same name the first-discovered one is kept if the
/// signatures match, otherwise the later unit fails with a conflict diagnostic.
pub struct ModuleAssembler<'a> {
    config: &'a BuildConfig,
    language: String,
    output_name: String,
    artifact_seq: &'a AtomicUsize,
    types: Vec<MergedType>,
    raw_sources: Vec<RawSource>,
    references: Vec<String>,
    conflicts: Vec<Diagnostic>,
}

impl<'a> ModuleAssembler<'a> {
    pub fn new(
        config: &'a BuildConfig,
        language: &str,
        output_name: &str,
        artifact_seq: &'a AtomicUsize,
    ) -> Self {
        ModuleAssembler {
            config,
            language: language.to_string(),
            output_name: output_name.to_string(),
            artifact_seq,
            types: Vec::new(),
            raw_sources: Vec::new(),
            references: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.raw_sources.is_empty()
    }

    pub fn add_reference(&mut self, reference: impl Into<String>) {
        let reference = reference.into();
        if !self.references.contains(&reference) {
            self.references.push(reference);
        }
    }

    pub fn add_fragment(&mut self, fragment: PartialTypeFragment, content_hash: &str) {
        if fragment.language != self.language {
            self.conflicts.push(Diagnostic {
                unit: Some(fragment.unit.clone()),
                ..Diagnostic::error(
                    fragment.unit.as_str(),
                    0,
                    format!(
                        "Language '{}' cannot be compiled with '{}'.",
                        fragment.language, self.language
                    ),
                )
            });
            return;
        }
        let unit = fragment.unit.clone();
        let idx = match self
            .types
            .iter()
            .position(|t| t.namespace == fragment.namespace && t.type_name == fragment.type_name)
        {
            Some(idx) => idx,
            None => {
                self.types.push(MergedType {
                    namespace: fragment.namespace.clone(),
                    type_name: fragment.type_name.clone(),
                    base_type: fragment.base_type.clone(),
                    imports: Vec::new(),
                    members: Vec::new(),
                    units: Vec::new(),
                });
                self.types.len() - 1
            }
        };
        let merged = &mut self.types[idx];
        if merged.base_type != fragment.base_type {
            tracing::warn!(
                "[Assembler] {} declares base '{}' for {}.{}, keeping '{}'",
                unit,
                fragment.base_type,
                merged.namespace,
                merged.type_name,
                merged.base_type
            );
        }
        merged.units.push((unit.clone(), content_hash.to_string()));
        for import in fragment.imports {
            if !merged.imports.contains(&import) {
                merged.imports.push(import);
            }
        }
        for member in fragment.members {
            match merged.members.iter().find(|m| m.name == member.name) {
                Some(first) if first.signature == member.signature => {
                    tracing::debug!(
                        "[Assembler] {} redeclares {} of {}.{}; keeping the declaration from {}",
                        unit,
                        member.name,
                        merged.namespace,
                        merged.type_name,
                        first.unit
                    );
                }
                Some(first) => self.conflicts.push(Diagnostic {
                    unit: Some(unit.clone()),
                    ..Diagnostic::error(
                        unit.as_str(),
                        0,
                        format!(
                            "Member '{}' of '{}.{}' conflicts with the declaration in '{}'.",
                            member.name, merged.namespace, merged.type_name, first.unit
                        ),
                    )
                }),
                None => merged.members.push(member),
            }
        }
    }

    /// Add a raw source file belonging to `unit` (a code unit or a directory aggregate member).
    pub fn add_raw_source(
        &mut self,
        unit: &LogicalPath,
        source: &LogicalPath,
        text: String,
        content_hash: &str,
    ) {
        self.raw_sources.push(RawSource {
            unit: unit.clone(),
            source: source.clone(),
            text,
            content_hash: content_hash.to_string(),
        });
    }

    fn comment(&self) -> String {
        self.config
            .language(&self.language)
            .map(|l| l.comment_prefix.clone())
            .unwrap_or_else(|| "//".to_string())
    }

    fn extension(&self) -> String {
        self.config
            .language(&self.language)
            .map(|l| l.artifact_extension.clone())
            .unwrap_or_else(|| "gen".to_string())
    }

    fn next_artifact_path(&self) -> PathBuf {
        let n = self.artifact_seq.fetch_add(1, Ordering::SeqCst);
        self.config.output_dir.join(format!(
            "{}_{}.{}",
            self.config.artifact_prefix,
            n,
            self.extension()
        ))
    }

    fn render_type(&self, merged: &MergedType) -> Result<(String, Vec<LineInfo>), QuireError> {
        let comment = self.comment();
        let mut out = ArtifactWriter::default();
        for (unit, hash) in merged.units.iter() {
            out.line(format!("{comment} source: {unit} sha256:{hash}"), None, None)?;
        }
        for import in merged.imports.iter() {
            out.line(format!("using {import};"), None, None)?;
        }
        out.line(format!("namespace {}", merged.namespace), None, None)?;
        out.line("{", None, None)?;
        out.line(
            format!(
                "    public partial class {} : {}",
                merged.type_name, merged.base_type
            ),
            None,
            None,
        )?;
        out.line("    {", None, None)?;
        for member in merged.members.iter() {
            let unit = Some(&member.unit);
            for declaration in member.declarations.iter() {
                out.source(&comment, "        ", declaration, unit)?;
            }
            if let Some(body) = &member.body {
                out.line(format!("        {}", member.signature), unit, None)?;
                out.line("        {", unit, None)?;
                for line in body.iter() {
                    out.source(&comment, "            ", line, unit)?;
                }
                out.line("        }", unit, None)?;
            }
        }
        out.line("    }", None, None)?;
        out.line("}", None, None)?;
        Ok((out.text, out.lines))
    }

    fn render_raw(&self, raw: &RawSource) -> Result<(String, Vec<LineInfo>), QuireError> {
        let mut text = String::new();
        let mut lines = Vec::new();
        writeln!(
            text,
            "{} source: {} sha256:{}",
            self.comment(),
            raw.source,
            raw.content_hash
        )?;
        lines.push(LineInfo {
            unit: Some(raw.unit.clone()),
            origin: None,
        });
        for (idx, line) in raw.text.lines().enumerate() {
            writeln!(text, "{line}")?;
            lines.push(LineInfo {
                unit: Some(raw.unit.clone()),
                origin: Some(SourceOrigin {
                    path: raw.source.clone(),
                    line: idx + 1,
                }),
            });
        }
        Ok((text, lines))
    }

    fn units(&self) -> Vec<LogicalPath> {
        let mut units: Vec<LogicalPath> = Vec::new();
        let all = self
            .types
            .iter()
            .flat_map(|t| t.units.iter().map(|(u, _)| u))
            .chain(self.raw_sources.iter().map(|r| &r.unit));
        for unit in all {
            if !units.contains(unit) {
                units.push(unit.clone());
            }
        }
        units
    }

    /// Write the artifacts and run the toolchain. `None` when the batch contributed nothing.
    #[tracing::instrument(skip_all, fields(output = %self.output_name, language = %self.language))]
    pub fn compile(self, toolchain: &dyn Toolchain) -> Result<Option<AssemblyOutcome>, QuireError> {
        if !self.conflicts.is_empty() {
            let mut outcome = AssemblyOutcome {
                diagnostics: self.conflicts.clone(),
                ..Default::default()
            };
            for diagnostic in self.conflicts.iter() {
                if let Some(unit) = &diagnostic.unit {
                    if !outcome.failed_units.contains(unit) {
                        outcome.failed_units.push(unit.clone());
                    }
                }
            }
            tracing::info!(
                "[Assembler] {} merge conflicts, not compiling",
                self.conflicts.len()
            );
            return Ok(Some(outcome));
        }
        if self.is_empty() {
            return Ok(None);
        }

        fs::create_dir_all(&self.config.output_dir)?;
        let mut artifacts: Vec<Artifact> = Vec::new();
        for merged in self.types.iter() {
            let (text, lines) = self.render_type(merged)?;
            artifacts.push(Artifact {
                path: self.next_artifact_path(),
                text,
                units: merged.units.iter().map(|(u, _)| u.clone()).collect(),
                lines,
            });
        }
        for raw in self.raw_sources.iter() {
            let (text, lines) = self.render_raw(raw)?;
            artifacts.push(Artifact {
                path: self.next_artifact_path(),
                text,
                units: vec![raw.unit.clone()],
                lines,
            });
        }
        for artifact in artifacts.iter() {
            fs::write(&artifact.path, &artifact.text)?;
        }

        let mut options = self
            .config
            .language(&self.language)
            .map(|l| l.compiler_options.clone())
            .unwrap_or_default();
        if self.config.debug {
            options.push("DEBUG".to_string());
        }
        let request = CompileRequest {
            language: self.language.clone(),
            files: artifacts.iter().map(|a| a.path.clone()).collect(),
            references: self.references.clone(),
            options,
            output_dir: self.config.output_dir.clone(),
            output_name: self.output_name.clone(),
        };
        tracing::debug!(
            "[Assembler] compiling {} artifacts for {:?}",
            artifacts.len(),
            self.units()
        );
        let output = toolchain.compile(&request)?;

        let by_path: HashMap<PathBuf, &Artifact> =
            artifacts.iter().map(|a| (a.path.clone(), a)).collect();
        let mut outcome = AssemblyOutcome {
            artifacts: artifacts.iter().map(|a| a.path.clone()).collect(),
            ..Default::default()
        };
        for mut diagnostic in output.diagnostics.into_iter() {
            let artifact = by_path.get(&PathBuf::from(&diagnostic.file)).copied();
            if let Some(artifact) = artifact {
                let (unit, origin) = artifact.map_line(diagnostic.line);
                if let Some(origin) = origin {
                    diagnostic.file = origin.path.to_string();
                    diagnostic.line = origin.line;
                }
                diagnostic.unit = unit;
                if diagnostic.is_error() && outcome.snapshot.is_none() {
                    outcome.snapshot = Some(artifact.text.clone());
                }
            }
            if diagnostic.is_error() {
                match &diagnostic.unit {
                    Some(unit) if !outcome.failed_units.contains(unit) => {
                        outcome.failed_units.push(unit.clone())
                    }
                    Some(_) => {}
                    None => outcome.unattributed_errors = true,
                }
            }
            outcome.diagnostics.push(diagnostic);
        }
        let has_errors = outcome.diagnostics.iter().any(|d| d.is_error());
        if !has_errors && output.module.is_none() {
            outcome.diagnostics.push(Diagnostic::error(
                self.output_name.clone(),
                0,
                "The compiler reported success but produced no module.",
            ));
            outcome.unattributed_errors = true;
        }
        outcome.module = if has_errors { None } else { output.module };
        tracing::info!(
            "[Assembler] {} -> {} ({} diagnostics)",
            self.output_name,
            outcome
                .module
                .as_ref()
                .map(|m| m.id.as_str())
                .unwrap_or("<failed>"),
            outcome.diagnostics.len()
        );
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::toolchain::CompileOutput;
    use parking_lot::Mutex;

    /// Records requests; reports an error on any artifact line containing `FAIL`.
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<CompileRequest>>,
    }

    impl Toolchain for Recorder {
        fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, QuireError> {
            self.requests.lock().push(request.clone());
            let mut diagnostics = Vec::new();
            for file in request.files.iter() {
                let text = fs::read_to_string(file)?;
                for (idx, line) in text.lines().enumerate() {
                    if line.contains("FAIL") && !line.trim_start().starts_with("//") {
                        diagnostics.push(Diagnostic::error(
                            file.to_string_lossy(),
                            idx + 1,
                            "bad code",
                        ));
                    }
                }
            }
            let module = diagnostics
                .is_empty()
                .then(|| ModuleHandle::new(request.output_name.clone(), None));
            Ok(CompileOutput {
                diagnostics,
                module,
            })
        }
    }

    fn fragment(unit: &str, members: Vec<(&str, &str, &str)>) -> PartialTypeFragment {
        let unit = LogicalPath::new(unit);
        PartialTypeFragment {
            unit: unit.clone(),
            language: "csharp".to_string(),
            namespace: "Shop".to_string(),
            type_name: "Cart".to_string(),
            base_type: "Quire.Runtime.Page".to_string(),
            imports: vec!["System".to_string()],
            members: members
                .into_iter()
                .map(|(name, signature, line)| Member {
                    name: name.to_string(),
                    signature: signature.to_string(),
                    body: Some(vec![SourceLine {
                        text: line.to_string(),
                        origin: Some(SourceOrigin {
                            path: unit.clone(),
                            line: 7,
                        }),
                    }]),
                    declarations: Vec::new(),
                    unit: unit.clone(),
                })
                .collect(),
            custom_string: None,
        }
    }

    fn config(dir: &std::path::Path) -> BuildConfig {
        BuildConfig {
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_merge_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let seq = AtomicUsize::new(0);
        let toolchain = Recorder::default();
        let mut assembler = ModuleAssembler::new(&config, "csharp", "quire_batch_0", &seq);
        assembler.add_fragment(
            fragment("/a.page", vec![("Total", "int Total()", "return 1;")]),
            "aa",
        );
        assembler.add_fragment(
            fragment(
                "/b.page",
                vec![("Total", "int Total()", "return 2;"), ("Name", "string Name()", "return \"b\";")],
            ),
            "bb",
        );
        let outcome = assembler.compile(&toolchain).unwrap().unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.artifacts.len(), 1);
        let text = fs::read_to_string(&outcome.artifacts[0]).unwrap();
        assert!(text.starts_with("// source: /a.page sha256:aa\n// source: /b.page sha256:bb\n"));
        assert!(text.contains("return 1;"));
        assert!(!text.contains("return 2;"));
        assert!(text.contains("return \"b\";"));
        assert!(text.contains("// line 7 /a.page"));
        assert_eq!(seq.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.requests.lock().len(), 1);
    }

    #[test]
    fn test_signature_conflict_fails_later_unit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let seq = AtomicUsize::new(0);
        let toolchain = Recorder::default();
        let mut assembler = ModuleAssembler::new(&config, "csharp", "quire_batch_0", &seq);
        assembler.add_fragment(fragment("/a.page", vec![("Total", "int Total()", "return 1;")]), "aa");
        assembler.add_fragment(fragment("/b.page", vec![("Total", "long Total()", "return 2;")]), "bb");
        let outcome = assembler.compile(&toolchain).unwrap().unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.failed_units, vec![LogicalPath::new("/b.page")]);
        assert!(toolchain.requests.lock().is_empty());
    }

    #[test]
    fn test_diagnostics_map_to_units() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            debug: true,
            ..config(dir.path())
        };
        let seq = AtomicUsize::new(0);
        let toolchain = Recorder::default();
        let mut assembler = ModuleAssembler::new(&config, "csharp", "quire_batch_0", &seq);
        assembler.add_reference("System.Web");
        let mut other = fragment("/b.page", vec![("Render", "void Render()", "FAIL();")]);
        other.type_name = "Other".to_string();
        assembler.add_fragment(fragment("/a.page", vec![("Render", "void Render()", "ok();")]), "aa");
        assembler.add_fragment(other, "bb");
        assembler.add_raw_source(
            &LogicalPath::new("/code/util.cs"),
            &LogicalPath::new("/code/util.cs"),
            "class Util {}\n".to_string(),
            "cc",
        );
        let outcome = assembler.compile(&toolchain).unwrap().unwrap();
        assert_eq!(outcome.failed_units, vec![LogicalPath::new("/b.page")]);
        assert!(!outcome.unattributed_errors);
        let error = &outcome.diagnostics[0];
        assert_eq!(error.file, "/b.page");
        assert_eq!(error.line, 7);
        assert!(outcome.snapshot.as_deref().unwrap().contains("FAIL();"));
        let request = &toolchain.requests.lock()[0];
        assert_eq!(request.files.len(), 3);
        assert_eq!(request.references, vec!["System.Web".to_string()]);
        assert!(request.options.contains(&"DEBUG".to_string()));
    }

    #[test]
    fn test_empty_batch_compiles_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let seq = AtomicUsize::new(0);
        let assembler = ModuleAssembler::new(&config, "csharp", "quire_batch_0", &seq);
        assert!(assembler.compile(&Recorder::default()).unwrap().is_none());
    }
}
