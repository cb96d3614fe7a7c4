//! Shared test utilities for in-crate tests

use crate::{
    build::toolchain::{CompileOutput, CompileRequest, ModuleHandle, Toolchain},
    error::{Diagnostic, QuireError},
    registry::{Capability, ComponentDescriptor, ComponentRegistry, PropertyKind, PropertySchema},
    vfs::MemoryFileSystem,
};
use parking_lot::Mutex;
use std::fs;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Built-in registry plus `<q:Label>` (Text, Width) and `<q:Panel>` (body, naming container).
pub fn sample_registry() -> ComponentRegistry {
    let registry = ComponentRegistry::create();
    registry.register(
        "q",
        "Label",
        ComponentDescriptor::new("Quire.Controls", "Label")
            .with_property(PropertySchema::new("Text", PropertyKind::String))
            .with_property(PropertySchema::new("Width", PropertyKind::Integer)),
    );
    registry.register(
        "q",
        "Panel",
        ComponentDescriptor::new("Quire.Controls", "Panel")
            .with_capabilities(Capability::HasBody | Capability::NamingContainer),
    );
    registry
}

/// In-memory site from (logical path, content) pairs.
pub fn site(files: &[(&str, &str)]) -> MemoryFileSystem {
    MemoryFileSystem::with_files(files.iter().map(|(p, c)| (*p, *c)))
}

/// Toolchain that reads the written artifacts and reports an error on every line containing
/// `marker`. Successful compiles produce a module without a file.
pub struct MarkerToolchain {
    pub marker: String,
    pub requests: Mutex<Vec<CompileRequest>>,
}

impl MarkerToolchain {
    pub fn new(marker: &str) -> Self {
        MarkerToolchain {
            marker: marker.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl Toolchain for MarkerToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, QuireError> {
        self.requests.lock().push(request.clone());
        let mut diagnostics = Vec::new();
        for file in request.files.iter() {
            let text = fs::read_to_string(file)?;
            for (idx, line) in text.lines().enumerate() {
                if line.contains(&self.marker) && !line.trim_start().starts_with("//") {
                    diagnostics.push(Diagnostic::error(
                        file.to_string_lossy(),
                        idx + 1,
                        format!("'{}' is not defined", self.marker),
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
