//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use parking_lot::Mutex;
use quire_core::{
    build::{BuildContext, BuildManager, CompileOutput, CompileRequest, ModuleHandle, Toolchain},
    config::BuildConfig,
    error::{Diagnostic, QuireError},
    event::BuildEvent,
    vfs::MemoryFileSystem,
};
use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Scriptable stand-in for an external compiler.
///
/// Reads every artifact it is handed and reports an error on each non-comment line containing
/// the marker text. Counts invocations and optionally sleeps to widen race windows. With
/// `first_error_only` it stops at the first failing artifact, like a compiler that gives up early.
#[allow(dead_code)]
pub struct FakeToolchain {
    pub marker: String,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<CompileRequest>>,
    pub delay: Option<Duration>,
    pub first_error_only: bool,
}

#[allow(dead_code)]
impl FakeToolchain {
    pub fn new() -> Self {
        FakeToolchain {
            marker: "FAIL_ME".to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            delay: None,
            first_error_only: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn first_error_only(mut self) -> Self {
        self.first_error_only = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.output_name.clone())
            .collect()
    }
}

impl Toolchain for FakeToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, QuireError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut diagnostics = Vec::new();
        for file in request.files.iter() {
            let text = fs::read_to_string(file)?;
            for (idx, line) in text.lines().enumerate() {
                let trimmed = line.trim_start();
                if line.contains(&self.marker)
                    && !trimmed.starts_with("//")
                    && !trimmed.starts_with('\'')
                {
                    diagnostics.push(Diagnostic::error(
                        file.to_string_lossy(),
                        idx + 1,
                        format!("The name '{}' does not exist", self.marker),
                    ));
                }
            }
            if self.first_error_only && !diagnostics.is_empty() {
                break;
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

/// A manager over an in-memory site, with artifacts written to a temp dir.
#[allow(dead_code)]
pub struct Harness {
    pub dir: TempDir,
    pub vfs: Arc<MemoryFileSystem>,
    pub toolchain: Arc<FakeToolchain>,
    pub manager: Arc<BuildManager>,
    pub events: UnboundedReceiver<BuildEvent>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Harness::with(files, BuildConfig::default(), FakeToolchain::new())
    }

    pub fn with(files: &[(&str, &str)], config: BuildConfig, toolchain: FakeToolchain) -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            output_dir: dir.path().join("out"),
            ..config
        };
        let vfs = Arc::new(MemoryFileSystem::with_files(
            files.iter().map(|(p, c)| (*p, *c)),
        ));
        let toolchain = Arc::new(toolchain);
        let (tx, events) = unbounded_channel();
        let ctx = BuildContext::new(config, vfs.clone(), toolchain.clone());
        let manager = Arc::new(BuildManager::new(ctx, Some(tx)));
        Harness {
            dir,
            vfs,
            toolchain,
            manager,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
