use parking_lot::{Mutex, ReentrantMutex};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    build::{
        assembler::{AssemblyOutcome, ModuleAssembler},
        codegen::{CodeGenerator, PartialTypeFragment, TemplateGenerator},
        graph::{BuildBatch, BuildGraph},
        record::{content_hash, BuildRecord, BuildRecordFile, BuildRecordStore},
        toolchain::{ModuleHandle, Toolchain},
        unit::{CompilationUnit, UnitKind},
    },
    cache::{CacheEntry, CacheStats, Claim, CompilationCache},
    config::BuildConfig,
    deps::DependencyExtractor,
    error::{BuildFailure, QuireError},
    event::BuildEvent,
    markup::TreeBuilder,
    paths::LogicalPath,
    registry::{ComponentRegistry, ComponentResolver},
    vfs::VirtualFileSystem,
};

/// Everything a [`BuildManager`] builds with.
#[derive(Clone)]
pub struct BuildContext {
    pub config: BuildConfig,
    pub vfs: Arc<dyn VirtualFileSystem>,
    pub registry: Arc<dyn ComponentResolver>,
    pub toolchain: Arc<dyn Toolchain>,
    pub generator: Arc<dyn CodeGenerator>,
}

impl BuildContext {
    /// Context with the built-in component registry and the template code generator.
    pub fn new(
        config: BuildConfig,
        vfs: Arc<dyn VirtualFileSystem>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Self {
        BuildContext {
            config,
            vfs,
            registry: Arc::new(ComponentRegistry::create()),
            toolchain,
            generator: Arc::new(TemplateGenerator),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ComponentResolver>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = generator;
        self
    }
}

/// Unit ready for assembly.
struct PreparedUnit {
    unit: CompilationUnit,
    source: PreparedSource,
    content_hash: String,
    /// The unit's own files, before dependency files are folded in.
    own_files: Vec<LogicalPath>,
}

enum PreparedSource {
    Fragment(PartialTypeFragment),
    /// (file, text) pairs of a code unit or directory aggregate.
    Raw(Vec<(LogicalPath, String)>),
}

enum BatchResult {
    Done,
    /// Retries ran out with units still failing.
    Exhausted(BuildFailure),
}

#[derive(Default)]
struct ManagerState {
    /// Modules produced during the current top-level build, referenced by later batches.
    scratch_modules: Vec<String>,
    /// Paths this manager has cached at least once.
    ever_built: HashSet<LogicalPath>,
    rebuilds: usize,
    restart_requested: bool,
    precompiled: bool,
}

/// Incremental, dependency-driven build orchestrator.
///
/// ## Overview
///
/// [`BuildManager::build_path`] turns one logical path into a cached module entry, building every
/// uncached prerequisite on the way:
///
/// 1. The path must exist in the virtual filesystem, otherwise the call fails with
///    [`QuireError::NotFound`].
/// 2. A cache hit returns immediately without taking any lock.
/// 3. Otherwise the caller claims the path's build ticket. Concurrent callers for the same path
///    block on the ticket and re-check the cache once the owner finishes, so at most one build
///    per path is in flight.
/// 4. The owner takes the process-wide (reentrant) build lock, discovers the uncached unit set
///    through [`BuildGraph::discover`], partitions it into ordered batches and compiles each
///    batch with [`ModuleAssembler`].
///
/// ## Batch Failure Handling
///
/// A failing batch has the units its diagnostics implicate removed and is retried, up to
/// `max_batch_retries` attempts. A batch that starts with one unit and fails is fatal. When
/// retries run out, or the requested path is otherwise left uncached, the manager escalates to
/// a nested build of the requested path. Nested builds (recursion depth > 1) always compile
/// every unit alone. The requested unit is the sink of its graph and so always forms the last
/// batch on its own.
///
/// ## Restart Breaker
///
/// Rebuilding paths that were already built counts against `num_recompiles_before_restart`.
/// Crossing it emits [`BuildEvent::RestartRequested`] once; the host decides what to do.
pub struct BuildManager {
    ctx: BuildContext,
    cache: Arc<CompilationCache>,
    deps: DependencyExtractor,
    build_lock: ReentrantMutex<()>,
    state: Mutex<ManagerState>,
    depth: AtomicUsize,
    module_seq: AtomicUsize,
    artifact_seq: AtomicUsize,
    tx: Option<UnboundedSender<BuildEvent>>,
}

impl BuildManager {
    /// Create a manager with a fresh cache.
    ///
    /// # Arguments
    /// * `ctx` - configuration, filesystem, registry, toolchain and code generator
    /// * `tx` - Optional channel sender for BuildEvents (if None, events are not transmitted)
    pub fn new(ctx: BuildContext, tx: Option<UnboundedSender<BuildEvent>>) -> Self {
        BuildManager::with_cache(ctx, Arc::new(CompilationCache::new()), tx)
    }

    pub fn with_cache(
        ctx: BuildContext,
        cache: Arc<CompilationCache>,
        tx: Option<UnboundedSender<BuildEvent>>,
    ) -> Self {
        if let Some(sender) = tx.clone() {
            cache.add_listener(Box::new(move |key, reason| {
                let _ = sender.send(BuildEvent::UnitEvicted(key.to_string(), reason));
            }));
        }
        BuildManager {
            ctx,
            cache,
            deps: DependencyExtractor::new(),
            build_lock: ReentrantMutex::new(()),
            state: Mutex::new(ManagerState::default()),
            depth: AtomicUsize::new(0),
            module_seq: AtomicUsize::new(0),
            artifact_seq: AtomicUsize::new(0),
            tx,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.ctx.config
    }

    pub fn cache(&self) -> &Arc<CompilationCache> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn emit(&self, event: BuildEvent) {
        tracing::trace!("[BuildManager] {}", event);
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("[BuildManager] event receiver dropped");
            }
        }
    }

    /// Build `path` (and whatever it needs) and return its cache entry.
    #[tracing::instrument(skip_all, fields(path = %path))]
    pub fn build_path(&self, path: &LogicalPath) -> Result<Arc<CacheEntry>, QuireError> {
        if !self.ctx.vfs.exists(path) {
            return Err(QuireError::not_found(path));
        }
        let key = CompilationCache::key_for(path);
        loop {
            if let Some(entry) = self.cache.get(&key) {
                return Ok(entry);
            }
            match self.cache.claim(&key) {
                Claim::Owner(_ticket) => return self.build_locked(path),
                Claim::Reentrant => return self.build_locked(path),
                Claim::Waited => continue,
            }
        }
    }

    fn build_locked(&self, path: &LogicalPath) -> Result<Arc<CacheEntry>, QuireError> {
        let _guard = self.build_lock.lock();
        let key = CompilationCache::key_for(path);
        if let Some(entry) = self.cache.peek(&key) {
            return Ok(entry);
        }
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth == 1 {
            self.state.lock().scratch_modules.clear();
        }
        let rebuild = self.state.lock().ever_built.contains(path);
        let result = self.build_inner(path, depth);
        self.depth.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() && rebuild && depth <= 1 {
            self.count_rebuild();
        }
        result?;
        self.cache.peek(&key).ok_or_else(|| {
            QuireError::compilation(
                BuildFailure::new("Requested virtual path build failed.")
                    .with_implicated(vec![path.clone()]),
            )
        })
    }

    fn count_rebuild(&self) {
        let mut state = self.state.lock();
        state.rebuilds += 1;
        if state.rebuilds > self.ctx.config.num_recompiles_before_restart && !state.restart_requested
        {
            state.restart_requested = true;
            let count = state.rebuilds;
            drop(state);
            tracing::warn!(
                "[BuildManager] {} rebuilds exceed num_recompiles_before_restart ({}), requesting restart",
                count,
                self.ctx.config.num_recompiles_before_restart
            );
            self.emit(BuildEvent::RestartRequested(count));
        }
    }

    /// True once the restart breaker has tripped.
    pub fn restart_requested(&self) -> bool {
        self.state.lock().restart_requested
    }

    fn build_inner(&self, requested: &LogicalPath, depth: usize) -> Result<(), QuireError> {
        let config = &self.ctx.config;
        let single =
            !config.batch || depth > 1 || requested == &config.application_entry_path();
        let graph = BuildGraph::discover(
            self.ctx.vfs.as_ref(),
            config,
            &self.deps,
            &self.cache,
            requested,
        )?;
        let batches = graph.partition(single)?;
        tracing::debug!(
            "[BuildManager] building {} at depth {} ({} batches, single: {})",
            requested,
            depth,
            batches.len(),
            single
        );
        let key = CompilationCache::key_for(requested);

        for (index, batch) in batches.iter().enumerate() {
            let failure = match self.compile_batch(index, batch, requested, single)? {
                BatchResult::Done => continue,
                BatchResult::Exhausted(failure) => failure,
            };
            if !self.cache.contains(&key) && depth <= 1 {
                tracing::info!(
                    "[BuildManager] batch {} exhausted its retries, building {} alone",
                    index,
                    requested
                );
                self.build_locked(requested)?;
            }
            if self.cache.contains(&key) {
                if config.debug {
                    tracing::warn!(
                        "[BuildManager] Path '{}' built successfully, but a compilation error was raised for other files: {}",
                        requested,
                        failure
                    );
                }
                return Ok(());
            }
            return Err(QuireError::compilation(BuildFailure {
                message: "Requested virtual path build failed.".to_string(),
                ..failure
            }));
        }

        if !self.cache.contains(&key) && depth <= 1 && !single {
            tracing::info!(
                "[BuildManager] {} was not built with its batch, building it alone",
                requested
            );
            self.build_locked(requested)?;
        }
        Ok(())
    }

    fn output_name(&self, units: &[PreparedUnit]) -> String {
        let n = self.module_seq.fetch_add(1, Ordering::SeqCst);
        match units {
            [only] => format!(
                "{}_{}_{}",
                self.ctx.config.artifact_prefix,
                only.unit.path.file_stem(),
                n
            ),
            _ => format!("{}_batch_{}", self.ctx.config.artifact_prefix, n),
        }
    }

    fn compile_batch(
        &self,
        index: usize,
        batch: &BuildBatch,
        requested: &LogicalPath,
        single: bool,
    ) -> Result<BatchResult, QuireError> {
        let mut units: Vec<CompilationUnit> = Vec::new();
        for unit in batch.units.iter() {
            if self.cache.contains(&CompilationCache::key_for(&unit.path)) {
                continue;
            }
            let missing = unit
                .dependencies
                .iter()
                .find(|d| !self.cache.contains(&CompilationCache::key_for(d)));
            match missing {
                Some(dep) => self.emit(BuildEvent::UnitDropped(
                    unit.path.clone(),
                    format!("dependency {dep} is not built"),
                )),
                None => units.push(unit.clone()),
            }
        }

        let mut prepared = Vec::new();
        for unit in units {
            match self.prepare(&unit) {
                Ok(p) => prepared.push(p),
                Err(err) if single || &unit.path == requested => return Err(err),
                Err(err) => {
                    tracing::warn!("[BuildManager] dropping {}: {}", unit.path, err);
                    self.emit(BuildEvent::UnitDropped(unit.path.clone(), err.to_string()));
                }
            }
        }

        // a batch that starts with several units is never treated as a single-file build, even
        // once retries have shrunk it to one
        let single_unit = prepared.len() == 1;
        let retries = self.ctx.config.max_batch_retries;
        for attempt in 1..=retries {
            if prepared.is_empty() {
                return Ok(BatchResult::Done);
            }
            let outcome = self.assemble(&prepared, &batch.language)?;
            let Some(outcome) = outcome else {
                self.emit(BuildEvent::BatchCompiled(index, Vec::new(), None));
                return Ok(BatchResult::Done);
            };
            if outcome.succeeded() {
                self.store(index, &prepared, outcome)?;
                return Ok(BatchResult::Done);
            }

            let failure = self.failure(&outcome);
            if single_unit {
                return Err(QuireError::compilation(BuildFailure {
                    message: "Single file build failed.".to_string(),
                    ..failure
                }));
            }
            if outcome.unattributed_errors || outcome.failed_units.is_empty() {
                return Err(QuireError::compilation(failure));
            }
            if attempt == retries {
                tracing::info!(
                    "[BuildManager] batch {} failed {} times, giving up on {} units",
                    index,
                    attempt,
                    prepared.len()
                );
                return Ok(BatchResult::Exhausted(failure));
            }
            prepared.retain(|p| !outcome.failed_units.contains(&p.unit.path));
            tracing::info!(
                "[BuildManager] batch {} attempt {} failed, retrying without {:?}",
                index,
                attempt,
                outcome.failed_units
            );
            self.emit(BuildEvent::BatchRetried(
                index,
                attempt,
                outcome.failed_units.clone(),
            ));
        }
        Ok(BatchResult::Done)
    }

    fn failure(&self, outcome: &AssemblyOutcome) -> BuildFailure {
        let snapshot = if self.ctx.config.debug {
            outcome.snapshot.clone()
        } else {
            None
        };
        BuildFailure::new("Compilation failed.")
            .with_implicated(outcome.failed_units.clone())
            .with_diagnostics(outcome.diagnostics.clone())
            .with_snapshot(snapshot)
    }

    /// Parse and generate a markup unit, or read the sources of a raw one.
    fn prepare(&self, unit: &CompilationUnit) -> Result<PreparedUnit, QuireError> {
        let vfs = self.ctx.vfs.as_ref();
        match unit.kind {
            UnitKind::Code => {
                let bytes = vfs.open(&unit.path)?;
                let text = vfs.read_to_string(&unit.path)?;
                Ok(PreparedUnit {
                    unit: unit.clone(),
                    source: PreparedSource::Raw(vec![(unit.path.clone(), text)]),
                    content_hash: content_hash(&bytes),
                    own_files: vec![unit.path.clone()],
                })
            }
            UnitKind::DirectoryAggregate => {
                let mut files = Vec::new();
                let mut hashes = String::new();
                for member in unit.members.iter() {
                    hashes.push_str(&content_hash(&vfs.open(member)?));
                    files.push((member.clone(), vfs.read_to_string(member)?));
                }
                let mut own_files = vec![unit.path.clone()];
                own_files.extend(unit.members.iter().cloned());
                Ok(PreparedUnit {
                    unit: unit.clone(),
                    source: PreparedSource::Raw(files),
                    content_hash: content_hash(hashes.as_bytes()),
                    own_files,
                })
            }
            _ => {
                let bytes = vfs.open(&unit.path)?;
                let builder = TreeBuilder::new(vfs, self.ctx.registry.as_ref(), &self.ctx.config);
                let parsed = builder.build(&unit.path, unit.kind)?;
                for diagnostic in parsed.diagnostics.iter() {
                    tracing::info!("[BuildManager] {}: {}", unit.path, diagnostic);
                }
                let fragment = self.ctx.generator.generate(&parsed, &self.ctx.config)?;
                let mut own_files = vec![unit.path.clone()];
                for file in parsed
                    .included_files
                    .iter()
                    .chain(parsed.user_components.iter())
                {
                    if !own_files.contains(file) {
                        own_files.push(file.clone());
                    }
                }
                Ok(PreparedUnit {
                    unit: unit.clone(),
                    source: PreparedSource::Fragment(fragment),
                    content_hash: content_hash(&bytes),
                    own_files,
                })
            }
        }
    }

    fn assemble(
        &self,
        prepared: &[PreparedUnit],
        language: &str,
    ) -> Result<Option<AssemblyOutcome>, QuireError> {
        let output_name = self.output_name(prepared);
        let mut assembler =
            ModuleAssembler::new(&self.ctx.config, language, &output_name, &self.artifact_seq);
        for reference in self.ctx.config.references.iter() {
            assembler.add_reference(reference.clone());
        }
        for module in self.state.lock().scratch_modules.iter() {
            assembler.add_reference(module.clone());
        }
        for p in prepared.iter() {
            for dep in p.unit.dependencies.iter() {
                if let Some(entry) = self.cache.peek(&CompilationCache::key_for(dep)) {
                    assembler.add_reference(module_reference(&entry.module));
                }
            }
        }
        for p in prepared.iter() {
            match &p.source {
                PreparedSource::Fragment(fragment) => {
                    assembler.add_fragment(fragment.clone(), &p.content_hash)
                }
                PreparedSource::Raw(files) => {
                    for (file, text) in files.iter() {
                        assembler.add_raw_source(&p.unit.path, file, text.clone(), &p.content_hash);
                    }
                }
            }
        }
        assembler.compile(self.ctx.toolchain.as_ref())
    }

    fn store(
        &self,
        index: usize,
        prepared: &[PreparedUnit],
        outcome: AssemblyOutcome,
    ) -> Result<(), QuireError> {
        let Some(module) = outcome.module else {
            return Err(QuireError::Internal(
                "successful assembly without a module".to_string(),
            ));
        };
        let mut paths = Vec::new();
        for p in prepared.iter() {
            let mut invalidation_files = p.own_files.clone();
            for dep in p.unit.dependencies.iter() {
                if let Some(entry) = self.cache.peek(&CompilationCache::key_for(dep)) {
                    for file in entry.invalidation_files.iter() {
                        if !invalidation_files.contains(file) {
                            invalidation_files.push(file.clone());
                        }
                    }
                }
            }
            let (type_name, custom_string) = match &p.source {
                PreparedSource::Fragment(fragment) => {
                    (fragment.qualified_type(), fragment.custom_string.clone())
                }
                PreparedSource::Raw(_) => (String::new(), None),
            };
            let entry = CacheEntry {
                key: String::new(),
                path: p.unit.path.clone(),
                module: module.clone(),
                type_name,
                custom_string,
                invalidation_files: Vec::new(),
                dependencies: p.unit.dependencies.clone(),
                content_hash: p.content_hash.clone(),
                precompiled: false,
            };
            self.cache.put(
                &CompilationCache::key_for(&p.unit.path),
                entry,
                invalidation_files,
            );
            self.state.lock().ever_built.insert(p.unit.path.clone());
            self.emit(BuildEvent::UnitCached(p.unit.path.clone(), module.id.clone()));
            paths.push(p.unit.path.clone());
        }
        self.state.lock().scratch_modules.push(module_reference(&module));
        tracing::info!(
            "[BuildManager] batch {} compiled {} units into {}",
            index,
            paths.len(),
            module.id
        );
        self.emit(BuildEvent::BatchCompiled(index, paths, Some(module.id)));
        Ok(())
    }

    /// Direct build-time prerequisites of `path`.
    pub fn get_virtual_path_dependencies(
        &self,
        path: &LogicalPath,
    ) -> Result<Vec<LogicalPath>, QuireError> {
        Ok(self
            .deps
            .scan(self.ctx.vfs.as_ref(), path, &self.ctx.config)?
            .dependencies
            .clone())
    }

    /// Build `path` if needed and return the custom string its generator attached.
    pub fn get_compiled_custom_string(
        &self,
        path: &LogicalPath,
    ) -> Result<Option<String>, QuireError> {
        Ok(self.build_path(path)?.custom_string.clone())
    }

    /// Build `path` if needed and return its generated type.
    pub fn get_compiled_type(&self, path: &LogicalPath) -> Result<String, QuireError> {
        Ok(self.build_path(path)?.type_name.clone())
    }

    /// True when a precompiled record manifest was loaded.
    pub fn is_precompiled(&self) -> bool {
        self.state.lock().precompiled
    }

    /// Evict everything built from `path` and forget its memoized directive scan. Returns the
    /// evicted cache keys.
    pub fn file_changed(&self, path: &LogicalPath) -> Vec<String> {
        self.deps.forget(path);
        let mut evicted = self.cache.file_changed(path);
        // a new or removed member changes its directory aggregate
        for key in self.cache.file_changed(&path.parent()) {
            if !evicted.contains(&key) {
                evicted.push(key);
            }
        }
        evicted
    }

    /// Restore cache entries from `store`. Stale records are skipped. Returns the number restored.
    pub fn load_records(&self, store: &BuildRecordStore) -> Result<usize, QuireError> {
        let file = store.load()?;
        let mut restored = 0;
        for record in file.records.iter() {
            if let Some(reason) = record.staleness(self.ctx.vfs.as_ref()) {
                tracing::debug!(
                    "[BuildManager] skipping record for {}: {}",
                    record.logical_path,
                    reason
                );
                continue;
            }
            let entry = record.to_entry(file.precompiled);
            let invalidation_files = entry.invalidation_files.clone();
            self.cache.put(
                &CompilationCache::key_for(&record.logical_path),
                entry,
                invalidation_files,
            );
            restored += 1;
        }
        if file.precompiled {
            self.state.lock().precompiled = true;
        }
        tracing::info!(
            "[BuildManager] restored {} of {} build records from {:?}",
            restored,
            file.records.len(),
            store.path()
        );
        Ok(restored)
    }

    /// Write a record for every cached unit. Returns the number written.
    pub fn save_records(&self, store: &BuildRecordStore) -> Result<usize, QuireError> {
        let mut records = Vec::new();
        for entry in self.cache.entries() {
            records.push(BuildRecord::from_entry(&entry, self.ctx.vfs.as_ref())?);
        }
        let count = records.len();
        store.save(&BuildRecordFile {
            precompiled: self.is_precompiled(),
            records,
        })?;
        Ok(count)
    }
}

/// Modules are referenced by path when they have one, otherwise by id.
fn module_reference(module: &ModuleHandle) -> String {
    module
        .path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| module.id.clone())
}
