//! From parsed units to cached modules.
//!
//! ## Key Components
//!
//! - [`BuildManager`] - Orchestrates discovery, batching, compilation, retries and escalation
//! - [`BuildGraph`] - Uncached unit set for one request, cycle detection and batch partitioning
//! - [`ModuleAssembler`] - Merges partial types, writes artifacts and runs the toolchain once
//! - [`CodeGenerator`] - Turns a [`ParsedUnit`](crate::markup::ParsedUnit) into a
//!   [`PartialTypeFragment`]; [`TemplateGenerator`] is the built-in implementation
//! - [`Toolchain`] - The external compiler; [`ProcessToolchain`] runs a configured command
//! - [`BuildRecordStore`] - Persisted build records for restoring the cache across processes
//!
//! ## Batching
//!
//! Units discovered for one request are grouped by dependency level, directory and language.
//! Each group compiles into one module, so a request touching a directory of pages pays for one
//! toolchain invocation instead of one per page. Application entries and directory aggregates
//! always compile alone, and the application entry compiles last.

pub mod assembler;
pub mod codegen;
pub mod graph;
pub mod manager;
pub mod record;
pub mod toolchain;
pub mod unit;

pub use assembler::{Artifact, AssemblyOutcome, ModuleAssembler};
pub use codegen::{CodeGenerator, Member, PartialTypeFragment, SourceLine, SourceOrigin, TemplateGenerator};
pub use graph::{BuildBatch, BuildGraph};
pub use manager::{BuildContext, BuildManager};
pub use record::{content_hash, BuildRecord, BuildRecordFile, BuildRecordStore, RecordedFile};
pub use toolchain::{CompileOutput, CompileRequest, ModuleHandle, ProcessToolchain, Toolchain};
pub use unit::{CompilationUnit, UnitKind};
