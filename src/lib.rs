//! # quire-core
//!
//! An incremental, dependency-driven compiler for markup documents with embedded code.
//!
//! ## Overview
//!
//! quire-core turns a tree of markup pages, controls, layouts and handlers into compiled modules
//! produced by an external toolchain. Each request for a logical path builds the path and every
//! uncached prerequisite, grouping independent units into batches so one toolchain invocation
//! covers many documents. Results are cached per unit and evicted when any file they were built
//! from changes.
//!
//! ### Key Features
//!
//! - **Markup front end**: Mode-switching tokenizer, pull-based parser and a tree builder that
//!   resolves server tags through a component registry
//! - **Static dependency scan**: Cheap directive scan that discovers prerequisites without parsing
//! - **Batched builds**: Units grouped by dependency level, directory and language
//! - **Failure isolation**: Failing units are removed from their batch and the rest retried
//! - **Source mapping**: Toolchain diagnostics map back to markup lines
//! - **File-based invalidation**: Edits to a page, an include or a dependency evict exactly the
//!   entries built from them
//! - **Event streaming**: [`event::BuildEvent`]s over a tokio channel
//!
//! ## Architecture
//!
//! - **[`markup`]**: Tokenizer, parser, tree builder (`TreeBuilder`, `ParsedUnit`)
//! - **[`deps`]**: Directive scan for build-time prerequisites
//! - **[`build`]**: Build graph, code generation, module assembly, toolchain seam and the
//!   [`build::BuildManager`] orchestrator
//! - **[`cache`]**: Compilation cache with per-key build tickets and invalidation listeners
//! - **[`registry`]**: Component descriptors and property schemas for server tags
//! - **[`vfs`]**: Virtual filesystem seam with physical and in-memory implementations
//! - **[`config`]**: TOML build configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quire_core::{
//!     build::{BuildContext, BuildManager, ProcessToolchain},
//!     config::{ConfigProvider, TomlConfigProvider},
//!     paths::LogicalPath,
//!     vfs::PhysicalFileSystem,
//! };
//! use std::{path::PathBuf, sync::Arc};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TomlConfigProvider::new(PathBuf::from("./site/quire.toml")).get_config()?;
//!     let toolchain = Arc::new(ProcessToolchain::new(config.toolchain.clone()));
//!     let vfs = Arc::new(PhysicalFileSystem::new("./site"));
//!     let manager = BuildManager::new(BuildContext::new(config, vfs, toolchain), None);
//!
//!     let entry = manager.build_path(&LogicalPath::new("/index.page"))?;
//!     println!("{} -> {}", entry.type_name, entry.module.id);
//!     Ok(())
//! }
//! ```
//!
//! ### Build Events
//!
//! ```rust,no_run
//! # use quire_core::{build::{BuildContext, BuildManager, ProcessToolchain}, config::BuildConfig, vfs::PhysicalFileSystem};
//! # use std::sync::Arc;
//! # let config = BuildConfig::default();
//! # let toolchain = Arc::new(ProcessToolchain::new(config.toolchain.clone()));
//! # let ctx = BuildContext::new(config, Arc::new(PhysicalFileSystem::new("./site")), toolchain);
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let manager = BuildManager::new(ctx, Some(tx));
//! // ... build ...
//! while let Ok(event) = rx.try_recv() {
//!     println!("{event}");
//! }
//! ```
//!
//! ## Features
//!
//! - **default**: Parsing, dependency scanning, building and caching
//! - **service**: File watching (`notify`) that evicts cache entries as sources change

pub mod build;
pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod event;
pub mod markup;
pub mod paths;
pub mod registry;
#[cfg(test)]
mod tests;
pub mod vfs;
#[cfg(feature = "service")]
pub mod watch;

pub use error::*;
