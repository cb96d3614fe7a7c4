//! Markup front end: from source text to a [`DocumentTree`].
//!
//! ## Key Components
//!
//! - [`Tokenizer`] - Mode-switching lexer with a rolling SHA-256 checksum over consumed text
//! - [`Parser`] - Pull-based event stream (tags, directives, code blocks, includes, comments)
//! - [`TreeBuilder`] - Resolves server tags through the component registry, expands includes,
//!   binds attributes against property schemas and produces a [`ParsedUnit`]
//! - [`ParseDiagnostic`] - Non-fatal findings such as unresolved server tags
//!
//! Server tags are tags carrying `runat="server"`. Every other tag is literal output, though code
//! blocks inside its attribute values are still extracted.
//!
//! ```rust
//! use quire_core::{
//!     build::unit::UnitKind, config::BuildConfig, markup::TreeBuilder, paths::LogicalPath,
//!     registry::ComponentRegistry, vfs::MemoryFileSystem,
//! };
//!
//! let vfs = MemoryFileSystem::with_files([("/index.page", "Hello")]);
//! let registry = ComponentRegistry::create();
//! let config = BuildConfig::default();
//! let unit = TreeBuilder::new(&vfs, &registry, &config)
//!     .build(&LogicalPath::new("/index.page"), UnitKind::Page)
//!     .unwrap();
//! assert_eq!(unit.tree.outline(), "Root[Literal(\"Hello\")]");
//! ```

pub mod builder;
pub mod diagnostic;
pub mod parser;
pub mod token;
pub mod tokenizer;
pub mod tree;

pub use builder::{check_duplicate_ids, DirectiveData, ParsedUnit, TreeBuilder};
pub use diagnostic::{ParseDiagnostic, UnresolvedTag};
pub use parser::{parse_all, Attribute, ParseEvent, Parser, TagData};
pub use token::{CodeKind, Position, Token, TokenKind};
pub use tokenizer::{strip_server_comments, Tokenizer};
pub use tree::{
    BoundAttribute, BoundValue, BuilderNode, DocumentTree, IncludeKind, Node, ParseLocation,
};
