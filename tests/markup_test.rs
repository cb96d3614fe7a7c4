//! The markup front end through its public API with the built-in registry.

use quire_core::{
    build::unit::UnitKind,
    config::BuildConfig,
    error::QuireError,
    markup::TreeBuilder,
    paths::LogicalPath,
    registry::ComponentRegistry,
    vfs::MemoryFileSystem,
};
use test_log::test;

fn build(files: &[(&str, &str)], path: &str) -> Result<quire_core::markup::ParsedUnit, QuireError> {
    let vfs = MemoryFileSystem::with_files(files.iter().map(|(p, c)| (*p, *c)));
    let registry = ComponentRegistry::create();
    let config = BuildConfig::default();
    TreeBuilder::new(&vfs, &registry, &config).build(&LogicalPath::new(path), UnitKind::Page)
}

#[test]
fn test_includes_are_tracked_once() {
    let unit = build(
        &[
            (
                "/a.page",
                "<%@ Page Language=\"C#\" %>\n<!-- #include file=\"inc/h.inc\" -->\n<!-- #include virtual=\"~/inc/h.inc\" -->\n",
            ),
            ("/inc/h.inc", "<h1>head</h1>"),
        ],
        "/a.page",
    )
    .unwrap();
    assert_eq!(unit.included_files, vec![LogicalPath::new("/inc/h.inc")]);
    assert_eq!(unit.language.as_deref(), Some("csharp"));
    assert_eq!(unit.checksum.len(), 64);
}

#[test]
fn test_duplicate_server_ids_report_the_second_tag() {
    let err = build(
        &[(
            "/a.page",
            "<div runat=\"server\" id=\"a\"></div>\n<div runat=\"server\" id=\"a\"></div>\n",
        )],
        "/a.page",
    )
    .unwrap_err();
    let QuireError::Parse(parse) = err else {
        panic!("expected a parse error, got {err:?}");
    };
    assert_eq!(parse.message, "Id 'a' is already used by another control.");
    assert_eq!(parse.location.begin.line, 2);
}

#[test]
fn test_plain_tags_stay_literal() {
    let unit = build(&[("/a.page", "<div id=\"a\"></div><div id=\"a\"></div>")], "/a.page").unwrap();
    assert!(unit.tree.components().is_empty());
}

#[test]
fn test_missing_include() {
    let err = build(&[("/a.page", "<!-- #include file=\"gone.inc\" -->")], "/a.page").unwrap_err();
    assert!(
        err.to_string().contains("The file '/gone.inc' does not exist."),
        "{err}"
    );
}
