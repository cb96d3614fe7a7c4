//! Markup through code generation and assembly, without the build manager.

use super::helpers::*;
use crate::{
    build::{
        assembler::ModuleAssembler, codegen::CodeGenerator, codegen::TemplateGenerator,
        record::content_hash, unit::UnitKind,
    },
    config::BuildConfig,
    markup::TreeBuilder,
    paths::LogicalPath,
};
use std::sync::atomic::AtomicUsize;
use test_log::test;

fn config(dir: &tempfile::TempDir) -> BuildConfig {
    BuildConfig {
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[test]
fn test_error_maps_back_to_markup_line() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let vfs = site(&[(
        "/a.page",
        "<%@ Page %>\n<p>hello</p>\n<%= Missing() %>\n<q:Label runat=\"server\" id=\"title\" Text=\"hi\" />\n",
    )]);
    let registry = sample_registry();
    let path = LogicalPath::new("/a.page");
    let parsed = TreeBuilder::new(&vfs, &registry, &config)
        .build(&path, UnitKind::Page)
        .unwrap();
    let fragment = TemplateGenerator.generate(&parsed, &config).unwrap();
    assert!(fragment.member("title").is_some());

    let seq = AtomicUsize::new(0);
    let mut assembler = ModuleAssembler::new(&config, "csharp", "quire_a_0", &seq);
    assembler.add_fragment(fragment, &content_hash(b"a"));
    let toolchain = MarkerToolchain::new("Missing");
    let outcome = assembler.compile(&toolchain).unwrap().unwrap();

    assert!(!outcome.succeeded());
    assert_eq!(outcome.failed_units, vec![path.clone()]);
    let error = outcome
        .diagnostics
        .iter()
        .find(|d| d.is_error())
        .unwrap();
    assert_eq!(error.unit, Some(path));
    assert_eq!(error.file, "/a.page");
    assert_eq!(error.line, 3);
    assert!(outcome.snapshot.unwrap().contains("writer.Write(Missing());"));
    assert_eq!(toolchain.requests.lock().len(), 1);
}

#[test]
fn test_batch_of_pages_compiles_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let vfs = site(&[("/a.page", "<p>a</p>"), ("/b.page", "<p>b</p>")]);
    let registry = sample_registry();
    let builder = TreeBuilder::new(&vfs, &registry, &config);

    let seq = AtomicUsize::new(0);
    let mut assembler = ModuleAssembler::new(&config, "csharp", "quire_batch_0", &seq);
    for page in ["/a.page", "/b.page"] {
        let parsed = builder.build(&LogicalPath::new(page), UnitKind::Page).unwrap();
        let fragment = TemplateGenerator.generate(&parsed, &config).unwrap();
        assembler.add_fragment(fragment, &parsed.checksum);
    }
    let toolchain = MarkerToolchain::new("FAIL_ME");
    let outcome = assembler.compile(&toolchain).unwrap().unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.artifacts.len(), 2);
    let requests = toolchain.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].output_name, "quire_batch_0");
    assert_eq!(requests[0].files.len(), 2);
}
