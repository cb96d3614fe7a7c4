//! Code generation: one [`PartialTypeFragment`] per markup unit.
//!
//! The generated type derives from the unit kind's runtime base type (or `Inherits`) and
//! carries:
//!
//! - a field per component with an `id`
//! - the bodies of `<script runat="server">` blocks
//! - `__BuildControlN` members that instantiate components and set their bound properties
//! - `__Render` (and `__RenderBodyN` for component bodies) writing literal text and code blocks

use crate::{
    build::unit::UnitKind,
    config::BuildConfig,
    error::QuireError,
    markup::{
        builder::ParsedUnit,
        token::CodeKind,
        tree::{BoundValue, BuilderNode, Node},
    },
    paths::LogicalPath,
    registry::{generated_type_name, Capability, PropertyValue, GENERATED_NAMESPACE},
};

/// Where a generated line came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOrigin {
    pub path: LogicalPath,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub text: String,
    pub origin: Option<SourceOrigin>,
}

impl SourceLine {
    fn plain(text: impl Into<String>) -> Self {
        SourceLine {
            text: text.into(),
            origin: None,
        }
    }

    fn at(text: impl Into<String>, node: &Node) -> Self {
        SourceLine {
            text: text.into(),
            origin: Some(SourceOrigin {
                path: node.location.path.clone(),
                line: node.location.begin.line,
            }),
        }
    }
}

/// A member declaration. `signature` is what collides during partial-type merge; `body` lines
/// are emitted between braces unless the member is a field or raw declaration block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub signature: String,
    pub body: Option<Vec<SourceLine>>,
    /// Raw declarations emitted as-is (script blocks).
    pub declarations: Vec<SourceLine>,
    pub unit: LogicalPath,
}

impl Member {
    fn field(name: &str, signature: String, unit: &LogicalPath, origin: &Node) -> Self {
        Member {
            name: name.to_string(),
            signature: signature.clone(),
            body: None,
            declarations: vec![SourceLine::at(format!("{signature};"), origin)],
            unit: unit.clone(),
        }
    }

    fn method(name: String, signature: String, body: Vec<SourceLine>, unit: &LogicalPath) -> Self {
        Member {
            name,
            signature,
            body: Some(body),
            declarations: Vec::new(),
            unit: unit.clone(),
        }
    }
}

/// A unit's contribution to a (possibly shared) generated type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialTypeFragment {
    pub unit: LogicalPath,
    pub language: String,
    pub namespace: String,
    pub type_name: String,
    pub base_type: String,
    pub imports: Vec<String>,
    pub members: Vec<Member>,
    pub custom_string: Option<String>,
}

impl PartialTypeFragment {
    pub fn qualified_type(&self) -> String {
        format!("{}.{}", self.namespace, self.type_name)
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}

pub trait CodeGenerator: Send + Sync {
    fn generate(
        &self,
        unit: &ParsedUnit,
        config: &BuildConfig,
    ) -> Result<PartialTypeFragment, QuireError>;
}

/// Escape `text` as a double-quoted string literal body.
pub fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

fn property_literal(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => format!("\"{}\"", escape_literal(s)),
        PropertyValue::Integer(i) => i.to_string(),
        PropertyValue::Boolean(b) => b.to_string(),
        PropertyValue::Float(f) => format!("{f:?}"),
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct TemplateGenerator;

struct GenState<'u> {
    unit: &'u ParsedUnit,
    members: Vec<Member>,
    next_control: usize,
    next_body: usize,
    next_script: usize,
}

impl GenState<'_> {
    fn render_lines(&mut self, nodes: &[Node], out: &mut Vec<SourceLine>) -> Result<(), QuireError> {
        for node in nodes.iter() {
            match &node.kind {
                BuilderNode::Root | BuilderNode::Directive { .. } => {}
                BuilderNode::Literal(text) => out.push(SourceLine::at(
                    format!("writer.Write(\"{}\");", escape_literal(text)),
                    node,
                )),
                BuilderNode::CodeFragment { code, kind } => {
                    let line = match kind {
                        CodeKind::Render => code.trim().to_string(),
                        CodeKind::Assign => format!("writer.Write({});", code.trim()),
                        CodeKind::AssignEncoded => {
                            format!("writer.Write(HtmlEncode({}));", code.trim())
                        }
                    };
                    out.push(SourceLine::at(line, node));
                }
                BuilderNode::DataBinding(expr) => out.push(SourceLine::at(
                    format!("writer.Write(this.DataBind(() => ({})));", expr.trim()),
                    node,
                )),
                BuilderNode::Include { .. } => self.render_lines(&node.children, out)?,
                BuilderNode::ScriptBlock(code) => self.script(node, code),
                BuilderNode::ComponentPlaceholder { .. } => {
                    let build = self.component(node)?;
                    out.push(SourceLine::at(
                        format!("this.{build}().RenderControl(writer);"),
                        node,
                    ));
                }
            }
        }
        Ok(())
    }

    fn script(&mut self, node: &Node, code: &str) {
        let name = format!(
            "__Script_{}_{}",
            generated_type_name(&self.unit.path),
            self.next_script
        );
        self.next_script += 1;
        let first_line = node.location.begin.line;
        let declarations = code
            .lines()
            .enumerate()
            .map(|(idx, text)| SourceLine {
                text: text.to_string(),
                origin: Some(SourceOrigin {
                    path: node.location.path.clone(),
                    line: first_line + idx,
                }),
            })
            .collect();
        self.members.push(Member {
            name: name.clone(),
            signature: name,
            body: None,
            declarations,
            unit: self.unit.path.clone(),
        });
    }

    /// Emit the build member for a component and return its name.
    fn component(&mut self, node: &Node) -> Result<String, QuireError> {
        let BuilderNode::ComponentPlaceholder {
            id,
            attributes,
            resolved,
            ..
        } = &node.kind
        else {
            return Err(QuireError::Internal(format!(
                "{}: expected a component node",
                node.location
            )));
        };
        let type_name = resolved.qualified_type();
        let build = format!("__BuildControl{}", self.next_control);
        self.next_control += 1;

        let mut body = vec![SourceLine::at(format!("var __ctrl = new {type_name}();"), node)];
        if let Some(id) = id {
            self.members.push(Member::field(
                id,
                format!("protected {type_name} {id}"),
                &self.unit.path,
                node,
            ));
            body.push(SourceLine::at(format!("this.{id} = __ctrl;"), node));
            body.push(SourceLine::at(format!("__ctrl.ID = \"{id}\";"), node));
        }
        for attr in attributes.iter() {
            let line = match &attr.value {
                BoundValue::Value(value) => {
                    let name = resolved
                        .property(&attr.name)
                        .map(|p| p.name.as_str())
                        .unwrap_or(attr.name.as_str());
                    format!("__ctrl.{} = {};", name, property_literal(value))
                }
                BoundValue::Binding(expr) => format!(
                    "this.AddBinding(__ctrl, \"{}\", () => ({}));",
                    attr.name,
                    expr.trim()
                ),
                BoundValue::Expando(raw) => format!(
                    "__ctrl.Attributes[\"{}\"] = \"{}\";",
                    attr.name,
                    escape_literal(raw)
                ),
            };
            body.push(SourceLine::at(line, node));
        }
        if resolved.has(Capability::HasBody) && !node.children.is_empty() {
            let render = format!("__RenderBody{}", self.next_body);
            self.next_body += 1;
            let mut render_body = Vec::new();
            self.render_lines(&node.children, &mut render_body)?;
            self.members.push(Member::method(
                render.clone(),
                format!("private void {render}(HtmlWriter writer)"),
                render_body,
                &self.unit.path,
            ));
            body.push(SourceLine::at(format!("__ctrl.SetRenderMethod({render});"), node));
        }
        body.push(SourceLine::plain("return __ctrl;"));
        self.members.push(Member::method(
            build.clone(),
            format!("private {type_name} {build}()"),
            body,
            &self.unit.path,
        ));
        Ok(build)
    }
}

impl TemplateGenerator {
    fn type_identity(unit: &ParsedUnit) -> (String, String) {
        match unit.main_attribute("ClassName") {
            Some(class) => match class.rsplit_once('.') {
                Some((ns, name)) => (ns.to_string(), name.to_string()),
                None => (GENERATED_NAMESPACE.to_string(), class.to_string()),
            },
            None => (
                GENERATED_NAMESPACE.to_string(),
                generated_type_name(&unit.path),
            ),
        }
    }

    fn base_type(unit: &ParsedUnit, config: &BuildConfig) -> String {
        match unit.main_attribute("Inherits") {
            Some(inherits) if inherits.contains('/') => unit
                .path
                .resolve(inherits, &config.app_root)
                .map(|p| format!("{}.{}", GENERATED_NAMESPACE, generated_type_name(&p)))
                .unwrap_or_else(|| inherits.to_string()),
            Some(inherits) => inherits.to_string(),
            None => unit.kind.default_base_type().to_string(),
        }
    }
}

impl CodeGenerator for TemplateGenerator {
    fn generate(
        &self,
        unit: &ParsedUnit,
        config: &BuildConfig,
    ) -> Result<PartialTypeFragment, QuireError> {
        if !unit.kind.is_markup() {
            return Err(QuireError::Internal(format!(
                "{}: {} units are compiled from raw source",
                unit.path, unit.kind
            )));
        }
        let (namespace, type_name) = TemplateGenerator::type_identity(unit);
        let mut state = GenState {
            unit,
            members: Vec::new(),
            next_control: 0,
            next_body: 0,
            next_script: 0,
        };
        let mut render = Vec::new();
        state.render_lines(&unit.tree.root.children, &mut render)?;
        if unit.kind != UnitKind::Application {
            state.members.push(Member::method(
                "__Render".to_string(),
                "protected override void __Render(HtmlWriter writer)".to_string(),
                render,
                &unit.path,
            ));
        }
        let custom_string = match unit.kind {
            UnitKind::Handler => Some(format!("{namespace}.{type_name}")),
            _ => None,
        };
        tracing::trace!(
            "[Codegen] {} -> {}.{} ({} members)",
            unit.path,
            namespace,
            type_name,
            state.members.len()
        );
        Ok(PartialTypeFragment {
            unit: unit.path.clone(),
            language: unit
                .language
                .clone()
                .unwrap_or_else(|| config.default_language.clone()),
            namespace,
            type_name,
            base_type: TemplateGenerator::base_type(unit, config),
            imports: unit.imports.clone(),
            members: state.members,
            custom_string,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enumset::EnumSet;
    use crate::{
        markup::builder::TreeBuilder,
        registry::{ComponentDescriptor, ComponentRegistry, PropertyKind, PropertySchema},
        vfs::MemoryFileSystem,
    };

    fn generate(text: &str) -> PartialTypeFragment {
        let vfs = MemoryFileSystem::with_files([("/shop/cart.page", text)]);
        let registry = ComponentRegistry::create();
        registry.register(
            "x",
            "Widget",
            ComponentDescriptor::new("Acme", "Widget")
                .with_capabilities(EnumSet::only(Capability::Expando))
                .with_property(PropertySchema::new("Count", PropertyKind::Integer)),
        );
        let config = BuildConfig::default();
        let unit = TreeBuilder::new(&vfs, &registry, &config)
            .build(&LogicalPath::new("/shop/cart.page"), UnitKind::Page)
            .unwrap();
        TemplateGenerator.generate(&unit, &config).unwrap()
    }

    fn render_text(fragment: &PartialTypeFragment) -> Vec<String> {
        fragment
            .member("__Render")
            .and_then(|m| m.body.as_ref())
            .map(|body| body.iter().map(|l| l.text.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_literal_render() {
        let fragment = generate("Hello");
        assert_eq!(fragment.qualified_type(), "Quire.Generated.shop_cart_page");
        assert_eq!(fragment.base_type, "Quire.Runtime.Page");
        assert_eq!(render_text(&fragment), vec!["writer.Write(\"Hello\");"]);
    }

    #[test]
    fn test_code_and_components() {
        let fragment = generate(
            "<%@ Page ClassName=\"Shop.Cart\" Inherits=\"Shop.BasePage\" %>\n<%= total %><%: name %>\n<x:Widget runat=\"server\" id=\"w1\" Count=\"2\" data-x=\"y\"/>",
        );
        assert_eq!(fragment.namespace, "Shop");
        assert_eq!(fragment.type_name, "Cart");
        assert_eq!(fragment.base_type, "Shop.BasePage");
        assert_eq!(
            render_text(&fragment),
            vec![
                "writer.Write(\"\\n\");",
                "writer.Write(total);",
                "writer.Write(HtmlEncode(name));",
                "writer.Write(\"\\n\");",
                "this.__BuildControl0().RenderControl(writer);"
            ]
        );
        let field = fragment.member("w1").unwrap();
        assert_eq!(field.signature, "protected Acme.Widget w1");
        let build: Vec<String> = fragment
            .member("__BuildControl0")
            .and_then(|m| m.body.clone())
            .unwrap()
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert!(build.contains(&"__ctrl.Count = 2;".to_string()));
        assert!(build.contains(&"__ctrl.Attributes[\"data-x\"] = \"y\";".to_string()));
        let origin = fragment.member("__Render").unwrap().body.as_ref().unwrap()[1]
            .origin
            .clone()
            .unwrap();
        assert_eq!(origin.line, 2);
    }
}
