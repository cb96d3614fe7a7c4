use enumset::EnumSet;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::HashSet, sync::Arc};

use crate::{
    build::unit::UnitKind,
    config::BuildConfig,
    error::QuireError,
    markup::{
        diagnostic::{ParseDiagnostic, UnresolvedTag},
        parser::{Attribute, ParseEvent, Parser, TagData},
        tree::{BoundAttribute, BoundValue, BuilderNode, DocumentTree, IncludeKind, Node, ParseLocation},
    },
    paths::LogicalPath,
    registry::{
        generated_type_name, Capability, ComponentDescriptor, ComponentResolver, LocalRegistry,
        GENERATED_NAMESPACE,
    },
    vfs::VirtualFileSystem,
};

static IDENTIFIER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

const INVALID_APPLICATION_CONTENT: &str = "Invalid content for application file.";
const INCLUDE_OUTSIDE_ROOT: &str = "Files above the application's root directory cannot be included.";

/// A directive as it appeared in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveData {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub location: ParseLocation,
}

impl DirectiveData {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Everything the tree builder learned about one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUnit {
    pub path: LogicalPath,
    pub kind: UnitKind,
    pub tree: DocumentTree,
    pub main_directive: Option<DirectiveData>,
    pub directives: Vec<DirectiveData>,
    /// Canonical language name, when the unit declares one.
    pub language: Option<String>,
    pub imports: Vec<String>,
    /// Hex SHA-256 of the unit's own text.
    pub checksum: String,
    pub included_files: Vec<LogicalPath>,
    /// Sources of components registered with `Register Src=`.
    pub user_components: Vec<LogicalPath>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl ParsedUnit {
    /// Attribute of the main directive.
    pub fn main_attribute(&self, name: &str) -> Option<&str> {
        self.main_directive.as_ref().and_then(|d| d.get(name))
    }
}

struct OpenNode {
    node: Node,
    /// Tag that closes this node. `None` for the root and include frames.
    tag: Option<String>,
}

struct PendingScript {
    location: ParseLocation,
    body: String,
}

struct BuildState<'r> {
    path: LogicalPath,
    kind: UnitKind,
    stack: Vec<OpenNode>,
    open_files: Vec<LogicalPath>,
    local: LocalRegistry<'r>,
    main_directive: Option<DirectiveData>,
    directives: Vec<DirectiveData>,
    language: Option<String>,
    imports: Vec<String>,
    included_files: Vec<LogicalPath>,
    user_components: Vec<LogicalPath>,
    diagnostics: Vec<ParseDiagnostic>,
    form_seen: bool,
    pending_script: Option<PendingScript>,
    /// Lowercased tags of body-less components whose explicit close tag is still expected.
    closed_early: Vec<String>,
}

impl BuildState<'_> {
    fn is_application(&self) -> bool {
        self.kind == UnitKind::Application
    }

    fn current_file(&self) -> &LogicalPath {
        self.open_files.last().unwrap_or(&self.path)
    }

    fn top(&mut self) -> &mut Node {
        // The root frame is pushed before any event is handled and popped only at the end.
        let last = self.stack.len() - 1;
        &mut self.stack[last].node
    }

    fn append(&mut self, node: Node) {
        self.top().push_child(node);
    }

    fn append_literal(&mut self, text: impl Into<String>, location: ParseLocation) {
        self.append(Node::new(BuilderNode::Literal(text.into()), location));
    }
}

/// Builds a [`DocumentTree`] for one unit from parser events.
pub struct TreeBuilder<'a> {
    vfs: &'a dyn VirtualFileSystem,
    registry: &'a dyn ComponentResolver,
    config: &'a BuildConfig,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        vfs: &'a dyn VirtualFileSystem,
        registry: &'a dyn ComponentResolver,
        config: &'a BuildConfig,
    ) -> Self {
        TreeBuilder {
            vfs,
            registry,
            config,
        }
    }

    pub fn build(&self, path: &LogicalPath, kind: UnitKind) -> Result<ParsedUnit, QuireError> {
        let text = self.vfs.read_to_string(path)?;
        self.build_from_text(path, kind, &text)
    }

    pub fn build_from_text(
        &self,
        path: &LogicalPath,
        kind: UnitKind,
        text: &str,
    ) -> Result<ParsedUnit, QuireError> {
        tracing::debug!("[TreeBuilder] building {} ({})", path, kind);
        let mut state = BuildState {
            path: path.clone(),
            kind,
            stack: vec![OpenNode {
                node: Node::new(BuilderNode::Root, ParseLocation::start_of(path)),
                tag: None,
            }],
            open_files: vec![path.clone()],
            local: LocalRegistry::new(self.registry),
            main_directive: None,
            directives: Vec::new(),
            language: None,
            imports: Vec::new(),
            included_files: Vec::new(),
            user_components: Vec::new(),
            diagnostics: Vec::new(),
            form_seen: false,
            pending_script: None,
            closed_early: Vec::new(),
        };

        let mut parser = Parser::new(path.clone(), text);
        for event in parser.by_ref() {
            self.handle(&mut state, event?)?;
        }
        let checksum = parser
            .checksum()
            .map(str::to_string)
            .ok_or_else(|| QuireError::Internal(format!("{path}: parser ended early")))?;
        self.expect_frame_closed(&state, 1)?;

        let root = match state.stack.pop() {
            Some(frame) => frame.node,
            None => return Err(QuireError::Internal(format!("{path}: lost root node"))),
        };
        let tree = DocumentTree { root };
        check_duplicate_ids(&tree)?;
        tracing::debug!(
            "[TreeBuilder] {} built: {} components, {} includes",
            path,
            tree.components().len(),
            state.included_files.len()
        );

        Ok(ParsedUnit {
            path: path.clone(),
            kind,
            tree,
            main_directive: state.main_directive,
            directives: state.directives,
            language: state.language,
            imports: state.imports,
            checksum,
            included_files: state.included_files,
            user_components: state.user_components,
            diagnostics: state.diagnostics,
        })
    }

    /// Fail if a component opened above stack depth `depth` is still open.
    fn expect_frame_closed(&self, state: &BuildState, depth: usize) -> Result<(), QuireError> {
        if state.stack.len() > depth {
            if let Some(open) = state.stack.last() {
                let tag = open.tag.clone().unwrap_or_default();
                return Err(QuireError::parse(
                    open.node.location.clone(),
                    format!("Expecting </{tag}>"),
                ));
            }
        }
        Ok(())
    }

    fn handle(&self, state: &mut BuildState, event: ParseEvent) -> Result<(), QuireError> {
        match event {
            ParseEvent::Text { text, location } => {
                if let Some(script) = state.pending_script.as_mut() {
                    script.body.push_str(&text);
                    return Ok(());
                }
                if state.is_application() && !text.trim().is_empty() {
                    return Err(QuireError::parse(location, INVALID_APPLICATION_CONTENT));
                }
                state.append_literal(text, location);
            }
            ParseEvent::Comment { text, location } => {
                if !state.is_application() {
                    state.append_literal(format!("<!--{text}-->"), location);
                }
            }
            ParseEvent::CodeRender {
                code,
                kind,
                location,
            } => {
                if state.is_application() {
                    return Err(QuireError::parse(location, INVALID_APPLICATION_CONTENT));
                }
                state.append(Node::new(BuilderNode::CodeFragment { code, kind }, location));
            }
            ParseEvent::DataBinding {
                expression,
                location,
            } => {
                if state.is_application() {
                    return Err(QuireError::parse(location, INVALID_APPLICATION_CONTENT));
                }
                state.append(Node::new(BuilderNode::DataBinding(expression), location));
            }
            ParseEvent::Directive {
                name,
                attributes,
                location,
            } => self.directive(state, name, attributes, location)?,
            ParseEvent::Include {
                path,
                kind,
                location,
            } => {
                if state.is_application() {
                    return Err(QuireError::parse(location, INVALID_APPLICATION_CONTENT));
                }
                self.include(state, &path, kind, location)?;
            }
            ParseEvent::TagOpen(tag) => self.open_tag(state, tag, false)?,
            ParseEvent::SelfClosingTag(tag) => self.open_tag(state, tag, true)?,
            ParseEvent::TagClose { name, location } => self.close_tag(state, name, location)?,
        }
        Ok(())
    }

    fn include(
        &self,
        state: &mut BuildState,
        raw: &str,
        kind: IncludeKind,
        location: ParseLocation,
    ) -> Result<(), QuireError> {
        let app_root = &self.config.app_root;
        let resolved = match kind {
            IncludeKind::File => state.current_file().resolve(raw, app_root),
            IncludeKind::Virtual if raw.starts_with('/') || raw.starts_with('~') => {
                state.current_file().resolve(raw, app_root)
            }
            IncludeKind::Virtual => app_root.join("_").resolve(raw, app_root),
        };
        let resolved = resolved
            .filter(|p| p.is_within(app_root))
            .ok_or_else(|| QuireError::parse(location.clone(), INCLUDE_OUTSIDE_ROOT))?;
        if state.open_files.contains(&resolved) {
            return Err(QuireError::parse(
                location,
                format!("Infinite recursion detected including file: {resolved}"),
            ));
        }
        let text = self.vfs.read_to_string(&resolved).map_err(|err| match err {
            QuireError::NotFound(_) => QuireError::parse(
                location.clone(),
                format!("The file '{resolved}' does not exist."),
            ),
            other => other,
        })?;
        tracing::trace!("[TreeBuilder] including {} into {}", resolved, state.path);
        if !state.included_files.contains(&resolved) {
            state.included_files.push(resolved.clone());
        }

        state.open_files.push(resolved.clone());
        state.stack.push(OpenNode {
            node: Node::new(
                BuilderNode::Include {
                    path: resolved.clone(),
                    kind,
                },
                location,
            ),
            tag: None,
        });
        let depth = state.stack.len();
        let mut parser = Parser::new(resolved, &text);
        for event in parser.by_ref() {
            self.handle(state, event?)?;
        }
        self.expect_frame_closed(state, depth)?;
        if let Some(frame) = state.stack.pop() {
            state.append(frame.node);
        }
        state.open_files.pop();
        Ok(())
    }

    fn directive(
        &self,
        state: &mut BuildState,
        name: Option<String>,
        attributes: Vec<Attribute>,
        location: ParseLocation,
    ) -> Result<(), QuireError> {
        let main = state.kind.main_directive().unwrap_or("Page");
        let name = name.unwrap_or_else(|| main.to_string());
        let data = DirectiveData {
            name: name.clone(),
            attributes: attributes
                .into_iter()
                .map(|a| (a.name, a.value.unwrap_or_default()))
                .collect(),
            location: location.clone(),
        };

        if name.eq_ignore_ascii_case(main) {
            if state.main_directive.is_some() {
                return Err(QuireError::parse(
                    location,
                    format!("The directive '{main}' can only appear once."),
                ));
            }
            if let Some(language) = data.get("Language") {
                let canonical = self.config.canonical_language(language).ok_or_else(|| {
                    QuireError::parse(
                        location.clone(),
                        format!("The language '{language}' is not supported."),
                    )
                })?;
                set_language(state, canonical, &location)?;
            }
            state.main_directive = Some(data.clone());
        } else {
            match name.to_ascii_lowercase().as_str() {
                "register" => self.register(state, &data)?,
                "import" => match data.get("Namespace") {
                    Some(namespace) => state.imports.push(namespace.to_string()),
                    None => {
                        return Err(QuireError::parse(
                            location,
                            "The 'Namespace' attribute is required by the Import directive.",
                        ))
                    }
                },
                "reference" | "mastertype" | "previouspagetype" | "assembly" | "implements"
                | "outputcache" => {}
                _ => {
                    return Err(QuireError::parse(
                        location,
                        format!("Unknown directive '{name}'."),
                    ))
                }
            }
        }
        state.directives.push(data.clone());
        state.append(Node::new(
            BuilderNode::Directive {
                name: data.name,
                attributes: data.attributes,
            },
            location,
        ));
        Ok(())
    }

    fn register(&self, state: &mut BuildState, data: &DirectiveData) -> Result<(), QuireError> {
        let location = data.location.clone();
        let prefix = data.get("TagPrefix").ok_or_else(|| {
            QuireError::parse(
                location.clone(),
                "The 'TagPrefix' attribute is required by the Register directive.",
            )
        })?;
        if let Some(namespace) = data.get("Namespace") {
            state.local.map_prefix(prefix, namespace);
            return Ok(());
        }
        match (data.get("TagName"), data.get("Src")) {
            (Some(tag_name), Some(src)) => {
                let source = state
                    .current_file()
                    .resolve(src, &self.config.app_root)
                    .filter(|p| p.is_within(&self.config.app_root))
                    .ok_or_else(|| {
                        QuireError::parse(
                            location.clone(),
                            format!("The source '{src}' of tag '{prefix}:{tag_name}' cannot be resolved."),
                        )
                    })?;
                let descriptor =
                    ComponentDescriptor::new(GENERATED_NAMESPACE, &generated_type_name(&source))
                        .with_source(source.clone())
                        .with_capabilities(EnumSet::only(Capability::Expando));
                state
                    .local
                    .register_user_component(prefix, tag_name, descriptor);
                if !state.user_components.contains(&source) {
                    state.user_components.push(source);
                }
                Ok(())
            }
            _ => Err(QuireError::parse(
                location,
                "The Register directive requires either 'TagName' and 'Src' or 'Namespace'.",
            )),
        }
    }

    fn open_tag(
        &self,
        state: &mut BuildState,
        tag: TagData,
        self_closing: bool,
    ) -> Result<(), QuireError> {
        if !tag.runat_server {
            if state.is_application() {
                return Err(QuireError::parse(tag.location, INVALID_APPLICATION_CONTENT));
            }
            return self.literal_tag(state, &tag);
        }

        if tag.name.eq_ignore_ascii_case("script") {
            if let Some(language) = tag.attribute_value("language") {
                let canonical = self.config.canonical_language(language).ok_or_else(|| {
                    QuireError::parse(
                        tag.location.clone(),
                        format!("The language '{language}' is not supported."),
                    )
                })?;
                set_language(state, canonical, &tag.location)?;
            }
            if self_closing {
                state.append(Node::new(BuilderNode::ScriptBlock(String::new()), tag.location));
            } else {
                state.pending_script = Some(PendingScript {
                    location: tag.location,
                    body: String::new(),
                });
            }
            return Ok(());
        }

        let (prefix, name) = tag.name.split_once(':').unwrap_or(("", tag.name.as_str()));
        if state.is_application() && !name.eq_ignore_ascii_case("object") {
            return Err(QuireError::parse(tag.location, INVALID_APPLICATION_CONTENT));
        }
        let resolved = match state.local.resolve(prefix, name) {
            Some(resolved) => resolved,
            None => {
                tracing::debug!("[TreeBuilder] unresolved server tag {}", tag.name);
                state
                    .diagnostics
                    .push(ParseDiagnostic::UnresolvedTag(UnresolvedTag {
                        prefix: prefix.to_string(),
                        name: name.to_string(),
                        location: tag.location.clone(),
                    }));
                return self.literal_tag(state, &tag);
            }
        };

        let id = match tag.attribute("id") {
            Some(attr) => {
                let id = attr.value.clone().unwrap_or_default();
                if !IDENTIFIER_REGEX.is_match(&id) {
                    return Err(QuireError::parse(
                        attr.location.clone(),
                        format!("'{id}' is not a valid identifier."),
                    ));
                }
                Some(id)
            }
            None => None,
        };
        if prefix.is_empty() && name.eq_ignore_ascii_case("form") {
            if state.form_seen {
                return Err(QuireError::parse(
                    tag.location,
                    "Only one <form runat=\"server\"> allowed.",
                ));
            }
            state.form_seen = true;
        }
        let attributes = bind_attributes(&resolved, &tag)?;
        let has_body = resolved.has(Capability::HasBody);
        let node = Node::new(
            BuilderNode::ComponentPlaceholder {
                tag: tag.name.clone(),
                id,
                attributes,
                resolved,
            },
            tag.location.clone(),
        );
        if self_closing || !has_body {
            if !self_closing {
                state.closed_early.push(tag.name.to_ascii_lowercase());
            }
            state.append(node);
        } else {
            state.stack.push(OpenNode {
                node,
                tag: Some(tag.name),
            });
        }
        Ok(())
    }

    fn close_tag(
        &self,
        state: &mut BuildState,
        name: String,
        location: ParseLocation,
    ) -> Result<(), QuireError> {
        if let Some(script) = state.pending_script.take() {
            state.append(Node::new(BuilderNode::ScriptBlock(script.body), script.location));
            return Ok(());
        }

        // Only components opened in the current file frame can be closed here.
        let mut matched = None;
        for (idx, frame) in state.stack.iter().enumerate().rev() {
            match &frame.tag {
                Some(tag) if tag.eq_ignore_ascii_case(&name) => {
                    matched = Some(idx);
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        match matched {
            Some(idx) if idx == state.stack.len() - 1 => {
                if let Some(frame) = state.stack.pop() {
                    state.append(frame.node);
                }
                Ok(())
            }
            Some(_) => {
                let expected = state
                    .stack
                    .last()
                    .and_then(|frame| frame.tag.clone())
                    .unwrap_or_default();
                Err(QuireError::parse(location, format!("Expecting </{expected}>")))
            }
            None => {
                let lowered = name.to_ascii_lowercase();
                if let Some(pos) = state.closed_early.iter().rposition(|t| t == &lowered) {
                    state.closed_early.remove(pos);
                    return Ok(());
                }
                if state.is_application() {
                    return Err(QuireError::parse(location, INVALID_APPLICATION_CONTENT));
                }
                state.append_literal(format!("</{name}>"), location);
                Ok(())
            }
        }
    }

    /// Emit an unresolved tag as literal markup, splitting out code embedded in attribute values.
    fn literal_tag(&self, state: &mut BuildState, tag: &TagData) -> Result<(), QuireError> {
        let has_code = tag
            .attributes
            .iter()
            .any(|a| a.value.as_deref().map(|v| v.contains("<%")).unwrap_or(false));
        if !has_code {
            state.append_literal(tag.to_markup(), tag.location.clone());
            return Ok(());
        }

        state.append_literal(format!("<{}", tag.name), tag.location.clone());
        for attr in tag.attributes.iter() {
            let quote = attr.quote.map(String::from).unwrap_or_default();
            match &attr.value {
                None => state.append_literal(format!(" {}", attr.name), attr.location.clone()),
                Some(value) if value.contains("<%") => {
                    state.append_literal(
                        format!(" {}={quote}", attr.name),
                        attr.location.clone(),
                    );
                    for event in Parser::nested(value, &attr.value_location) {
                        match event? {
                            ParseEvent::Text { text, location } => {
                                state.append_literal(text, location)
                            }
                            ParseEvent::CodeRender {
                                code,
                                kind,
                                location,
                            } => state.append(Node::new(
                                BuilderNode::CodeFragment { code, kind },
                                location,
                            )),
                            ParseEvent::DataBinding {
                                expression,
                                location,
                            } => state.append(Node::new(
                                BuilderNode::DataBinding(expression),
                                location,
                            )),
                            other => {
                                return Err(QuireError::parse(
                                    other.location().clone(),
                                    "Only code blocks are allowed inside attribute values.",
                                ))
                            }
                        }
                    }
                    state.append_literal(quote, attr.location.clone());
                }
                Some(value) => state.append_literal(
                    format!(" {}={quote}{value}{quote}", attr.name),
                    attr.location.clone(),
                ),
            }
        }
        let close = if tag.self_closing { " />" } else { ">" };
        state.append_literal(close, tag.location.clone());
        Ok(())
    }
}

fn set_language(
    state: &mut BuildState,
    language: String,
    location: &ParseLocation,
) -> Result<(), QuireError> {
    match &state.language {
        Some(existing) if existing != &language => Err(QuireError::parse(
            location.clone(),
            format!("Trying to mix language '{existing}' and '{language}'."),
        )),
        _ => {
            state.language = Some(language);
            Ok(())
        }
    }
}

/// Bind a server tag's attributes against the component's property schema.
fn bind_attributes(
    descriptor: &Arc<ComponentDescriptor>,
    tag: &TagData,
) -> Result<Vec<BoundAttribute>, QuireError> {
    let mut bound = Vec::new();
    for attr in tag.attributes.iter() {
        if attr.name.eq_ignore_ascii_case("runat") || attr.name.eq_ignore_ascii_case("id") {
            continue;
        }
        let raw = attr.value.as_deref().unwrap_or("true");
        let trimmed = raw.trim();
        let binding = trimmed
            .strip_prefix("<%#")
            .and_then(|rest| rest.strip_suffix("%>"))
            .map(|expr| expr.to_string());

        let value = match (descriptor.property(&attr.name), binding) {
            (Some(schema), _) if !schema.settable => {
                return Err(QuireError::parse(
                    attr.location.clone(),
                    format!(
                        "The '{}' property of '{}' is read-only.",
                        attr.name, descriptor.runtime_type
                    ),
                ))
            }
            (Some(_), Some(expr)) => BoundValue::Binding(expr),
            (Some(schema), None) => BoundValue::Value(schema.convert(raw).map_err(|_| {
                QuireError::parse(
                    attr.location.clone(),
                    format!(
                        "Cannot create an object of type '{:?}' from its string representation '{}' for the '{}' property.",
                        schema.kind, raw, attr.name
                    ),
                )
            })?),
            (None, _) if !descriptor.has(Capability::Expando) => {
                return Err(QuireError::parse(
                    attr.location.clone(),
                    format!(
                        "Type '{}' does not have a public property named '{}'.",
                        descriptor.qualified_type(),
                        attr.name
                    ),
                ))
            }
            (None, Some(expr)) => BoundValue::Binding(expr),
            (None, None) => BoundValue::Expando(raw.to_string()),
        };
        bound.push(BoundAttribute {
            name: attr.name.clone(),
            value,
        });
    }
    Ok(bound)
}

/// Ensure declared IDs are unique within each naming scope. Naming containers and templates
/// start a fresh scope for their descendants.
pub fn check_duplicate_ids(tree: &DocumentTree) -> Result<(), QuireError> {
    fn visit(node: &Node, scope: &mut HashSet<String>) -> Result<(), QuireError> {
        for child in node.children.iter() {
            if let BuilderNode::ComponentPlaceholder { id: Some(id), .. } = &child.kind {
                if !scope.insert(id.clone()) {
                    return Err(QuireError::parse(
                        child.location.clone(),
                        format!("Id '{id}' is already used by another control."),
                    ));
                }
            }
            if child.kind.starts_id_scope() {
                visit(child, &mut HashSet::new())?;
            } else {
                visit(child, scope)?;
            }
        }
        Ok(())
    }
    visit(&tree.root, &mut HashSet::new())
}
