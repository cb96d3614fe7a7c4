use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use crate::{
    markup::token::{CodeKind, Position},
    paths::LogicalPath,
    registry::{Capability, ComponentDescriptor, PropertyValue},
};

/// Immutable source span attached to every builder node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParseLocation {
    pub path: LogicalPath,
    pub begin: Position,
    pub end: Position,
}

impl ParseLocation {
    pub fn new(path: LogicalPath, begin: Position, end: Position) -> Self {
        ParseLocation { path, begin, end }
    }

    /// A zero-width location at the start of `path`.
    pub fn start_of(path: &LogicalPath) -> Self {
        ParseLocation::new(path.clone(), Position::start(), Position::start())
    }
}

impl Display for ParseLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.path, self.begin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncludeKind {
    /// Path relative to the including file.
    File,
    /// Path relative to the application root.
    Virtual,
}

/// Attribute value bound to a component property.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    /// Converted through the property's schema.
    Value(PropertyValue),
    /// `<%# %>` binding, evaluated at data-bind time.
    Binding(String),
    /// Attribute accepted without a schema entry (expando components).
    Expando(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundAttribute {
    pub name: String,
    pub value: BoundValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuilderNode {
    Root,
    Literal(String),
    CodeFragment {
        code: String,
        kind: CodeKind,
    },
    DataBinding(String),
    Directive {
        name: String,
        attributes: Vec<(String, String)>,
    },
    ComponentPlaceholder {
        tag: String,
        id: Option<String>,
        attributes: Vec<BoundAttribute>,
        resolved: Arc<ComponentDescriptor>,
    },
    Include {
        path: LogicalPath,
        kind: IncludeKind,
    },
    /// Body of a `<script runat="server">` block: class-level declarations.
    ScriptBlock(String),
}

impl BuilderNode {
    /// True when children of this node start a fresh ID scope.
    pub fn starts_id_scope(&self) -> bool {
        match self {
            BuilderNode::ComponentPlaceholder { resolved, .. } => {
                resolved.capabilities.contains(Capability::NamingContainer)
                    || resolved.capabilities.contains(Capability::Template)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: BuilderNode,
    pub location: ParseLocation,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: BuilderNode, location: ParseLocation) -> Self {
        Node {
            kind,
            location,
            children: Vec::new(),
        }
    }

    /// Append a child, merging adjacent literal runs.
    pub fn push_child(&mut self, child: Node) {
        if let BuilderNode::Literal(text) = &child.kind {
            if let Some(Node {
                kind: BuilderNode::Literal(prev),
                location,
                ..
            }) = self.children.last_mut()
            {
                prev.push_str(text);
                if location.path == child.location.path {
                    location.end = child.location.end;
                }
                return;
            }
        }
        self.children.push(child);
    }

    /// Depth-first, document-order walk.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Node)) {
        visit(self);
        for child in self.children.iter() {
            child.walk(visit);
        }
    }
}

/// Result of tree building: a single root with ordered children.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentTree {
    pub root: Node,
}

impl DocumentTree {
    pub fn new(path: &LogicalPath) -> Self {
        DocumentTree {
            root: Node::new(BuilderNode::Root, ParseLocation::start_of(path)),
        }
    }

    pub fn components(&self) -> Vec<&Node> {
        let mut found = Vec::new();
        self.root.walk(&mut |node| {
            if matches!(node.kind, BuilderNode::ComponentPlaceholder { .. }) {
                found.push(node);
            }
        });
        found
    }

    /// Compact structural rendering, e.g. `Root[Literal("Hello")]`.
    pub fn outline(&self) -> String {
        fn render(node: &Node, out: &mut String) {
            match &node.kind {
                BuilderNode::Root => out.push_str("Root"),
                BuilderNode::Literal(text) => out.push_str(&format!("Literal({text:?})")),
                BuilderNode::CodeFragment { code, kind } => {
                    out.push_str(&format!("Code({kind:?},{:?})", code.trim()))
                }
                BuilderNode::DataBinding(expr) => {
                    out.push_str(&format!("DataBinding({:?})", expr.trim()))
                }
                BuilderNode::Directive { name, .. } => out.push_str(&format!("Directive({name})")),
                BuilderNode::ComponentPlaceholder { resolved, id, .. } => {
                    out.push_str(&format!("ComponentPlaceholder({}", resolved.runtime_type));
                    if let Some(id) = id {
                        out.push_str(&format!(",id={id}"));
                    }
                    out.push(')');
                }
                BuilderNode::Include { path, .. } => out.push_str(&format!("Include({path})")),
                BuilderNode::ScriptBlock(_) => out.push_str("ScriptBlock"),
            }
            if !node.children.is_empty() {
                out.push('[');
                for (idx, child) in node.children.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    render(child, out);
                }
                out.push(']');
            }
        }
        let mut out = String::new();
        render(&self.root, &mut out);
        out
    }
}
