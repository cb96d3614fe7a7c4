// Component registry
//
// Tags marked runat="server" are resolved here to a component descriptor: the runtime type the
// generated code instantiates, the capability table that drives tree building, and the schema
// the builder binds attributes against. Registries are explicitly constructed and owned by a
// build context; nothing in this module is process-global.

use enumset::{EnumSet, EnumSetType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::paths::LogicalPath;

/// Namespace generated unit types live in.
pub const GENERATED_NAMESPACE: &str = "Quire.Generated";

/// Class name generated for the unit at `path`: `/shop/cart.page` becomes `shop_cart_page`.
pub fn generated_type_name(path: &LogicalPath) -> String {
    let mut name: String = path
        .as_str()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Structural capabilities of a component type.
#[derive(Debug, EnumSetType, Serialize, Deserialize)]
pub enum Capability {
    /// Has child content between open and close tags.
    HasBody,
    /// Child content is a template instantiated at runtime; starts a fresh ID scope.
    Template,
    /// Starts a fresh ID scope.
    NamingContainer,
    /// Accepts attributes missing from its schema as plain strings.
    Expando,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyKind {
    String,
    Integer,
    Boolean,
    Float,
    Enum(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Float(f64),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => write!(f, "{s}"),
            PropertyValue::Integer(i) => write!(f, "{i}"),
            PropertyValue::Boolean(b) => write!(f, "{b}"),
            PropertyValue::Float(x) => write!(f, "{x}"),
        }
    }
}

pub type Converter = Arc<dyn Fn(&str) -> Result<PropertyValue, String> + Send + Sync>;

#[derive(Clone)]
pub struct PropertySchema {
    pub name: String,
    pub settable: bool,
    pub kind: PropertyKind,
    /// Overrides the default conversion for `kind`.
    pub converter: Option<Converter>,
}

impl fmt::Debug for PropertySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySchema")
            .field("name", &self.name)
            .field("settable", &self.settable)
            .field("kind", &self.kind)
            .field("converter", &self.converter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PropertySchema {
    pub fn new(name: &str, kind: PropertyKind) -> Self {
        PropertySchema {
            name: name.to_string(),
            settable: true,
            kind,
            converter: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.settable = false;
        self
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn convert(&self, raw: &str) -> Result<PropertyValue, String> {
        if let Some(converter) = &self.converter {
            return converter(raw);
        }
        let trimmed = raw.trim();
        match &self.kind {
            PropertyKind::String => Ok(PropertyValue::String(raw.to_string())),
            PropertyKind::Integer => trimmed
                .parse::<i64>()
                .map(PropertyValue::Integer)
                .map_err(|e| e.to_string()),
            PropertyKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Ok(PropertyValue::Boolean(true)),
                "false" => Ok(PropertyValue::Boolean(false)),
                _ => Err(format!("'{trimmed}' is not a boolean")),
            },
            PropertyKind::Float => trimmed
                .parse::<f64>()
                .map(PropertyValue::Float)
                .map_err(|e| e.to_string()),
            PropertyKind::Enum(variants) => variants
                .iter()
                .find(|v| v.eq_ignore_ascii_case(trimmed))
                .map(|v| PropertyValue::String(v.clone()))
                .ok_or_else(|| format!("'{trimmed}' is not one of {}", variants.join(", "))),
        }
    }
}

/// What a tag resolves to.
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub runtime_type: String,
    pub namespace: String,
    /// Unit that must be built before this component can be used (user components).
    pub source_hint: Option<LogicalPath>,
    pub capabilities: EnumSet<Capability>,
    pub properties: Vec<PropertySchema>,
}

impl PartialEq for ComponentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.runtime_type == other.runtime_type
            && self.namespace == other.namespace
            && self.source_hint == other.source_hint
            && self.capabilities == other.capabilities
    }
}

impl ComponentDescriptor {
    pub fn new(namespace: &str, runtime_type: &str) -> Self {
        ComponentDescriptor {
            runtime_type: runtime_type.to_string(),
            namespace: namespace.to_string(),
            source_hint: None,
            capabilities: EnumSet::empty(),
            properties: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: EnumSet<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_property(mut self, property: PropertySchema) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_source(mut self, source: LogicalPath) -> Self {
        self.source_hint = Some(source);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn property(&self, name: &str) -> Option<&PropertySchema> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn qualified_type(&self) -> String {
        if self.namespace.is_empty() {
            self.runtime_type.clone()
        } else {
            format!("{}.{}", self.namespace, self.runtime_type)
        }
    }
}

/// Tag resolution as consumed by the tree builder.
pub trait ComponentResolver: Send + Sync {
    fn resolve(&self, prefix: &str, name: &str) -> Option<Arc<ComponentDescriptor>>;

    /// Resolve `name` inside a namespace mapped to a prefix by a `Register` directive.
    fn resolve_in_namespace(&self, _namespace: &str, _name: &str) -> Option<Arc<ComponentDescriptor>> {
        None
    }
}

#[derive(Default)]
struct RegistryTables {
    /// (prefix, name), both lowercased
    tags: HashMap<(String, String), Arc<ComponentDescriptor>>,
    /// (namespace, name lowercased)
    types: HashMap<(String, String), Arc<ComponentDescriptor>>,
    /// prefix lowercased -> namespaces
    prefixes: HashMap<String, Vec<String>>,
    /// Fallback for unprefixed server tags (plain HTML elements marked runat="server").
    html_fallback: Option<Arc<ComponentDescriptor>>,
}

/// Thread-safe component registry.
///
/// Cloning is cheap and shares the underlying tables.
pub struct ComponentRegistry(Arc<RwLock<RegistryTables>>);

impl Clone for ComponentRegistry {
    fn clone(&self) -> Self {
        ComponentRegistry(self.0.clone())
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        ComponentRegistry::create()
    }
}

impl ComponentRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        ComponentRegistry(Arc::new(RwLock::new(RegistryTables::default())))
    }

    /// Registry with the built-in HTML server elements.
    pub fn create() -> Self {
        let registry = ComponentRegistry::empty();
        let html = ComponentDescriptor::new("Quire.Html", "HtmlGenericControl")
            .with_capabilities(Capability::HasBody | Capability::Expando);
        registry.0.write().html_fallback = Some(Arc::new(html));
        registry.register(
            "",
            "form",
            ComponentDescriptor::new("Quire.Html", "HtmlForm")
                .with_capabilities(Capability::HasBody | Capability::Expando)
                .with_property(PropertySchema::new("method", PropertyKind::String))
                .with_property(PropertySchema::new("action", PropertyKind::String)),
        );
        for void in ["input", "img", "br", "hr", "link", "meta"] {
            registry.register(
                "",
                void,
                ComponentDescriptor::new("Quire.Html", "HtmlVoidControl")
                    .with_capabilities(EnumSet::only(Capability::Expando)),
            );
        }
        registry
    }

    /// Register a component for `<prefix:name>`. Unprefixed registrations apply to plain tags.
    ///
    /// If a component is already registered under this tag it is overwritten and a log message
    /// emitted.
    pub fn register(&self, prefix: &str, name: &str, descriptor: ComponentDescriptor) {
        let key = (prefix.to_ascii_lowercase(), name.to_ascii_lowercase());
        let mut writer = self.0.write();
        if writer.tags.contains_key(&key) {
            tracing::info!(
                "[ComponentRegistry::register] Overwriting existing component: {}:{}",
                prefix,
                name
            );
        }
        writer.tags.insert(key, Arc::new(descriptor));
    }

    /// Register a type by namespace, reachable through prefixes mapped with
    /// [`ComponentRegistry::map_prefix`] or a `Register TagPrefix= Namespace=` directive.
    pub fn register_type(&self, descriptor: ComponentDescriptor) {
        let key = (
            descriptor.namespace.clone(),
            descriptor.runtime_type.to_ascii_lowercase(),
        );
        self.0.write().types.insert(key, Arc::new(descriptor));
    }

    pub fn map_prefix(&self, prefix: &str, namespace: &str) {
        let mut writer = self.0.write();
        let namespaces = writer
            .prefixes
            .entry(prefix.to_ascii_lowercase())
            .or_default();
        if !namespaces.iter().any(|n| n == namespace) {
            namespaces.push(namespace.to_string());
        }
    }

    pub fn list_components(&self) -> Vec<String> {
        let reader = self.0.read();
        let mut names: Vec<String> = reader
            .tags
            .keys()
            .map(|(prefix, name)| {
                if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}:{name}")
                }
            })
            .collect();
        names.sort();
        names
    }
}

impl ComponentResolver for ComponentRegistry {
    fn resolve(&self, prefix: &str, name: &str) -> Option<Arc<ComponentDescriptor>> {
        let reader = self.0.read();
        let key = (prefix.to_ascii_lowercase(), name.to_ascii_lowercase());
        if let Some(found) = reader.tags.get(&key) {
            return Some(found.clone());
        }
        if prefix.is_empty() {
            return reader.html_fallback.clone();
        }
        reader
            .prefixes
            .get(&key.0)
            .into_iter()
            .flatten()
            .find_map(|ns| reader.types.get(&(ns.clone(), key.1.clone())).cloned())
    }

    fn resolve_in_namespace(&self, namespace: &str, name: &str) -> Option<Arc<ComponentDescriptor>> {
        self.0
            .read()
            .types
            .get(&(namespace.to_string(), name.to_ascii_lowercase()))
            .cloned()
    }
}

/// Per-unit view layering `Register` directives over a shared resolver.
pub struct LocalRegistry<'a> {
    shared: &'a dyn ComponentResolver,
    user_components: HashMap<(String, String), Arc<ComponentDescriptor>>,
    prefixes: HashMap<String, Vec<String>>,
}

impl<'a> LocalRegistry<'a> {
    pub fn new(shared: &'a dyn ComponentResolver) -> Self {
        LocalRegistry {
            shared,
            user_components: HashMap::new(),
            prefixes: HashMap::new(),
        }
    }

    pub fn register_user_component(
        &mut self,
        prefix: &str,
        name: &str,
        descriptor: ComponentDescriptor,
    ) {
        self.user_components.insert(
            (prefix.to_ascii_lowercase(), name.to_ascii_lowercase()),
            Arc::new(descriptor),
        );
    }

    pub fn map_prefix(&mut self, prefix: &str, namespace: &str) {
        self.prefixes
            .entry(prefix.to_ascii_lowercase())
            .or_default()
            .push(namespace.to_string());
    }
}

impl ComponentResolver for LocalRegistry<'_> {
    fn resolve(&self, prefix: &str, name: &str) -> Option<Arc<ComponentDescriptor>> {
        let key = (prefix.to_ascii_lowercase(), name.to_ascii_lowercase());
        if let Some(found) = self.user_components.get(&key) {
            return Some(found.clone());
        }
        if let Some(found) = self
            .prefixes
            .get(&key.0)
            .into_iter()
            .flatten()
            .find_map(|ns| self.shared.resolve_in_namespace(ns, name))
        {
            return Some(found);
        }
        self.shared.resolve(prefix, name)
    }

    fn resolve_in_namespace(&self, namespace: &str, name: &str) -> Option<Arc<ComponentDescriptor>> {
        self.shared.resolve_in_namespace(namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn widget() -> ComponentDescriptor {
        ComponentDescriptor::new("Acme.Widgets", "Widget")
            .with_property(PropertySchema::new("Count", PropertyKind::Integer))
            .with_property(PropertySchema::new("Kind", PropertyKind::Enum(vec!["Big".into(), "Small".into()])))
            .with_property(PropertySchema::new("Version", PropertyKind::String).read_only())
    }

    #[test]
    fn test_generated_type_name() {
        assert_eq!(generated_type_name(&LogicalPath::new("/shop/cart.page")), "shop_cart_page");
        assert_eq!(generated_type_name(&LogicalPath::new("/2col-layout.master")), "_2col_layout_master");
    }

    #[test]
    fn test_resolve_prefixed() {
        let registry = ComponentRegistry::create();
        registry.register("x", "Widget", widget());
        let found = registry.resolve("X", "widget").unwrap();
        assert_eq!(found.qualified_type(), "Acme.Widgets.Widget");
        assert!(registry.resolve("x", "Gadget").is_none());
        assert!(registry.resolve("y", "Widget").is_none());
    }

    #[test]
    fn test_html_fallback() {
        let registry = ComponentRegistry::create();
        let div = registry.resolve("", "div").unwrap();
        assert!(div.has(Capability::HasBody));
        assert!(div.has(Capability::Expando));
        let input = registry.resolve("", "input").unwrap();
        assert!(!input.has(Capability::HasBody));
        assert!(ComponentRegistry::empty().resolve("", "div").is_none());
    }

    #[test]
    fn test_namespace_prefix() {
        let registry = ComponentRegistry::empty();
        registry.register_type(widget());
        assert!(registry.resolve("acme", "Widget").is_none());
        registry.map_prefix("acme", "Acme.Widgets");
        assert!(registry.resolve("acme", "Widget").is_some());

        let other = ComponentRegistry::empty();
        other.register_type(widget());
        let mut local = LocalRegistry::new(&other);
        assert!(local.resolve("w", "Widget").is_none());
        local.map_prefix("w", "Acme.Widgets");
        assert!(local.resolve("w", "Widget").is_some());
    }

    #[test]
    fn test_schema_conversion() {
        let widget = widget();
        let count = widget.property("count").unwrap();
        assert_eq!(count.convert(" 42 "), Ok(PropertyValue::Integer(42)));
        assert!(count.convert("lots").is_err());
        let kind = widget.property("Kind").unwrap();
        assert_eq!(kind.convert("big"), Ok(PropertyValue::String("Big".into())));
        assert!(!widget.property("Version").unwrap().settable);

        let custom = PropertySchema::new("Color", PropertyKind::String).with_converter(Arc::new(
            |raw: &str| {
                raw.strip_prefix('#')
                    .map(|hex| PropertyValue::String(hex.to_uppercase()))
                    .ok_or_else(|| "expected #rrggbb".to_string())
            },
        ));
        assert_eq!(custom.convert("#ff0000"), Ok(PropertyValue::String("FF0000".into())));
        assert!(custom.convert("red").is_err());
    }

    #[test]
    fn test_concurrent_access() {
        let registry = ComponentRegistry::create();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry.register("t", &format!("C{i}"), widget());
                    registry.resolve("t", &format!("c{i}")).is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(
            registry
                .list_components()
                .iter()
                .filter(|c| c.starts_with("t:"))
                .count(),
            4
        );
    }

    #[test]
    fn test_register_waits_for_readers() {
        let registry = ComponentRegistry::create();
        let reader = registry.0.read();
        let handle = {
            let registry = registry.clone();
            thread::spawn(move || registry.register("t", "Late", widget()))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(reader);
        handle.join().unwrap();
        assert!(registry.resolve("t", "late").is_some());
    }
}
