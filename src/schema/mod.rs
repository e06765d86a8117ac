//! Type model
//!
//! A normalized, immutable description of the shapes the parser can
//! populate. Schemas are built once — either programmatically through
//! `RecordBuilder` and the `SchemaNode` constructors, or by an adapter
//! implementing `SchemaProvider` — and consulted read-only by the state
//! machine.
//!
//! Records may reference each other (including cyclically) through
//! `SchemaNode::Ref`, which stores a type token and is re-resolved through
//! the provider on demand rather than holding a direct schema reference.

pub mod typeexpr;

use crate::value::Value;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Wire tokens with structural meaning in container contexts. A record
/// field declared with one of these names is renamed on the wire by
/// prefixing an underscore.
pub const RESERVED_NAMES: [&str; 3] = ["item", "key", "type"];

/// Kind of a scalar leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Integer,
    Float,
    Bool,
    Null,
}

impl ScalarKind {
    /// Canonical element name for a top-level scalar of this kind.
    pub fn tag_name(self) -> &'static str {
        match self {
            ScalarKind::String => "str",
            ScalarKind::Integer => "int",
            ScalarKind::Float => "float",
            ScalarKind::Bool => "bool",
            ScalarKind::Null => "null",
        }
    }

    /// Resolve a scalar type name, accepting the aliases models produce.
    pub fn from_name(name: &str) -> Option<ScalarKind> {
        match name {
            "str" | "string" => Some(ScalarKind::String),
            "int" | "integer" => Some(ScalarKind::Integer),
            "float" | "number" | "double" => Some(ScalarKind::Float),
            "bool" | "boolean" => Some(ScalarKind::Bool),
            "null" | "none" | "None" | "NoneType" => Some(ScalarKind::Null),
            _ => None,
        }
    }
}

/// Normalized schema node.
#[derive(Debug, Clone)]
pub enum SchemaNode {
    Scalar(ScalarKind),
    Sequence(Box<SchemaNode>),
    Mapping {
        key: Box<SchemaNode>,
        value: Box<SchemaNode>,
    },
    Set(Box<SchemaNode>),
    Tuple {
        elems: Vec<SchemaNode>,
        /// A variadic tuple repeats its single element schema.
        variadic: bool,
    },
    /// A union of variants. `Optional[T]` is normalized to
    /// `Union { variants: [T, Null], null_default: true }`.
    ///
    /// When the structural discriminator is still ambiguous at seal time,
    /// the first declared variant compatible with every observed field is
    /// chosen.
    Union {
        variants: Vec<SchemaNode>,
        /// Null is the default for an absent value.
        null_default: bool,
    },
    Record(Rc<RecordSchema>),
    /// A named reference resolved through the schema provider on demand.
    /// This is how mutually-recursive record types are expressed.
    Ref(String),
    /// Loosely typed: accepts whatever arrives.
    Any,
}

impl SchemaNode {
    pub fn string() -> Self {
        SchemaNode::Scalar(ScalarKind::String)
    }

    pub fn integer() -> Self {
        SchemaNode::Scalar(ScalarKind::Integer)
    }

    pub fn float() -> Self {
        SchemaNode::Scalar(ScalarKind::Float)
    }

    pub fn boolean() -> Self {
        SchemaNode::Scalar(ScalarKind::Bool)
    }

    pub fn null() -> Self {
        SchemaNode::Scalar(ScalarKind::Null)
    }

    pub fn sequence(elem: SchemaNode) -> Self {
        SchemaNode::Sequence(Box::new(elem))
    }

    pub fn mapping(key: SchemaNode, value: SchemaNode) -> Self {
        SchemaNode::Mapping {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    pub fn set(elem: SchemaNode) -> Self {
        SchemaNode::Set(Box::new(elem))
    }

    pub fn tuple(elems: Vec<SchemaNode>) -> Self {
        SchemaNode::Tuple {
            elems,
            variadic: false,
        }
    }

    pub fn variadic_tuple(elem: SchemaNode) -> Self {
        SchemaNode::Tuple {
            elems: vec![elem],
            variadic: true,
        }
    }

    /// `Optional[inner]`, normalized to a union with null where null is
    /// the absence default.
    pub fn optional(inner: SchemaNode) -> Self {
        SchemaNode::Union {
            variants: vec![inner, SchemaNode::null()],
            null_default: true,
        }
    }

    pub fn union(variants: Vec<SchemaNode>) -> Self {
        let null_default = variants
            .iter()
            .any(|v| matches!(v, SchemaNode::Scalar(ScalarKind::Null)));
        SchemaNode::Union {
            variants,
            null_default,
        }
    }

    pub fn record(schema: Rc<RecordSchema>) -> Self {
        SchemaNode::Record(schema)
    }

    /// Shape name for diagnostics and root-tag matching.
    pub fn kind_name(&self) -> &str {
        match self {
            SchemaNode::Scalar(k) => k.tag_name(),
            SchemaNode::Sequence(_) => "list",
            SchemaNode::Mapping { .. } => "dict",
            SchemaNode::Set(_) => "set",
            SchemaNode::Tuple { .. } => "tuple",
            SchemaNode::Union { .. } => "union",
            SchemaNode::Record(r) => &r.name,
            SchemaNode::Ref(name) => name,
            SchemaNode::Any => "any",
        }
    }

    /// Whether null is an acceptable value for this schema.
    pub fn accepts_null(&self) -> bool {
        match self {
            SchemaNode::Scalar(ScalarKind::Null) | SchemaNode::Any => true,
            SchemaNode::Union { variants, .. } => variants.iter().any(|v| v.accepts_null()),
            _ => false,
        }
    }
}

/// One declared record field.
#[derive(Debug, Clone)]
pub struct Field {
    /// Declared name: the one assignment targets.
    pub name: String,
    /// On-wire name after reserved-keyword renaming. Equal to `name`
    /// unless the declared name collides with `RESERVED_NAMES`.
    pub wire_name: String,
    pub schema: SchemaNode,
    pub default: Option<Value>,
    pub required: bool,
}

/// Compute the wire name for a declared field name.
pub fn wire_name_for(declared: &str) -> String {
    if RESERVED_NAMES.contains(&declared) {
        format!("_{declared}")
    } else {
        declared.to_string()
    }
}

/// A record (product) type: a name plus an ordered field table.
///
/// Empty records are legal terminals. `open` records tolerate undeclared
/// fields instead of reporting them.
#[derive(Debug)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<Field>,
    pub open: bool,
    /// Lookup by declared and wire name.
    index: FxHashMap<String, usize>,
}

impl RecordSchema {
    pub fn builder(name: impl Into<String>) -> RecordBuilder {
        RecordBuilder {
            name: name.into(),
            fields: Vec::new(),
            open: false,
        }
    }

    /// Look up a field by declared or wire name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of field names in `names` that this record declares.
    pub fn matching_fields(&self, names: &[String]) -> usize {
        names.iter().filter(|n| self.has_field(n)).count()
    }

    /// Whether every name in `names` is a declared (or wire) field name.
    pub fn covers_fields(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.has_field(n))
    }
}

/// Chainable construction of a `RecordSchema`.
pub struct RecordBuilder {
    name: String,
    fields: Vec<Field>,
    open: bool,
}

impl RecordBuilder {
    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, schema: SchemaNode) -> Self {
        let name = name.into();
        let required = !schema.accepts_null();
        self.fields.push(Field {
            wire_name: wire_name_for(&name),
            name,
            schema,
            default: None,
            required,
        });
        self
    }

    /// Add a field with an explicit default value.
    pub fn defaulted(
        mut self,
        name: impl Into<String>,
        schema: SchemaNode,
        default: Value,
    ) -> Self {
        let name = name.into();
        self.fields.push(Field {
            wire_name: wire_name_for(&name),
            name,
            schema,
            default: Some(default),
            required: false,
        });
        self
    }

    /// Tolerate undeclared fields instead of reporting them.
    pub fn open(mut self) -> Self {
        self.open = true;
        self
    }

    pub fn build(self) -> Rc<RecordSchema> {
        let mut index = FxHashMap::default();
        for (i, f) in self.fields.iter().enumerate() {
            index.insert(f.name.clone(), i);
            if f.wire_name != f.name {
                index.insert(f.wire_name.clone(), i);
            }
        }
        Rc::new(RecordSchema {
            name: self.name,
            fields: self.fields,
            open: self.open,
            index,
        })
    }
}

/// Host-supplied schema lookup. Implementations must be pure and
/// deterministic for a given token.
pub trait SchemaProvider {
    /// Return the normalized schema for a type token, or None when the
    /// token is unknown.
    fn describe(&self, token: &str) -> Option<SchemaNode>;

    /// Optional helper for nominal union disambiguation. The default
    /// matches `hint` against record variant names.
    fn resolve_variant(&self, variants: &[SchemaNode], hint: &str) -> Option<usize> {
        variants.iter().position(|v| match v {
            SchemaNode::Record(r) => r.name == hint,
            SchemaNode::Ref(name) => name == hint,
            _ => false,
        })
    }
}

/// In-process registry of named types; the default `SchemaProvider`.
#[derive(Default)]
pub struct SchemaRegistry {
    types: FxHashMap<String, SchemaNode>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named schema. Record registration makes the name
    /// resolvable from `type="…"` attributes and `Ref` nodes.
    pub fn register(&mut self, name: impl Into<String>, schema: SchemaNode) {
        self.types.insert(name.into(), schema);
    }

    /// Register a record under its own name.
    pub fn register_record(&mut self, record: Rc<RecordSchema>) {
        self.types
            .insert(record.name.clone(), SchemaNode::Record(record));
    }
}

impl SchemaProvider for SchemaRegistry {
    fn describe(&self, token: &str) -> Option<SchemaNode> {
        if let Some(node) = self.types.get(token) {
            return Some(node.clone());
        }
        builtin_schema(token)
    }
}

/// Schemas for the built-in type names and container synonyms.
pub fn builtin_schema(token: &str) -> Option<SchemaNode> {
    if let Some(kind) = ScalarKind::from_name(token) {
        return Some(SchemaNode::Scalar(kind));
    }
    match token {
        "list" | "List" => Some(SchemaNode::sequence(SchemaNode::Any)),
        "dict" | "Dict" => Some(SchemaNode::mapping(SchemaNode::string(), SchemaNode::Any)),
        "set" | "Set" => Some(SchemaNode::set(SchemaNode::Any)),
        "tuple" | "Tuple" => Some(SchemaNode::variadic_tuple(SchemaNode::Any)),
        "any" | "Any" => Some(SchemaNode::Any),
        _ => None,
    }
}

/// Resolve a `Ref` node through the provider; other nodes pass through.
pub fn resolve_schema(node: &SchemaNode, provider: &dyn SchemaProvider) -> SchemaNode {
    match node {
        SchemaNode::Ref(name) => provider.describe(name).unwrap_or(SchemaNode::Any),
        other => other.clone(),
    }
}
