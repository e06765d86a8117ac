//! Dynamic values and shared handles
//!
//! The engine materializes parsed data as `Value` trees. Every node is held
//! behind a `Handle` (`Rc<RefCell<Value>>`) so that in-progress containers
//! and records can grow in place between chunks while callers observe the
//! same object through the partial view. Handle identity is stable for the
//! lifetime of the parse.

use std::cell::RefCell;
use std::rc::Rc;

/// Shared, interior-mutable reference to a value under construction.
pub type Handle = Rc<RefCell<Value>>;

/// A record value: type name plus fields in assignment order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordValue {
    pub name: String,
    pub fields: Vec<(String, Handle)>,
}

impl RecordValue {
    pub fn new(name: impl Into<String>) -> Self {
        RecordValue {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Look up a field handle by name.
    pub fn get(&self, name: &str) -> Option<&Handle> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, h)| h)
    }

    /// Set a field, replacing any existing entry with the same name.
    pub fn set(&mut self, name: &str, handle: Handle) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n == name) {
            slot.1 = handle;
        } else {
            self.fields.push((name.to_string(), handle));
        }
    }
}

/// A dynamically-typed parsed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Handle>),
    /// Insertion-ordered mapping; keys are unique (last wins).
    Map(Vec<(String, Handle)>),
    /// Insertion-ordered set; members are unique under `PartialEq`.
    Set(Vec<Handle>),
    Tuple(Vec<Handle>),
    Record(RecordValue),
}

impl Value {
    /// Wrap this value in a fresh handle.
    pub fn into_handle(self) -> Handle {
        Rc::new(RefCell::new(self))
    }

    /// Name of the value's shape, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::Record(_) => "record",
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Element count of a container value, or None for non-containers.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(v) | Value::Set(v) | Value::Tuple(v) => Some(v.len()),
            Value::Map(m) => Some(m.len()),
            Value::Record(r) => Some(r.fields.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Snapshot of a record field or map entry by name.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self {
            Value::Record(r) => r.get(name).map(|h| h.borrow().clone()),
            Value::Map(m) => m
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, h)| h.borrow().clone()),
            _ => None,
        }
    }

    /// Snapshot of a positional element of a list, set, or tuple.
    pub fn index(&self, i: usize) -> Option<Value> {
        match self {
            Value::List(v) | Value::Set(v) | Value::Tuple(v) => {
                v.get(i).map(|h| h.borrow().clone())
            }
            _ => None,
        }
    }

    /// Detach a fully-owned copy of the tree behind a handle. Used when
    /// ownership transfers to the caller at finalization.
    pub fn deep_clone(handle: &Handle) -> Value {
        fn clone_children(children: &[Handle]) -> Vec<Handle> {
            children
                .iter()
                .map(|h| Value::deep_clone(h).into_handle())
                .collect()
        }

        match &*handle.borrow() {
            Value::List(v) => Value::List(clone_children(v)),
            Value::Set(v) => Value::Set(clone_children(v)),
            Value::Tuple(v) => Value::Tuple(clone_children(v)),
            Value::Map(m) => Value::Map(
                m.iter()
                    .map(|(k, h)| (k.clone(), Value::deep_clone(h).into_handle()))
                    .collect(),
            ),
            Value::Record(r) => Value::Record(RecordValue {
                name: r.name.clone(),
                fields: r
                    .fields
                    .iter()
                    .map(|(k, h)| (k.clone(), Value::deep_clone(h).into_handle()))
                    .collect(),
            }),
            scalar => scalar.clone(),
        }
    }
}

/// Structural equality through handles.
pub fn handles_equal(a: &Handle, b: &Handle) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    *a.borrow() == *b.borrow()
}
