//! Object builder
//!
//! The bridge between the state machine and host values. The machine never
//! touches `Value` internals directly; it goes through the operations here,
//! which keep three promises:
//!
//! - handles are allocated once per frame and never replaced, so partial
//!   views observe the same object across chunks;
//! - records are pre-initialized with declared defaults (or the empty value
//!   appropriate to the field's kind), so a partial view is always a
//!   type-correct instance;
//! - a field assignment is sticky: the first non-sentinel write wins for
//!   the lifetime of the frame.

use crate::schema::{RecordSchema, ScalarKind, SchemaNode};
use crate::value::{handles_equal, Handle, RecordValue, Value};
use rustc_hash::FxHashSet;

/// The kind-appropriate empty value for an unpopulated slot.
pub fn empty_value(schema: &SchemaNode) -> Value {
    match schema {
        SchemaNode::Scalar(ScalarKind::String) => Value::Str(String::new()),
        SchemaNode::Scalar(ScalarKind::Integer) => Value::Int(0),
        SchemaNode::Scalar(ScalarKind::Float) => Value::Float(0.0),
        SchemaNode::Scalar(ScalarKind::Bool) => Value::Bool(false),
        SchemaNode::Scalar(ScalarKind::Null) => Value::Null,
        SchemaNode::Sequence(_) => Value::List(Vec::new()),
        SchemaNode::Mapping { .. } => Value::Map(Vec::new()),
        SchemaNode::Set(_) => Value::Set(Vec::new()),
        SchemaNode::Tuple { .. } => Value::Tuple(Vec::new()),
        // Absent unions, records, references, and Any read as null until
        // something real arrives.
        SchemaNode::Union { .. }
        | SchemaNode::Record(_)
        | SchemaNode::Ref(_)
        | SchemaNode::Any => Value::Null,
    }
}

/// Allocate a record with every declared field pre-initialized.
pub fn new_record(schema: &RecordSchema) -> Handle {
    let mut rec = RecordValue::new(&schema.name);
    for field in &schema.fields {
        let initial = field
            .default
            .clone()
            .unwrap_or_else(|| empty_value(&field.schema));
        rec.fields.push((field.name.clone(), initial.into_handle()));
    }
    Value::Record(rec).into_handle()
}

/// Promote a handle to a loosely-typed record in place. An `Any` frame
/// starts as null and becomes a record the moment an element child seals;
/// the promotion reuses the frame's handle so views keep their reference.
/// No-op once the handle holds a non-null value.
pub fn promote_loose_record(handle: &Handle, name: &str) {
    let mut value = handle.borrow_mut();
    if value.is_null() {
        *value = Value::Record(RecordValue::new(name));
    }
}

/// Allocate an empty container of the schema's kind. Fixed-arity tuples
/// are pre-sized with null placeholders so partial views carry the full
/// shape from the start.
pub fn new_container(schema: &SchemaNode) -> Handle {
    let value = match schema {
        SchemaNode::Tuple {
            elems,
            variadic: false,
        } => Value::Tuple(
            elems
                .iter()
                .map(|_| Value::Null.into_handle())
                .collect(),
        ),
        other => empty_value(other),
    };
    value.into_handle()
}

/// Sticky field assignment. Returns false (and leaves the record
/// untouched) when the field was already populated or the handle is not a
/// record.
pub fn set_field(
    record: &Handle,
    field: &str,
    value: Handle,
    populated: &mut FxHashSet<String>,
) -> bool {
    if populated.contains(field) {
        return false;
    }
    match &mut *record.borrow_mut() {
        Value::Record(rec) => {
            rec.set(field, value);
            populated.insert(field.to_string());
            true
        }
        _ => false,
    }
}

/// Append to a sequence cursor, in document order.
pub fn append(list: &Handle, item: Handle) {
    if let Value::List(items) = &mut *list.borrow_mut() {
        items.push(item);
    }
}

/// Insert into a set cursor, deduplicating on insertion. Returns whether
/// the member was new.
pub fn add(set: &Handle, item: Handle) -> bool {
    if let Value::Set(members) = &mut *set.borrow_mut() {
        if members.iter().any(|m| handles_equal(m, &item)) {
            return false;
        }
        members.push(item);
        true
    } else {
        false
    }
}

/// Insert into a mapping cursor under a key. Duplicate keys take the last
/// value, replacing in place so both never coexist in a partial view.
pub fn insert(map: &Handle, key: &str, item: Handle) {
    if let Value::Map(entries) = &mut *map.borrow_mut() {
        if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = item;
        } else {
            entries.push((key.to_string(), item));
        }
    }
}

/// Write a fixed-tuple slot. Returns false when the index is outside the
/// declared arity.
pub fn tuple_set(tuple: &Handle, index: usize, item: Handle) -> bool {
    if let Value::Tuple(slots) = &mut *tuple.borrow_mut() {
        if index < slots.len() {
            slots[index] = item;
            return true;
        }
    }
    false
}

/// Append to a variadic tuple.
pub fn tuple_push(tuple: &Handle, item: Handle) {
    if let Value::Tuple(slots) = &mut *tuple.borrow_mut() {
        slots.push(item);
    }
}

/// Seal hook for containers. Re-asserts set uniqueness; other kinds need
/// no deferred work because element schemas are known before their items
/// arrive.
pub fn finalize(handle: &Handle) {
    let mut value = handle.borrow_mut();
    if let Value::Set(members) = &mut *value {
        let mut unique: Vec<Handle> = Vec::with_capacity(members.len());
        for m in members.drain(..) {
            if !unique.iter().any(|u| handles_equal(u, &m)) {
                unique.push(m);
            }
        }
        *members = unique;
    }
}
