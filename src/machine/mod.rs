//! Typed push-down automaton
//!
//! Consumes the tag-event stream and drives object construction. Each open
//! element is one `Frame` carrying its bound schema, its value handle, and
//! its bookkeeping: the populated-field set, the scalar accumulator, and
//! the map key or tuple slot the sealed value will land in.
//!
//! Union disambiguation is a three-level discriminator, evaluated in
//! order: the explicit `type="…"` attribute, the tag's own name against
//! variant names, and finally the observed field set. A structurally
//! undecided union frame stays loose until it seals; if it is still
//! ambiguous then, the first declared variant compatible with every
//! observed field wins.

pub mod coerce;

use crate::builder;
use crate::error::{Diagnostic, DiagnosticKind, ParseError};
use crate::events::{AttrList, Span, TagEvent};
use crate::schema::{
    resolve_schema, RecordSchema, ScalarKind, SchemaNode, SchemaProvider,
};
use crate::value::{Handle, Value};
use coerce::{coerce_first, coerce_scalar};
use log::{debug, trace};
use lru::LruCache;
use rustc_hash::FxHashSet;
use std::num::NonZeroUsize;
use std::rc::Rc;

/// Parsed type expressions repeat on every item tag; keep a few around.
const TYPE_EXPR_CACHE: usize = 64;

/// Shape-specific state of one frame.
enum FrameKind {
    Scalar {
        kind: ScalarKind,
    },
    /// A union whose live variants are all scalars; coerced at seal time
    /// in declaration order.
    ScalarUnion {
        kinds: Vec<ScalarKind>,
        null_default: bool,
    },
    Sequence {
        elem: SchemaNode,
    },
    SetFrame {
        elem: SchemaNode,
    },
    MappingFrame {
        value: SchemaNode,
    },
    TupleFrame {
        elems: Vec<SchemaNode>,
        variadic: bool,
        next: usize,
    },
    RecordFrame {
        schema: Rc<RecordSchema>,
    },
    /// Undecided union over record variants (plus optional scalar
    /// fallbacks). Sealed children accumulate in `observed` under their
    /// wire names until the variant is known.
    UnionFrame {
        records: Vec<Rc<RecordSchema>>,
        scalars: Vec<ScalarKind>,
        null_default: bool,
        observed: Vec<(String, Handle)>,
    },
    /// `Any`: becomes a loose record if children arrive, a string if only
    /// text does.
    Loose,
}

impl FrameKind {
    fn name(&self) -> &'static str {
        match self {
            FrameKind::Scalar { .. } => "scalar",
            FrameKind::ScalarUnion { .. } => "scalar-union",
            FrameKind::Sequence { .. } => "list",
            FrameKind::SetFrame { .. } => "set",
            FrameKind::MappingFrame { .. } => "dict",
            FrameKind::TupleFrame { .. } => "tuple",
            FrameKind::RecordFrame { .. } => "record",
            FrameKind::UnionFrame { .. } => "union",
            FrameKind::Loose => "any",
        }
    }
}

/// One open element.
struct Frame {
    /// Element name that opened this frame.
    name: String,
    kind: FrameKind,
    handle: Handle,
    /// Declared field name to assign in the parent record on seal.
    parent_slot: Option<String>,
    /// Mapping key captured from the opening `<item key="…">`.
    map_key: Option<String>,
    /// Slot index in a fixed-arity parent tuple.
    tuple_index: Option<usize>,
    /// Fields assigned so far (sticky rule).
    populated: FxHashSet<String>,
    /// Scalar accumulator.
    text: String,
    /// Some content arrived as CDATA: preserve bytes verbatim.
    verbatim: bool,
    /// Synthesized wrapper (bare element coerced to a one-element
    /// sequence): seals together with its only child.
    implicit: bool,
}

impl Frame {
    fn new(name: String, kind: FrameKind, handle: Handle) -> Self {
        Frame {
            name,
            kind,
            handle,
            parent_slot: None,
            map_key: None,
            tuple_index: None,
            populated: FxHashSet::default(),
            text: String::new(),
            verbatim: false,
            implicit: false,
        }
    }
}

/// The parser state machine.
pub struct Machine {
    provider: Rc<dyn SchemaProvider>,
    root_schema: SchemaNode,
    stack: Vec<Frame>,
    /// The stable root handle partial views observe. Reused by the root
    /// frame when it opens.
    root: Handle,
    complete: bool,
    diagnostics: Vec<Diagnostic>,
    strict: bool,
    max_depth: usize,
    /// Absorbs events for skipped subtrees (sticky re-writes, unexpected
    /// tags, content after completion).
    skip_depth: usize,
    cache: LruCache<String, Option<SchemaNode>>,
    fatal: Option<ParseError>,
}

impl Machine {
    pub fn new(
        root_schema: SchemaNode,
        provider: Rc<dyn SchemaProvider>,
        strict: bool,
        max_depth: usize,
    ) -> Self {
        let resolved = resolve_schema(&root_schema, provider.as_ref());
        let root = initial_root_value(&resolved, provider.as_ref()).into_handle();
        Machine {
            provider,
            root_schema: resolved,
            stack: Vec::new(),
            root,
            complete: false,
            diagnostics: Vec::new(),
            strict,
            max_depth,
            skip_depth: 0,
            cache: LruCache::new(NonZeroUsize::new(TYPE_EXPR_CACHE).unwrap()),
            fatal: None,
        }
    }

    /// The root value handle. Identity is stable for the parser lifetime.
    pub fn root_handle(&self) -> Handle {
        Rc::clone(&self.root)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn fatal(&self) -> Option<&ParseError> {
        self.fatal.as_ref()
    }

    /// Number of elements currently open.
    pub fn open_depth(&self) -> usize {
        self.stack.len()
    }

    /// Handles of the open (unsealed) frames, outermost first. The last
    /// entry is the element currently under construction; containers do
    /// not include it until it seals.
    pub fn open_handles(&self) -> Vec<Handle> {
        self.stack.iter().map(|f| Rc::clone(&f.handle)).collect()
    }

    /// Feed one event through the automaton.
    pub fn apply(&mut self, event: TagEvent) {
        if self.fatal.is_some() {
            return;
        }
        match event {
            TagEvent::Start {
                name,
                attrs,
                self_closing,
                span,
            } => self.on_start(name, attrs, self_closing, span),
            TagEvent::End { name, span } => self.on_end(&name, span),
            TagEvent::Text { text, span } => self.on_text(&text, false, span),
            TagEvent::CData { text, span } => self.on_text(&text, true, span),
            TagEvent::Error { message, span } => {
                self.diagnose(DiagnosticKind::Scanner, message, span)
            }
        }
    }

    // ------------------------------------------------------------------
    // Start handling
    // ------------------------------------------------------------------

    fn on_start(&mut self, name: String, attrs: AttrList, self_closing: bool, span: Span) {
        if self.skip_depth > 0 {
            if !self_closing {
                self.skip_depth += 1;
            }
            return;
        }

        if self.stack.is_empty() {
            self.on_root_start(name, attrs, self_closing, span);
            return;
        }

        if self.stack.len() >= self.max_depth {
            self.fatal = Some(ParseError::DepthExceeded(self.max_depth));
            return;
        }

        trace!("start <{name}> at depth {}", self.stack.len());

        // Decide the child frame from the top frame's shape. The borrow on
        // the top frame ends before the child is constructed.
        enum Plan {
            Child {
                schema: SchemaNode,
                slot: Option<String>,
                map_key: Option<String>,
                tuple_index: Option<usize>,
            },
            Skip {
                diagnostic: Option<(DiagnosticKind, String)>,
            },
        }

        let Frame {
            kind: top_kind,
            populated: top_populated,
            ..
        } = self.stack.last_mut().expect("non-empty stack");

        let plan = match top_kind {
            FrameKind::RecordFrame { schema } => {
                let schema = Rc::clone(schema);
                match schema.field(&name) {
                    Some(field) => {
                        if top_populated.contains(&field.name) {
                            // Sticky: the field already holds a value.
                            Plan::Skip { diagnostic: None }
                        } else {
                            Plan::Child {
                                schema: field.schema.clone(),
                                slot: Some(field.name.clone()),
                                map_key: None,
                                tuple_index: None,
                            }
                        }
                    }
                    None if schema.open => Plan::Child {
                        schema: SchemaNode::Any,
                        slot: Some(name.clone()),
                        map_key: None,
                        tuple_index: None,
                    },
                    None => Plan::Skip {
                        diagnostic: Some((
                            DiagnosticKind::UnexpectedTag,
                            format!("{} has no field named {name:?}", schema.name),
                        )),
                    },
                }
            }
            FrameKind::UnionFrame {
                records, observed, ..
            } => {
                if observed.iter().any(|(n, _)| n == &name) {
                    Plan::Skip { diagnostic: None }
                } else {
                    // Pick the field schema from the variant that best
                    // matches everything observed so far plus this field.
                    let mut names: Vec<String> =
                        observed.iter().map(|(n, _)| n.clone()).collect();
                    names.push(name.clone());
                    let best = records
                        .iter()
                        .filter(|r| r.has_field(&name))
                        .max_by_key(|r| r.matching_fields(&names));
                    match best {
                        Some(rec) => Plan::Child {
                            schema: rec.field(&name).expect("filtered").schema.clone(),
                            slot: Some(name.clone()),
                            map_key: None,
                            tuple_index: None,
                        },
                        None => Plan::Skip {
                            diagnostic: Some((
                                DiagnosticKind::UnexpectedTag,
                                format!("no union variant declares a field named {name:?}"),
                            )),
                        },
                    }
                }
            }
            FrameKind::Sequence { elem } | FrameKind::SetFrame { elem } => Plan::Child {
                schema: elem.clone(),
                slot: None,
                map_key: None,
                tuple_index: None,
            },
            FrameKind::MappingFrame { value } => match attrs.get("key") {
                Some(key) => Plan::Child {
                    schema: value.clone(),
                    slot: None,
                    map_key: Some(key.to_string()),
                    tuple_index: None,
                },
                None => Plan::Skip {
                    diagnostic: Some((
                        DiagnosticKind::Arity,
                        format!("mapping item <{name}> lacks a key attribute"),
                    )),
                },
            },
            FrameKind::TupleFrame {
                elems,
                variadic,
                next,
            } => {
                if !*variadic && *next >= elems.len() {
                    Plan::Skip {
                        diagnostic: Some((
                            DiagnosticKind::Arity,
                            format!(
                                "tuple already holds its declared {} element(s)",
                                elems.len()
                            ),
                        )),
                    }
                } else {
                    let index = *next;
                    *next += 1;
                    let schema = if *variadic {
                        elems[0].clone()
                    } else {
                        elems[index].clone()
                    };
                    Plan::Child {
                        schema,
                        slot: None,
                        map_key: None,
                        tuple_index: Some(index),
                    }
                }
            }
            FrameKind::Loose => Plan::Child {
                schema: SchemaNode::Any,
                slot: Some(name.clone()),
                map_key: None,
                tuple_index: None,
            },
            FrameKind::Scalar { .. } | FrameKind::ScalarUnion { .. } => Plan::Skip {
                diagnostic: Some((
                    DiagnosticKind::UnexpectedTag,
                    format!("unexpected element <{name}> inside scalar content"),
                )),
            },
        };

        match plan {
            Plan::Child {
                schema,
                slot,
                map_key,
                tuple_index,
            } => {
                let schema = self.refine(&schema, &attrs);
                let mut frame = self.make_frame(schema, &name, &attrs, None);
                frame.parent_slot = slot;
                frame.map_key = map_key;
                frame.tuple_index = tuple_index;
                self.stack.push(frame);
                if self_closing {
                    self.seal_top(span, true);
                }
            }
            Plan::Skip { diagnostic } => {
                if let Some((kind, message)) = diagnostic {
                    self.diagnose(kind, message, span);
                }
                if !self_closing {
                    self.skip_depth = 1;
                }
            }
        }
    }

    /// A start tag with no frame open: match it against the root schema.
    fn on_root_start(&mut self, name: String, attrs: AttrList, self_closing: bool, span: Span) {
        if self.complete {
            trace!("content after completion: skipping <{name}>");
            if !self_closing {
                self.skip_depth = 1;
            }
            return;
        }

        let schema = self.root_schema.clone();
        let accepted = match &schema {
            SchemaNode::Sequence(elem) if name != "list" => {
                // A single bare element satisfying a Sequence top level is
                // coerced to a one-element sequence.
                if self.root_accepts(elem, &name, &attrs) {
                    let root = self.root_handle();
                    *root.borrow_mut() = Value::List(Vec::new());
                    let mut wrapper = Frame::new(
                        "list".to_string(),
                        FrameKind::Sequence {
                            elem: (**elem).clone(),
                        },
                        root,
                    );
                    wrapper.implicit = true;
                    self.stack.push(wrapper);
                    debug!("wrapping bare <{name}> into implicit sequence root");
                    // Re-dispatch the same tag into the wrapper.
                    self.on_start(name, attrs, self_closing, span);
                    return;
                }
                false
            }
            _ => self.root_accepts(&schema, &name, &attrs),
        };

        if !accepted {
            let message = format!("top-level <{name}> does not match the expected {}",
                schema.kind_name());
            if self.strict {
                self.fatal = Some(ParseError::Strict(message));
                return;
            }
            self.diagnose(DiagnosticKind::UnexpectedTag, message, span);
            if !self_closing {
                self.skip_depth = 1;
            }
            return;
        }

        debug!("root <{name}> opened");
        let root = self.root_handle();
        let refined = self.refine(&schema, &attrs);
        let frame = self.make_frame(refined, &name, &attrs, Some(root));
        self.stack.push(frame);

        if self_closing {
            // A self-closing root yields a value but does not mark the
            // parse complete; see the partial-view contract.
            self.seal_top(span, false);
        }
    }

    /// Whether a top-level element name is compatible with a schema.
    fn root_accepts(&mut self, schema: &SchemaNode, name: &str, attrs: &AttrList) -> bool {
        match resolve_schema(schema, self.provider.as_ref()) {
            SchemaNode::Record(rec) => rec.name == name,
            SchemaNode::Scalar(kind) => ScalarKind::from_name(name) == Some(kind),
            SchemaNode::Sequence(_) => name == "list",
            SchemaNode::Mapping { .. } => name == "dict",
            SchemaNode::Set(_) => name == "set",
            SchemaNode::Tuple { .. } => name == "tuple",
            SchemaNode::Union { variants, .. } => {
                if let Some(expr) = attrs.get("type") {
                    if let Some(parsed) = self.parse_type_attr(expr) {
                        if variants
                            .iter()
                            .any(|v| v.kind_name() == parsed.kind_name())
                        {
                            return true;
                        }
                    }
                }
                let provider = Rc::clone(&self.provider);
                variants
                    .iter()
                    .any(|v| matches_nominal(&resolve_schema(v, provider.as_ref()), name))
            }
            SchemaNode::Any => true,
            SchemaNode::Ref(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Text handling
    // ------------------------------------------------------------------

    fn on_text(&mut self, text: &str, cdata: bool, _span: Span) {
        if self.skip_depth > 0 {
            return;
        }
        let Some(top) = self.stack.last_mut() else {
            // Inter-element prose at the top level carries no meaning.
            return;
        };

        match &top.kind {
            FrameKind::Scalar { kind } => {
                top.text.push_str(text);
                if cdata {
                    top.verbatim = true;
                }
                if *kind == ScalarKind::String {
                    // Streaming strings: mirror the accumulator so partial
                    // views see text as it arrives.
                    *top.handle.borrow_mut() = Value::Str(top.text.clone());
                }
            }
            FrameKind::ScalarUnion { .. } | FrameKind::Loose | FrameKind::UnionFrame { .. } => {
                top.text.push_str(text);
                if cdata {
                    top.verbatim = true;
                }
            }
            _ => {
                // Containers and records discard whitespace between
                // children; anything else is stray prose.
                if !text.trim().is_empty() {
                    trace!("discarding stray text in {} frame", top.kind.name());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // End handling
    // ------------------------------------------------------------------

    fn on_end(&mut self, name: &str, span: Span) {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }
        let Some(top) = self.stack.last() else {
            trace!("stray end tag </{name}> with no open element");
            return;
        };
        if top.name != name {
            // Accept the wire name of the matching field as well: end tags
            // mirror whatever spelling the start tag used, so a mismatch
            // here is a stray close.
            trace!("mismatched </{name}> while <{}> is open", top.name);
            return;
        }
        self.seal_top(span, true);
    }

    /// Seal the top frame, hand its value to the parent, and propagate
    /// completion.
    fn seal_top(&mut self, span: Span, may_complete: bool) {
        let frame = self.stack.pop().expect("seal with empty stack");
        let sealed = self.finish_frame(frame, span);

        if let Some((frame, handle)) = sealed {
            self.attach(&frame, handle, span);
        }

        // An implicit wrapper seals together with its only child.
        if self
            .stack
            .last()
            .map(|f| f.implicit)
            .unwrap_or(false)
        {
            self.seal_top(span, may_complete);
            return;
        }

        if self.stack.is_empty() {
            if may_complete {
                self.complete = true;
                debug!("root sealed; parse complete");
            } else {
                debug!("self-closing root sealed; parse not marked complete");
            }
        }
    }

    /// Finalize a frame's value. Returns None when the value failed to
    /// materialize and the parent slot must stay at its default.
    fn finish_frame(&mut self, frame: Frame, span: Span) -> Option<(Frame, Handle)> {
        let handle = Rc::clone(&frame.handle);
        match &frame.kind {
            FrameKind::Scalar { kind } => {
                match coerce_scalar(*kind, &frame.text, frame.verbatim) {
                    Ok(value) => {
                        *handle.borrow_mut() = value;
                    }
                    Err(message) => {
                        let path = self.path_of(&frame);
                        self.diagnostics.push(Diagnostic::new(
                            DiagnosticKind::Coercion,
                            message,
                            span,
                            path,
                        ));
                        return None;
                    }
                }
            }
            FrameKind::ScalarUnion {
                kinds,
                null_default,
            } => {
                let trimmed = frame.text.trim();
                if trimmed.is_empty() && *null_default {
                    *handle.borrow_mut() = Value::Null;
                } else {
                    match coerce_first(kinds, &frame.text, frame.verbatim) {
                        Some(value) => *handle.borrow_mut() = value,
                        None => {
                            let path = self.path_of(&frame);
                            self.diagnostics.push(Diagnostic::new(
                                DiagnosticKind::Coercion,
                                format!("{trimmed:?} fits no union variant"),
                                span,
                                path,
                            ));
                            return None;
                        }
                    }
                }
            }
            FrameKind::TupleFrame {
                elems,
                variadic,
                next,
            } => {
                if !*variadic && *next < elems.len() {
                    let path = self.path_of(&frame);
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::Arity,
                        format!(
                            "tuple received {} of {} declared element(s)",
                            next,
                            elems.len()
                        ),
                        span,
                        path,
                    ));
                }
                builder::finalize(&handle);
            }
            FrameKind::Sequence { .. }
            | FrameKind::SetFrame { .. }
            | FrameKind::MappingFrame { .. } => {
                builder::finalize(&handle);
            }
            FrameKind::RecordFrame { .. } => {}
            FrameKind::UnionFrame {
                records,
                scalars,
                null_default,
                observed,
            } => {
                if observed.is_empty() {
                    let trimmed = frame.text.trim();
                    if trimmed.is_empty() && *null_default {
                        *handle.borrow_mut() = Value::Null;
                    } else if !scalars.is_empty() {
                        match coerce_first(scalars, &frame.text, frame.verbatim) {
                            Some(value) => *handle.borrow_mut() = value,
                            None => {
                                let path = self.path_of(&frame);
                                self.diagnostics.push(Diagnostic::new(
                                    DiagnosticKind::Coercion,
                                    format!("{trimmed:?} fits no union variant"),
                                    span,
                                    path,
                                ));
                                return None;
                            }
                        }
                    }
                    // No children, no scalar variants: an empty record of
                    // an undecided variant stays loose.
                } else {
                    let names: Vec<String> =
                        observed.iter().map(|(n, _)| n.clone()).collect();
                    let chosen = records.iter().find(|r| r.covers_fields(&names));
                    match chosen {
                        Some(rec) => {
                            // Rebuild the loose cursor as the winning
                            // variant: defaults first, observed fields
                            // overlaid under their declared names.
                            let rebuilt = builder::new_record(rec);
                            if let Value::Record(rv) = &mut *rebuilt.borrow_mut() {
                                for (wire, value) in observed.iter() {
                                    let declared = rec
                                        .field(wire)
                                        .map(|f| f.name.as_str())
                                        .unwrap_or(wire.as_str());
                                    rv.set(declared, Rc::clone(value));
                                }
                            }
                            let rebuilt_value = rebuilt.borrow().clone();
                            *handle.borrow_mut() = rebuilt_value;
                        }
                        None => {
                            let path = self.path_of(&frame);
                            self.diagnostics.push(Diagnostic::new(
                                DiagnosticKind::UnresolvedType,
                                "no union variant covers the observed fields; \
                                 keeping a loosely-typed record"
                                    .to_string(),
                                span,
                                path,
                            ));
                        }
                    }
                }
            }
            FrameKind::Loose => {
                let is_unset = handle.borrow().is_null();
                if is_unset {
                    let trimmed = frame.text.trim();
                    if !trimmed.is_empty() {
                        *handle.borrow_mut() = Value::Str(trimmed.to_string());
                    }
                }
            }
        }
        Some((frame, handle))
    }

    /// Hand a sealed value to the parent frame's cursor.
    fn attach(&mut self, frame: &Frame, handle: Handle, span: Span) {
        let Some(parent) = self.stack.last_mut() else {
            return;
        };
        let parent_is_loose = matches!(parent.kind, FrameKind::Loose);

        match &mut parent.kind {
            FrameKind::RecordFrame { .. } | FrameKind::Loose => {
                let slot = frame
                    .parent_slot
                    .clone()
                    .unwrap_or_else(|| frame.name.clone());
                if parent_is_loose {
                    builder::promote_loose_record(&parent.handle, &parent.name);
                }
                builder::set_field(&parent.handle, &slot, handle, &mut parent.populated);
            }
            FrameKind::UnionFrame { observed, .. } => {
                let slot = frame
                    .parent_slot
                    .clone()
                    .unwrap_or_else(|| frame.name.clone());
                // Keep the loose cursor current so partial views track the
                // fields sealed so far.
                builder::promote_loose_record(&parent.handle, &parent.name);
                if let Value::Record(rv) = &mut *parent.handle.borrow_mut() {
                    rv.set(&slot, Rc::clone(&handle));
                }
                observed.push((slot, handle));
            }
            FrameKind::Sequence { .. } => builder::append(&parent.handle, handle),
            FrameKind::SetFrame { .. } => {
                builder::add(&parent.handle, handle);
            }
            FrameKind::MappingFrame { .. } => match &frame.map_key {
                Some(key) => builder::insert(&parent.handle, key, handle),
                None => {
                    let path = self.path_of(frame);
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::Arity,
                        "mapping item sealed without a key".to_string(),
                        span,
                        path,
                    ));
                }
            },
            FrameKind::TupleFrame { variadic, .. } => {
                if *variadic {
                    builder::tuple_push(&parent.handle, handle);
                } else if let Some(index) = frame.tuple_index {
                    builder::tuple_set(&parent.handle, index, handle);
                }
            }
            FrameKind::Scalar { .. } | FrameKind::ScalarUnion { .. } => {
                trace!("discarding child of scalar frame");
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame construction
    // ------------------------------------------------------------------

    /// Build a frame for a resolved schema. When `reuse` is given (the
    /// root), its handle is re-initialized in place so views keep their
    /// reference.
    fn make_frame(
        &mut self,
        schema: SchemaNode,
        name: &str,
        attrs: &AttrList,
        reuse: Option<Handle>,
    ) -> Frame {
        let schema = resolve_schema(&schema, self.provider.as_ref());

        match schema {
            SchemaNode::Scalar(kind) => {
                let handle = install(&reuse, builder::empty_value(&SchemaNode::Scalar(kind)));
                Frame::new(name.to_string(), FrameKind::Scalar { kind }, handle)
            }
            SchemaNode::Sequence(elem) => {
                let handle = install(&reuse, builder::empty_value(&SchemaNode::Sequence(elem.clone())));
                Frame::new(
                    name.to_string(),
                    FrameKind::Sequence { elem: *elem },
                    handle,
                )
            }
            SchemaNode::Set(elem) => {
                let handle = install(&reuse, builder::empty_value(&SchemaNode::Set(elem.clone())));
                Frame::new(name.to_string(), FrameKind::SetFrame { elem: *elem }, handle)
            }
            SchemaNode::Mapping { key, value } => {
                let handle = install(
                    &reuse,
                    builder::empty_value(&SchemaNode::Mapping {
                        key,
                        value: value.clone(),
                    }),
                );
                Frame::new(
                    name.to_string(),
                    FrameKind::MappingFrame { value: *value },
                    handle,
                )
            }
            SchemaNode::Tuple { elems, variadic } => {
                let container = builder::new_container(&SchemaNode::Tuple {
                    elems: elems.clone(),
                    variadic,
                });
                let handle = match reuse {
                    Some(h) => {
                        let initial = container.borrow().clone();
                        *h.borrow_mut() = initial;
                        h
                    }
                    None => container,
                };
                Frame::new(
                    name.to_string(),
                    FrameKind::TupleFrame {
                        elems,
                        variadic,
                        next: 0,
                    },
                    handle,
                )
            }
            SchemaNode::Record(rec) => {
                let template = builder::new_record(&rec);
                let handle = match reuse {
                    Some(h) => {
                        let initial = template.borrow().clone();
                        *h.borrow_mut() = initial;
                        h
                    }
                    None => template,
                };
                Frame::new(
                    name.to_string(),
                    FrameKind::RecordFrame { schema: rec },
                    handle,
                )
            }
            SchemaNode::Union {
                variants,
                null_default,
            } => self.union_frame(variants, null_default, name, attrs, reuse),
            SchemaNode::Any | SchemaNode::Ref(_) => {
                // An unresolvable reference parses loosely, like Any.
                let handle = install(&reuse, Value::Null);
                Frame::new(name.to_string(), FrameKind::Loose, handle)
            }
        }
    }

    /// Resolve a union frame through the three-level discriminator.
    fn union_frame(
        &mut self,
        variants: Vec<SchemaNode>,
        null_default: bool,
        name: &str,
        attrs: &AttrList,
        reuse: Option<Handle>,
    ) -> Frame {
        let resolved: Vec<SchemaNode> = variants
            .iter()
            .map(|v| resolve_schema(v, self.provider.as_ref()))
            .collect();

        // Explicit: the type attribute names a variant (or a full node
        // such as a parameterized container).
        if let Some(expr) = attrs.get("type") {
            if let Some(parsed) = self.parse_type_attr(expr) {
                if let Some(variant) = resolved
                    .iter()
                    .find(|v| v.kind_name() == parsed.kind_name())
                    .cloned()
                {
                    debug!("union resolved explicitly to {}", variant.kind_name());
                    return self.make_frame(variant, name, &AttrList::new(), reuse);
                }
                debug!("union following wire type {}", parsed.kind_name());
                return self.make_frame(parsed, name, &AttrList::new(), reuse);
            }
        }

        // Nominal: the tag's own name matches a variant.
        if let Some(idx) = self.provider.resolve_variant(&resolved, name) {
            debug!("union resolved nominally to variant {idx}");
            return self.make_frame(resolved[idx].clone(), name, &AttrList::new(), reuse);
        }
        if let Some(variant) = resolved
            .iter()
            .find(|v| matches_nominal(v, name))
            .cloned()
        {
            return self.make_frame(variant, name, &AttrList::new(), reuse);
        }

        // Count the live shapes before committing to a structural frame.
        let records: Vec<Rc<RecordSchema>> = resolved
            .iter()
            .filter_map(|v| match v {
                SchemaNode::Record(r) => Some(Rc::clone(r)),
                _ => None,
            })
            .collect();
        let scalars: Vec<ScalarKind> = resolved
            .iter()
            .filter_map(|v| match v {
                SchemaNode::Scalar(k) if *k != ScalarKind::Null => Some(*k),
                _ => None,
            })
            .collect();

        // A union with a single live variant (the optional-field shape)
        // binds directly. Scalars keep the union frame so empty content
        // can fall back to null instead of failing coercion.
        let live: Vec<&SchemaNode> = resolved
            .iter()
            .filter(|v| !matches!(v, SchemaNode::Scalar(ScalarKind::Null)))
            .collect();
        if live.len() == 1 && !matches!(live[0], SchemaNode::Scalar(_)) {
            let only = live[0].clone();
            return self.make_frame(only, name, attrs, reuse);
        }

        if records.is_empty() {
            let handle = install(&reuse, Value::Null);
            return Frame::new(
                name.to_string(),
                FrameKind::ScalarUnion {
                    kinds: scalars,
                    null_default,
                },
                handle,
            );
        }

        // Structural: stay undecided until fields arrive.
        debug!("union structurally undecided among {} record variant(s)", records.len());
        let handle = install(&reuse, Value::Null);
        Frame::new(
            name.to_string(),
            FrameKind::UnionFrame {
                records,
                scalars,
                null_default,
                observed: Vec::new(),
            },
            handle,
        )
    }

    /// Refine a declared schema with the advisory `type="…"` attribute.
    /// The declaration stays authoritative: the attribute only narrows
    /// unions, replaces `Any`, and sharpens container element types.
    fn refine(&mut self, declared: &SchemaNode, attrs: &AttrList) -> SchemaNode {
        let declared = resolve_schema(declared, self.provider.as_ref());
        let Some(expr) = attrs.get("type") else {
            return declared;
        };
        let Some(parsed) = self.parse_type_attr(expr) else {
            return declared;
        };

        match &declared {
            SchemaNode::Any => parsed,
            SchemaNode::Union { .. } => declared,
            SchemaNode::Sequence(_) if matches!(parsed, SchemaNode::Sequence(_)) => parsed,
            SchemaNode::Set(_) if matches!(parsed, SchemaNode::Set(_)) => parsed,
            SchemaNode::Mapping { .. } if matches!(parsed, SchemaNode::Mapping { .. }) => parsed,
            SchemaNode::Tuple { .. } if matches!(parsed, SchemaNode::Tuple { .. }) => parsed,
            _ => declared,
        }
    }

    /// Parse a type expression through the LRU cache.
    fn parse_type_attr(&mut self, expr: &str) -> Option<SchemaNode> {
        if let Some(cached) = self.cache.get(expr) {
            return cached.clone();
        }
        let parsed = crate::schema::typeexpr::parse_type_expr(expr, self.provider.as_ref());
        self.cache.put(expr.to_string(), parsed.clone());
        parsed
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    fn diagnose(&mut self, kind: DiagnosticKind, message: impl Into<String>, span: Span) {
        let message = message.into();
        if self.strict && matches!(kind, DiagnosticKind::UnexpectedTag) {
            self.fatal = Some(ParseError::Strict(message));
            return;
        }
        let path = self.current_path();
        debug!("diagnostic {kind:?}: {message}");
        self.diagnostics.push(Diagnostic::new(kind, message, span, path));
    }

    /// Dotted path of the open stack, e.g. `Outer.middles.inner`.
    fn current_path(&self) -> String {
        let mut path = String::new();
        for frame in &self.stack {
            self.push_segment(&mut path, frame);
        }
        path
    }

    fn path_of(&self, frame: &Frame) -> String {
        let mut path = self.current_path();
        self.push_segment(&mut path, frame);
        path
    }

    fn push_segment(&self, path: &mut String, frame: &Frame) {
        let segment = frame.parent_slot.as_deref().unwrap_or(&frame.name);
        if let Some(key) = &frame.map_key {
            path.push_str(&format!("[{key:?}]"));
            return;
        }
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(segment);
    }
}

/// Initialize a frame handle, reusing the root handle in place when given
/// so views keep their reference.
fn install(reuse: &Option<Handle>, initial: Value) -> Handle {
    match reuse {
        Some(h) => {
            *h.borrow_mut() = initial;
            Rc::clone(h)
        }
        None => initial.into_handle(),
    }
}

/// Nominal match of an element name against one union variant.
fn matches_nominal(variant: &SchemaNode, name: &str) -> bool {
    match variant {
        SchemaNode::Record(r) => r.name == name,
        SchemaNode::Scalar(kind) => ScalarKind::from_name(name) == Some(*kind),
        SchemaNode::Sequence(_) => name == "list",
        SchemaNode::Mapping { .. } => name == "dict",
        SchemaNode::Set(_) => name == "set",
        SchemaNode::Tuple { .. } => name == "tuple",
        _ => false,
    }
}

/// The value a partial view shows before the root element opens: always a
/// valid, empty instance of the schema's kind.
fn initial_root_value(schema: &SchemaNode, provider: &dyn SchemaProvider) -> Value {
    match schema {
        SchemaNode::Record(rec) => {
            let handle = builder::new_record(rec);
            let value = handle.borrow().clone();
            value
        }
        SchemaNode::Ref(name) => match provider.describe(name) {
            Some(resolved) => initial_root_value(&resolved, provider),
            None => Value::Null,
        },
        other => builder::empty_value(other),
    }
}
