//! Tag-Event Stream
//!
//! High-level events produced by the tokenizer and consumed by the typed
//! state machine. Events own their data: the tokenizer's internal buffer is
//! drained between chunks, so borrowed slices cannot outlive a `feed` call.

/// Byte range into the overall chunk stream, for diagnostics.
///
/// Offsets are global: they keep counting across `feed` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline]
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A single parsed attribute.
///
/// Values have entities decoded. Attribute order matches document order;
/// duplicate names are collapsed to the last occurrence before the event
/// is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub value: String,
}

/// An ordered attribute list with last-wins duplicate handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrList(Vec<Attr>);

impl AttrList {
    pub fn new() -> Self {
        AttrList(Vec::new())
    }

    /// Insert an attribute, replacing any earlier one with the same name
    /// while keeping its original position.
    pub fn push(&mut self, name: String, value: String) {
        if let Some(existing) = self.0.iter_mut().find(|a| a.name == name) {
            existing.value = value;
        } else {
            self.0.push(Attr { name, value });
        }
    }

    /// Look up an attribute value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A tag event.
///
/// `Start` with `self_closing` set stands for the whole element: no
/// matching `End` event follows it.
#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
    Start {
        name: String,
        attrs: AttrList,
        self_closing: bool,
        span: Span,
    },
    End {
        name: String,
        span: Span,
    },
    /// Character data with entities already decoded. A single text node may
    /// arrive as several consecutive `Text` events when it spans chunks.
    Text {
        text: String,
        span: Span,
    },
    /// CDATA content, verbatim. Like `Text`, may arrive in several pieces.
    CData {
        text: String,
        span: Span,
    },
    /// Malformed markup the tokenizer recovered from.
    Error {
        message: String,
        span: Span,
    },
}

impl TagEvent {
    /// The span covered by this event.
    pub fn span(&self) -> Span {
        match self {
            TagEvent::Start { span, .. }
            | TagEvent::End { span, .. }
            | TagEvent::Text { span, .. }
            | TagEvent::CData { span, .. }
            | TagEvent::Error { span, .. } => *span,
        }
    }
}
