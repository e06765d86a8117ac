//! Error and diagnostic types
//!
//! Two severity tiers, matching how failures propagate:
//! - `Diagnostic`: recovered locally, accumulated on the parser and exposed
//!   through the partial view without affecting parse state.
//! - `ParseError`: structural failures surfaced to the caller as `Err`
//!   values. The engine never panics on malformed input.

use crate::events::Span;

/// Category of a recovered diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Malformed markup: unterminated tag, mismatched quote.
    Scanner,
    /// A start tag could not be mapped to any field, item, or variant.
    UnexpectedTag,
    /// Scalar text could not be converted to the target kind.
    Coercion,
    /// Tuple arity mismatch, or a mapping item without a `key` attribute.
    Arity,
    /// A `type="…"` expression did not resolve to a known schema.
    UnresolvedType,
}

/// A recovered, non-fatal problem with position and frame context.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Span,
    /// Dotted path of the frame the problem occurred in, e.g.
    /// `Outer.middles[2].inner`. Empty at top level.
    pub path: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, span: Span, path: String) -> Self {
        Diagnostic {
            kind,
            message: message.into(),
            span,
            path,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{:?} at byte {}: {}", self.kind, self.span.start, self.message)
        } else {
            write!(
                f,
                "{:?} at byte {} in {}: {}",
                self.kind, self.span.start, self.path, self.message
            )
        }
    }
}

/// Fatal parse failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    /// Nesting depth exceeded the configured `max_depth`.
    #[error("nesting depth exceeded the configured maximum of {0}")]
    DepthExceeded(usize),

    /// `finalize` was called while elements are still open. The parser
    /// stays usable: more input can be fed and `finalize` retried.
    #[error("input ended with {open} unclosed element(s)")]
    IncompleteInput { open: usize },

    /// Strict mode turned a recoverable diagnostic into a failure.
    #[error("strict mode: {0}")]
    Strict(String),
}
