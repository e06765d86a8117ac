//! tagstream - incremental, type-directed parsing of LLM output
//!
//! Converts a stream of characters — arriving in arbitrarily small,
//! arbitrarily split chunks — into live, progressively populated instances
//! of declared data types. Partial results are observable as soon as any
//! field can be materialized; the final value is available when the
//! top-level element closes.
//!
//! Pipeline:
//!
//! ```text
//! bytes -> Tokenizer -> TagEvents -> Machine (consults SchemaNode,
//!          drives the object builder) -> PartialView / final Value
//! ```
//!
//! ## Example
//!
//! ```
//! use std::rc::Rc;
//! use tagstream::{Parser, RecordSchema, SchemaNode, SchemaRegistry};
//!
//! let mut registry = SchemaRegistry::new();
//! registry.register_record(
//!     RecordSchema::builder("Person")
//!         .field("name", SchemaNode::string())
//!         .field("age", SchemaNode::integer())
//!         .build(),
//! );
//!
//! let mut parser = Parser::new(SchemaNode::Ref("Person".into()), Rc::new(registry));
//!
//! // Chunks may split anywhere: mid-tag, mid-entity, mid-attribute.
//! parser.feed("<think>reasoning to discard</think><Per").unwrap();
//! parser.feed("son><name>Ada</na").unwrap();
//! let view = parser.feed("me><age>36</age></Person>").unwrap();
//!
//! assert!(view.is_complete());
//! let value = parser.finalize().unwrap();
//! assert_eq!(value.get("name").unwrap().as_str(), Some("Ada"));
//! assert_eq!(value.get("age").unwrap().as_int(), Some(36));
//! ```

pub mod builder;
pub mod core;
pub mod error;
pub mod events;
pub mod machine;
pub mod parser;
pub mod schema;
pub mod value;

pub use error::{Diagnostic, DiagnosticKind, ParseError};
pub use events::{Attr, AttrList, Span, TagEvent};
pub use parser::{Parser, ParserOptions, PartialView, DEFAULT_IGNORED_TAGS};
pub use schema::{
    Field, RecordBuilder, RecordSchema, ScalarKind, SchemaNode, SchemaProvider, SchemaRegistry,
};
pub use value::{Handle, RecordValue, Value};
