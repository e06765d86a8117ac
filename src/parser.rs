//! Engine API
//!
//! `Parser` wires the tokenizer to the state machine and exposes the
//! partial-view contract: feed chunks of any size, observe the live root
//! value between chunks, finalize when the top-level element closes.
//!
//! A parser instance is a single-threaded, cooperative consumer: `feed`
//! runs to completion on its input and returns; there are no internal
//! yield points, timers, or background tasks. Dropping the parser releases
//! every engine-owned buffer; values already handed out stay valid.

use crate::core::tokenizer::Tokenizer;
use crate::error::{Diagnostic, ParseError};
use crate::machine::Machine;
use crate::schema::{SchemaNode, SchemaProvider, SchemaRegistry};
use crate::value::{Handle, Value};
use std::rc::Rc;

/// Tag names discarded by default: the reasoning preambles models wrap
/// around their actual output.
pub const DEFAULT_IGNORED_TAGS: [&str; 3] = ["think", "thinking", "system"];

/// Construction options.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Tag names whose subtrees are discarded before any frame is
    /// created. Replace with an empty vector to disable filtering.
    pub ignored_tags: Vec<String>,
    /// Fail the parse on unexpected tags instead of skipping them.
    pub strict: bool,
    /// Maximum element nesting depth before the parse aborts.
    pub max_depth: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            ignored_tags: DEFAULT_IGNORED_TAGS.iter().map(|s| s.to_string()).collect(),
            strict: false,
            max_depth: 128,
        }
    }
}

/// A live view of the parse between chunks.
///
/// The value handle is the same object on every call: observing it never
/// copies, and values seen through it update in place as input arrives.
#[derive(Debug)]
pub struct PartialView<'a> {
    root: Handle,
    diagnostics: &'a [Diagnostic],
    complete: bool,
    open: Vec<Handle>,
}

impl PartialView<'_> {
    /// The root value handle. Always a valid instance of the schema's
    /// kind: containers hold the children sealed so far, records hold
    /// defaults for fields that have not arrived.
    pub fn value(&self) -> Handle {
        Rc::clone(&self.root)
    }

    /// Owned snapshot of the current root value.
    pub fn snapshot(&self) -> Value {
        self.root.borrow().clone()
    }

    /// Diagnostics recovered so far, in discovery order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics
    }

    /// Whether the top-level element has closed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Handles of the elements still open, outermost first. The trailing
    /// entries expose the in-progress element a container has not sealed
    /// yet — its fields populate here as they close.
    pub fn open_elements(&self) -> &[Handle] {
        &self.open
    }
}

/// Incremental, type-directed parser for one top-level value.
pub struct Parser {
    tokenizer: Tokenizer,
    machine: Machine,
}

impl Parser {
    /// Create a parser with default options.
    pub fn new(schema: SchemaNode, provider: Rc<dyn SchemaProvider>) -> Self {
        Self::with_options(schema, provider, ParserOptions::default())
    }

    /// Create a parser with explicit options.
    pub fn with_options(
        schema: SchemaNode,
        provider: Rc<dyn SchemaProvider>,
        options: ParserOptions,
    ) -> Self {
        Parser {
            tokenizer: Tokenizer::new(options.ignored_tags),
            machine: Machine::new(schema, provider, options.strict, options.max_depth),
        }
    }

    /// Parser over a schema with no named types (scalars, containers,
    /// `Any`).
    pub fn untyped(schema: SchemaNode) -> Self {
        Self::new(schema, Rc::new(SchemaRegistry::new()))
    }

    /// Consume one chunk. Chunks may split anywhere, including mid-tag and
    /// mid-entity. Returns the partial view after the chunk, or the fatal
    /// error that stopped the parse.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Result<PartialView<'_>, ParseError> {
        for event in self.tokenizer.feed(chunk.as_ref()) {
            self.machine.apply(event);
        }
        if let Some(err) = self.machine.fatal() {
            return Err(err.clone());
        }
        Ok(self.partial())
    }

    /// The current best-known value. Idempotent and side-effect free; the
    /// same handle is returned on every call.
    pub fn partial(&self) -> PartialView<'_> {
        PartialView {
            root: self.machine.root_handle(),
            diagnostics: self.machine.diagnostics(),
            complete: self.machine.is_complete(),
            open: self.machine.open_handles(),
        }
    }

    /// Whether the top-level element has closed. Stays false for a
    /// self-closing root even though a value is available.
    pub fn is_complete(&self) -> bool {
        self.machine.is_complete()
    }

    /// Return the finished root value. Fails while elements are still
    /// open; the parser stays usable, so more input can be fed and the
    /// call retried.
    pub fn finalize(&self) -> Result<Value, ParseError> {
        if let Some(err) = self.machine.fatal() {
            return Err(err.clone());
        }
        let open = self.machine.open_depth();
        if open > 0 {
            return Err(ParseError::IncompleteInput { open });
        }
        Ok(Value::deep_clone(&self.machine.root_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RecordSchema, SchemaRegistry};
    use crate::value::Value;

    fn person_registry() -> Rc<SchemaRegistry> {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Person")
                .field("name", SchemaNode::string())
                .field("age", SchemaNode::integer())
                .build(),
        );
        Rc::new(reg)
    }

    fn feed_all(parser: &mut Parser, input: &str) {
        parser.feed(input).expect("feed failed");
    }

    // ------------------------------------------------------------------
    // Scalars
    // ------------------------------------------------------------------

    #[test]
    fn test_scalar_string_root() {
        let mut parser = Parser::untyped(SchemaNode::string());
        feed_all(&mut parser, "<str>Hello, world!</str>");
        assert!(parser.is_complete());
        assert_eq!(parser.finalize().unwrap(), Value::Str("Hello, world!".into()));
    }

    #[test]
    fn test_scalar_int_root_negative() {
        let mut parser = Parser::untyped(SchemaNode::integer());
        feed_all(&mut parser, "<int>-456</int>");
        assert_eq!(parser.finalize().unwrap(), Value::Int(-456));
    }

    #[test]
    fn test_scalar_streaming_string_partial() {
        let mut parser = Parser::untyped(SchemaNode::string());
        parser.feed("<str>Hello, ").unwrap();
        assert_eq!(
            parser.partial().snapshot(),
            Value::Str("Hello, ".into())
        );
        parser.feed("streaming world!").unwrap();
        parser.feed("</str>").unwrap();
        assert_eq!(
            parser.finalize().unwrap(),
            Value::Str("Hello, streaming world!".into())
        );
    }

    #[test]
    fn test_scalar_bool_forms() {
        for (text, expected) in [("true", true), ("True", true), ("1", true), ("0", false)] {
            let mut parser = Parser::untyped(SchemaNode::boolean());
            feed_all(&mut parser, &format!("<bool>{text}</bool>"));
            assert_eq!(parser.finalize().unwrap(), Value::Bool(expected));
        }
    }

    #[test]
    fn test_empty_string_element() {
        let mut parser = Parser::untyped(SchemaNode::string());
        feed_all(&mut parser, "<str></str>");
        assert_eq!(parser.finalize().unwrap(), Value::Str(String::new()));
    }

    #[test]
    fn test_string_alias_tag() {
        let mut parser = Parser::untyped(SchemaNode::string());
        feed_all(&mut parser, "<string>aliased</string>");
        assert_eq!(parser.finalize().unwrap(), Value::Str("aliased".into()));
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    #[test]
    fn test_record_fields_in_any_order() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        feed_all(
            &mut parser,
            "<Person><age type=\"int\">30</age><name type=\"str\">Ada</name></Person>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("name").unwrap().as_str(), Some("Ada"));
        assert_eq!(v.get("age").unwrap().as_int(), Some(30));
    }

    #[test]
    fn test_record_partial_defaults() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        parser.feed("<Person><name type=\"str\">Ada</name>").unwrap();

        let snapshot = parser.partial().snapshot();
        assert_eq!(snapshot.get("name").unwrap().as_str(), Some("Ada"));
        // Unpopulated field holds its kind-appropriate empty value
        assert_eq!(snapshot.get("age").unwrap().as_int(), Some(0));
        assert!(!parser.is_complete());
    }

    #[test]
    fn test_partial_view_identity_is_stable() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        let before = parser.partial().value();
        parser.feed("<Person><name>Ada</name></Person>").unwrap();
        let after = parser.partial().value();
        assert!(Rc::ptr_eq(&before, &after));
        assert_eq!(after.borrow().get("name").unwrap().as_str(), Some("Ada"));
    }

    #[test]
    fn test_field_without_type_attribute() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        feed_all(&mut parser, "<Person><name>Ada</name><age>36</age></Person>");
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("age").unwrap().as_int(), Some(36));
    }

    #[test]
    fn test_empty_record_seals_cleanly() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(RecordSchema::builder("Empty").build());
        let mut parser = Parser::new(SchemaNode::Ref("Empty".into()), Rc::new(reg));
        feed_all(&mut parser, "<Empty></Empty>");
        assert!(parser.is_complete());
        match parser.finalize().unwrap() {
            Value::Record(r) => assert!(r.fields.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_field_is_skipped_with_diagnostic() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        feed_all(
            &mut parser,
            "<Person><name>Ada</name><hobby><x>chess</x></hobby><age>36</age></Person>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("name").unwrap().as_str(), Some("Ada"));
        assert_eq!(v.get("age").unwrap().as_int(), Some(36));
        assert!(!parser.partial().diagnostics().is_empty());
    }

    #[test]
    fn test_strict_mode_fails_on_unexpected_tag() {
        let reg = person_registry();
        let mut parser = Parser::with_options(
            SchemaNode::Ref("Person".into()),
            reg,
            ParserOptions {
                strict: true,
                ..ParserOptions::default()
            },
        );
        let err = parser
            .feed("<Person><hobby>chess</hobby></Person>")
            .unwrap_err();
        assert!(matches!(err, ParseError::Strict(_)));
    }

    // ------------------------------------------------------------------
    // Sticky fields
    // ------------------------------------------------------------------

    #[test]
    fn test_sticky_nested_name() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Inner")
                .field("name", SchemaNode::string())
                .build(),
        );
        reg.register_record(
            RecordSchema::builder("Middle")
                .field("inner", SchemaNode::Ref("Inner".into()))
                .build(),
        );
        reg.register_record(
            RecordSchema::builder("Outer")
                .field("name", SchemaNode::string())
                .field(
                    "middles",
                    SchemaNode::sequence(SchemaNode::Ref("Middle".into())),
                )
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Outer".into()), Rc::new(reg));
        feed_all(
            &mut parser,
            "<Outer>\
               <name type=\"str\">O</name>\
               <middles type=\"list[Middle]\">\
                 <item type=\"Middle\">\
                   <inner type=\"Inner\"><name type=\"str\">I</name></inner>\
                 </item>\
               </middles>\
             </Outer>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("name").unwrap().as_str(), Some("O"));
        let middles = v.get("middles").unwrap();
        let inner = middles.index(0).unwrap().get("inner").unwrap();
        assert_eq!(inner.get("name").unwrap().as_str(), Some("I"));
    }

    #[test]
    fn test_duplicate_field_tag_is_sticky() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        feed_all(
            &mut parser,
            "<Person><name>first</name><name>second</name></Person>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("name").unwrap().as_str(), Some("first"));
    }

    // ------------------------------------------------------------------
    // Entities and CDATA
    // ------------------------------------------------------------------

    #[test]
    fn test_chunk_split_entity() {
        let mut parser = Parser::untyped(SchemaNode::string());
        for chunk in ["<str>", "&a", "m", "p;", "</str>"] {
            parser.feed(chunk).unwrap();
        }
        assert_eq!(parser.finalize().unwrap(), Value::Str("&".into()));
    }

    #[test]
    fn test_cdata_preserves_verbatim() {
        let mut parser = Parser::untyped(SchemaNode::string());
        feed_all(&mut parser, "<str><![CDATA[  <b>&amp;</b>  ]]></str>");
        assert_eq!(
            parser.finalize().unwrap(),
            Value::Str("  <b>&amp;</b>  ".into())
        );
    }

    #[test]
    fn test_text_is_trimmed_without_cdata() {
        let mut parser = Parser::untyped(SchemaNode::string());
        feed_all(&mut parser, "<str>  padded  </str>");
        assert_eq!(parser.finalize().unwrap(), Value::Str("padded".into()));
    }

    // ------------------------------------------------------------------
    // Ignored tags
    // ------------------------------------------------------------------

    #[test]
    fn test_ignored_subtree_with_same_name_nesting() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Root")
                .field("x", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Root".into()), Rc::new(reg));
        feed_all(
            &mut parser,
            "<think>\u{3b1}<think>\u{3b2}</think>\u{3b3}</think>\
             <Root><x type=\"str\">ok</x></Root>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("x").unwrap().as_str(), Some("ok"));
        assert!(parser.partial().diagnostics().is_empty());
    }

    #[test]
    fn test_custom_ignored_tags_replace_defaults() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Answer")
                .field("value", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::with_options(
            SchemaNode::Ref("Answer".into()),
            Rc::new(reg),
            ParserOptions {
                ignored_tags: vec!["DebugInfo".to_string()],
                ..ParserOptions::default()
            },
        );
        feed_all(
            &mut parser,
            "<DebugInfo><t>0.5</t></DebugInfo><Answer><value>42</value></Answer>",
        );
        assert_eq!(
            parser.finalize().unwrap().get("value").unwrap().as_str(),
            Some("42")
        );
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    #[test]
    fn test_list_of_ints() {
        let mut parser = Parser::untyped(SchemaNode::sequence(SchemaNode::integer()));
        feed_all(
            &mut parser,
            "<list><item>1</item><item>2</item><item>3</item></list>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(3));
        assert_eq!(v.index(2).unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_dict_with_keys() {
        let mut parser = Parser::untyped(SchemaNode::mapping(
            SchemaNode::string(),
            SchemaNode::integer(),
        ));
        feed_all(
            &mut parser,
            "<dict><item key=\"a\" type=\"int\">1</item><item key=\"b\">2</item></dict>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(2));
        assert_eq!(v.get("a").unwrap().as_int(), Some(1));
        assert_eq!(v.get("b").unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_dict_entry_tag_synonym() {
        // Any element name with a key attribute works as a mapping item.
        let mut parser = Parser::untyped(SchemaNode::mapping(
            SchemaNode::string(),
            SchemaNode::integer(),
        ));
        feed_all(
            &mut parser,
            "<dict><entry key=\"one\" type=\"int\">1</entry></dict>",
        );
        assert_eq!(
            parser.finalize().unwrap().get("one").unwrap().as_int(),
            Some(1)
        );
    }

    #[test]
    fn test_dict_duplicate_key_last_wins() {
        let mut parser = Parser::untyped(SchemaNode::mapping(
            SchemaNode::string(),
            SchemaNode::integer(),
        ));
        feed_all(
            &mut parser,
            "<dict><item key=\"a\">1</item><item key=\"a\">2</item></dict>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(1));
        assert_eq!(v.get("a").unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_dict_item_without_key_is_arity_error() {
        let mut parser = Parser::untyped(SchemaNode::mapping(
            SchemaNode::string(),
            SchemaNode::integer(),
        ));
        feed_all(
            &mut parser,
            "<dict><item>1</item><item key=\"b\">2</item></dict>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(1));
        assert!(parser
            .partial()
            .diagnostics()
            .iter()
            .any(|d| matches!(d.kind, crate::error::DiagnosticKind::Arity)));
    }

    #[test]
    fn test_set_deduplicates() {
        let mut parser = Parser::untyped(SchemaNode::set(SchemaNode::integer()));
        feed_all(
            &mut parser,
            "<set><item>1</item><item>2</item><item>1</item></set>",
        );
        assert_eq!(parser.finalize().unwrap().len(), Some(2));
    }

    #[test]
    fn test_fixed_tuple() {
        let mut parser = Parser::untyped(SchemaNode::tuple(vec![
            SchemaNode::string(),
            SchemaNode::integer(),
            SchemaNode::float(),
        ]));
        feed_all(
            &mut parser,
            "<tuple><item>hello</item><item>42</item><item>3.14</item></tuple>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.index(0).unwrap().as_str(), Some("hello"));
        assert_eq!(v.index(1).unwrap().as_int(), Some(42));
        assert_eq!(v.index(2).unwrap().as_float(), Some(3.14));
    }

    #[test]
    fn test_tuple_overflow_is_arity_error() {
        let mut parser = Parser::untyped(SchemaNode::tuple(vec![SchemaNode::integer()]));
        feed_all(&mut parser, "<tuple><item>1</item><item>2</item></tuple>");
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(1));
        assert!(parser
            .partial()
            .diagnostics()
            .iter()
            .any(|d| matches!(d.kind, crate::error::DiagnosticKind::Arity)));
    }

    #[test]
    fn test_variadic_tuple() {
        let mut parser = Parser::untyped(SchemaNode::variadic_tuple(SchemaNode::integer()));
        feed_all(
            &mut parser,
            "<tuple type=\"tuple[int, ...]\"><item>1</item><item>2</item><item>3</item></tuple>",
        );
        assert_eq!(parser.finalize().unwrap().len(), Some(3));
    }

    #[test]
    fn test_empty_containers_seal_cleanly() {
        let mut parser = Parser::untyped(SchemaNode::sequence(SchemaNode::Any));
        feed_all(&mut parser, "<list></list>");
        assert_eq!(parser.finalize().unwrap().len(), Some(0));

        let mut parser = Parser::untyped(SchemaNode::mapping(
            SchemaNode::string(),
            SchemaNode::Any,
        ));
        feed_all(&mut parser, "<dict></dict>");
        assert_eq!(parser.finalize().unwrap().len(), Some(0));
    }

    #[test]
    fn test_nested_lists() {
        let mut parser = Parser::untyped(SchemaNode::sequence(SchemaNode::sequence(
            SchemaNode::integer(),
        )));
        feed_all(
            &mut parser,
            "<list><item type=\"list[int]\"><item>1</item><item>2</item></item>\
             <item type=\"list[int]\"><item>3</item></item></list>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(2));
        assert_eq!(v.index(0).unwrap().len(), Some(2));
        assert_eq!(v.index(1).unwrap().index(0).unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_bare_element_coerced_to_sequence() {
        let reg = person_registry();
        let mut parser = Parser::new(
            SchemaNode::sequence(SchemaNode::Ref("Person".into())),
            reg,
        );
        feed_all(&mut parser, "<Person><name>Ada</name></Person>");
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(1));
        assert_eq!(v.index(0).unwrap().get("name").unwrap().as_str(), Some("Ada"));
    }

    // ------------------------------------------------------------------
    // Unions
    // ------------------------------------------------------------------

    fn chat_issue_registry() -> Rc<SchemaRegistry> {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Chat")
                .field("content", SchemaNode::string())
                .build(),
        );
        reg.register_record(
            RecordSchema::builder("Issue")
                .field("title", SchemaNode::string())
                .build(),
        );
        Rc::new(reg)
    }

    #[test]
    fn test_union_list_with_explicit_types() {
        let reg = chat_issue_registry();
        let union = SchemaNode::union(vec![
            SchemaNode::Ref("Chat".into()),
            SchemaNode::Ref("Issue".into()),
        ]);
        let mut parser = Parser::new(SchemaNode::sequence(union), reg);
        feed_all(
            &mut parser,
            "<list type=\"list[Chat|Issue]\">\
               <item type=\"Chat\"><content type=\"str\">hi</content></item>\
               <item type=\"Issue\"><title type=\"str\">t</title></item>\
             </list>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(2));
        match v.index(0).unwrap() {
            Value::Record(r) => {
                assert_eq!(r.name, "Chat");
                assert_eq!(r.get("content").unwrap().borrow().as_str(), Some("hi"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match v.index(1).unwrap() {
            Value::Record(r) => assert_eq!(r.name, "Issue"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_union_nominal_resolution_by_tag_name() {
        let reg = chat_issue_registry();
        let union = SchemaNode::union(vec![
            SchemaNode::Ref("Chat".into()),
            SchemaNode::Ref("Issue".into()),
        ]);
        let mut parser = Parser::new(SchemaNode::sequence(union), reg);
        feed_all(
            &mut parser,
            "<list><Chat><content>hi</content></Chat><Issue><title>t</title></Issue></list>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.len(), Some(2));
        match v.index(1).unwrap() {
            Value::Record(r) => assert_eq!(r.name, "Issue"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_union_structural_resolution() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Wrapper")
                .field(
                    "payload",
                    SchemaNode::union(vec![
                        SchemaNode::Ref("Chat".into()),
                        SchemaNode::Ref("Issue".into()),
                    ]),
                )
                .build(),
        );
        reg.register_record(
            RecordSchema::builder("Chat")
                .field("content", SchemaNode::string())
                .build(),
        );
        reg.register_record(
            RecordSchema::builder("Issue")
                .field("title", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Wrapper".into()), Rc::new(reg));
        // No type attribute and the field tag carries no variant name:
        // the observed field set decides.
        feed_all(
            &mut parser,
            "<Wrapper><payload><title>found</title></payload></Wrapper>",
        );
        let v = parser.finalize().unwrap();
        match v.get("payload").unwrap() {
            Value::Record(r) => {
                assert_eq!(r.name, "Issue");
                assert_eq!(r.get("title").unwrap().borrow().as_str(), Some("found"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_scalar_union_coerces_in_declaration_order() {
        let union = SchemaNode::union(vec![SchemaNode::integer(), SchemaNode::string()]);
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Holder")
                .field("v", union)
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Holder".into()), Rc::new(reg));
        feed_all(&mut parser, "<Holder><v>12</v></Holder>");
        assert_eq!(
            parser.finalize().unwrap().get("v").unwrap().as_int(),
            Some(12)
        );

        let union = SchemaNode::union(vec![SchemaNode::integer(), SchemaNode::string()]);
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Holder")
                .field("v", union)
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Holder".into()), Rc::new(reg));
        feed_all(&mut parser, "<Holder><v>twelve</v></Holder>");
        assert_eq!(
            parser.finalize().unwrap().get("v").unwrap().as_str(),
            Some("twelve")
        );
    }

    // ------------------------------------------------------------------
    // Optional fields
    // ------------------------------------------------------------------

    #[test]
    fn test_optional_container_field_omitted() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Project")
                .field("title", SchemaNode::string())
                .build(),
        );
        reg.register_record(
            RecordSchema::builder("Resume")
                .field("name", SchemaNode::string())
                .field(
                    "projects",
                    SchemaNode::optional(SchemaNode::sequence(SchemaNode::Ref(
                        "Project".into(),
                    ))),
                )
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Resume".into()), Rc::new(reg));
        feed_all(&mut parser, "<Resume><name>Ada</name></Resume>");
        let v = parser.finalize().unwrap();
        // The omitted optional stays null, not a spurious empty list
        assert!(v.get("projects").unwrap().is_null());
    }

    #[test]
    fn test_optional_field_present() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Holder")
                .field("note", SchemaNode::optional(SchemaNode::string()))
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Holder".into()), Rc::new(reg));
        feed_all(&mut parser, "<Holder><note>present</note></Holder>");
        assert_eq!(
            parser.finalize().unwrap().get("note").unwrap().as_str(),
            Some("present")
        );
    }

    #[test]
    fn test_optional_field_explicit_null() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Holder")
                .field("note", SchemaNode::optional(SchemaNode::string()))
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Holder".into()), Rc::new(reg));
        feed_all(&mut parser, "<Holder><note>null</note></Holder>");
        // A lone "null" against str|None coerces to the string "null" by
        // declaration order; absence is the way to express None.
        assert_eq!(
            parser.finalize().unwrap().get("note").unwrap().as_str(),
            Some("null")
        );
    }

    #[test]
    fn test_optional_self_closing_field_is_null() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Holder")
                .field("note", SchemaNode::optional(SchemaNode::integer()))
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Holder".into()), Rc::new(reg));
        feed_all(&mut parser, "<Holder><note/></Holder>");
        assert!(parser.finalize().unwrap().get("note").unwrap().is_null());
    }

    // ------------------------------------------------------------------
    // Incremental visibility
    // ------------------------------------------------------------------

    #[test]
    fn test_incremental_list_visibility_byte_by_byte() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Item")
                .field("step", SchemaNode::integer())
                .field("title", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::new(
            SchemaNode::sequence(SchemaNode::Ref("Item".into())),
            Rc::new(reg),
        );

        let input = "<list type=\"list[Item]\">\
                     <item type=\"Item\"><step>1</step><title>a</title></item>\
                     <item type=\"Item\"><step>2</step><title>b</title></item>\
                     </list>";
        let mut max_seen = 0usize;
        for byte in input.as_bytes() {
            let view = parser.feed(std::slice::from_ref(byte)).unwrap();
            let len = view.value().borrow().len().unwrap();
            // The list only ever grows, one sealed item at a time
            assert!(len >= max_seen && len <= max_seen + 1);
            max_seen = len.max(max_seen);

            // While an item is open, its sealed fields are observable
            // through the open-elements view.
            for open in view.open_elements() {
                let _ = open.borrow().len();
            }
        }
        assert_eq!(max_seen, 2);
        assert!(parser.is_complete());
    }

    #[test]
    fn test_in_progress_item_fields_visible() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Item")
                .field("step", SchemaNode::integer())
                .field("title", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::new(
            SchemaNode::sequence(SchemaNode::Ref("Item".into())),
            Rc::new(reg),
        );
        parser
            .feed("<list><item type=\"Item\"><step>7</step>")
            .unwrap();

        let view = parser.partial();
        // Not sealed: the list is still empty
        assert_eq!(view.value().borrow().len(), Some(0));
        // But the in-progress record is accessible with its sealed field
        let open = view.open_elements();
        let item = open.last().unwrap();
        assert_eq!(item.borrow().get("step").unwrap().as_int(), Some(7));
    }

    // ------------------------------------------------------------------
    // Self-closing root (documented quirk)
    // ------------------------------------------------------------------

    #[test]
    fn test_self_closing_root_value_but_not_complete() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        parser.feed("<Person/>").unwrap();
        assert!(!parser.is_complete());
        // A value is still available and finalize succeeds
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("name").unwrap().as_str(), Some(""));
    }

    // ------------------------------------------------------------------
    // Reserved-name renaming
    // ------------------------------------------------------------------

    #[test]
    fn test_reserved_field_name_wire_renaming() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Container")
                .field("item", SchemaNode::string())
                .field("name", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Container".into()), Rc::new(reg));
        feed_all(
            &mut parser,
            "<Container><_item>wired</_item><name>n</name></Container>",
        );
        let v = parser.finalize().unwrap();
        // Assignment targets the declared name
        assert_eq!(v.get("item").unwrap().as_str(), Some("wired"));
        assert!(v.get("_item").is_none());
    }

    #[test]
    fn test_reserved_field_declared_spelling_also_accepted() {
        let mut reg = SchemaRegistry::new();
        reg.register_record(
            RecordSchema::builder("Container")
                .field("type", SchemaNode::string())
                .build(),
        );
        let mut parser = Parser::new(SchemaNode::Ref("Container".into()), Rc::new(reg));
        feed_all(&mut parser, "<Container><type>direct</type></Container>");
        assert_eq!(
            parser.finalize().unwrap().get("type").unwrap().as_str(),
            Some("direct")
        );
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    #[test]
    fn test_coercion_failure_leaves_default() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        feed_all(
            &mut parser,
            "<Person><name>Ada</name><age>not a number</age></Person>",
        );
        let v = parser.finalize().unwrap();
        assert_eq!(v.get("age").unwrap().as_int(), Some(0));
        assert!(parser
            .partial()
            .diagnostics()
            .iter()
            .any(|d| matches!(d.kind, crate::error::DiagnosticKind::Coercion)));
    }

    #[test]
    fn test_finalize_with_open_stack_is_incomplete_and_retryable() {
        let reg = person_registry();
        let mut parser = Parser::new(SchemaNode::Ref("Person".into()), reg);
        parser.feed("<Person><name>Ada</name>").unwrap();
        assert!(matches!(
            parser.finalize(),
            Err(ParseError::IncompleteInput { open: 1 })
        ));
        // The parser stays usable
        parser.feed("</Person>").unwrap();
        assert!(parser.finalize().is_ok());
    }

    #[test]
    fn test_depth_limit_is_fatal() {
        let mut parser = Parser::with_options(
            SchemaNode::Any,
            Rc::new(SchemaRegistry::new()),
            ParserOptions {
                max_depth: 4,
                ..ParserOptions::default()
            },
        );
        let err = parser
            .feed("<a><b><c><d><e>deep</e></d></c></b></a>")
            .unwrap_err();
        assert!(matches!(err, ParseError::DepthExceeded(4)));
    }

    #[test]
    fn test_content_after_completion_is_ignored() {
        let mut parser = Parser::untyped(SchemaNode::string());
        feed_all(&mut parser, "<str>done</str><str>again</str>");
        assert_eq!(parser.finalize().unwrap(), Value::Str("done".into()));
    }

    // ------------------------------------------------------------------
    // Chunk independence
    // ------------------------------------------------------------------

    fn parse_person_list(chunks: &[&[u8]]) -> Value {
        let reg = person_registry();
        let mut parser = Parser::new(
            SchemaNode::sequence(SchemaNode::Ref("Person".into())),
            reg,
        );
        for c in chunks {
            parser.feed(c).expect("feed failed");
        }
        parser.finalize().expect("finalize failed")
    }

    const CORPUS: &str = "<think>let me <b>plan</b></think>\
        <list type=\"list[Person]\">\
        <item type=\"Person\"><name>A &amp; B</name><age>1</age></item>\
        <!-- interlude -->\
        <item type=\"Person\"><name><![CDATA[x <&> y]]></name><age>2</age></item>\
        </list>";

    #[test]
    fn test_single_byte_chunking_matches_one_shot() {
        let one_shot = parse_person_list(&[CORPUS.as_bytes()]);
        let bytes: Vec<&[u8]> = CORPUS
            .as_bytes()
            .chunks(1)
            .collect();
        let byte_wise = parse_person_list(&bytes);
        assert_eq!(one_shot, byte_wise);
    }

    #[test]
    fn test_various_chunk_sizes_match_one_shot() {
        let one_shot = parse_person_list(&[CORPUS.as_bytes()]);
        for size in [2, 3, 5, 7, 11, 13, 32] {
            let chunks: Vec<&[u8]> = CORPUS.as_bytes().chunks(size).collect();
            assert_eq!(one_shot, parse_person_list(&chunks), "chunk size {size}");
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_chunk_independence(cuts: Vec<usize>) -> bool {
        let bytes = CORPUS.as_bytes();
        // Turn arbitrary cut points into a partition of the corpus
        let mut points: Vec<usize> = cuts
            .into_iter()
            .map(|c| c % (bytes.len() + 1))
            .collect();
        points.sort_unstable();
        points.dedup();

        let mut chunks: Vec<&[u8]> = Vec::new();
        let mut prev = 0;
        for p in points {
            if p > prev {
                chunks.push(&bytes[prev..p]);
                prev = p;
            }
        }
        if prev < bytes.len() {
            chunks.push(&bytes[prev..]);
        }

        parse_person_list(&chunks) == parse_person_list(&[bytes])
    }
}
