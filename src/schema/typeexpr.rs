//! Type-expression parser
//!
//! Parses the advisory `type="…"` attribute grammar:
//!
//! ```text
//! expr  := term ('|' term)*
//! term  := Name ('[' expr (',' expr)* ']')?
//! ```
//!
//! plus `...` as the final argument of a tuple instantiation. Names resolve
//! through the built-in table first (scalars, container synonyms), then the
//! schema provider (record types). Parsing is cheap but models repeat the
//! same expressions on every item tag, so callers keep results in an LRU
//! cache keyed by the raw attribute string.

use super::{builtin_schema, SchemaNode, SchemaProvider};

/// Type-expression token
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    LeftBracket,  // [
    RightBracket, // ]
    Comma,        // ,
    Pipe,         // |
    Ellipsis,     // ...
    Eof,
}

/// Tokenize a type expression. Returns None on a character that cannot
/// appear in the grammar.
fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'[' => {
                tokens.push(Token::LeftBracket);
                pos += 1;
            }
            b']' => {
                tokens.push(Token::RightBracket);
                pos += 1;
            }
            b',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            b'|' => {
                tokens.push(Token::Pipe);
                pos += 1;
            }
            b'.' => {
                if bytes[pos..].starts_with(b"...") {
                    tokens.push(Token::Ellipsis);
                    pos += 3;
                } else {
                    return None;
                }
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push(Token::Name(input[start..pos].to_string()));
            }
            _ => return None,
        }
    }
    tokens.push(Token::Eof);
    Some(tokens)
}

/// Recursive descent parser over the token list.
struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    provider: &'a dyn SchemaProvider,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// expr := term ('|' term)*
    fn parse_union(&mut self) -> Option<SchemaNode> {
        let first = self.parse_term()?;
        if *self.peek() != Token::Pipe {
            return Some(first);
        }

        let mut variants = vec![first];
        while self.eat(&Token::Pipe) {
            variants.push(self.parse_term()?);
        }
        Some(SchemaNode::union(variants))
    }

    /// term := Name ('[' expr (',' expr)* ']')?
    fn parse_term(&mut self) -> Option<SchemaNode> {
        let name = match self.bump() {
            Token::Name(name) => name,
            _ => return None,
        };

        if !self.eat(&Token::LeftBracket) {
            return self.resolve_bare(&name);
        }

        let mut args = Vec::new();
        let mut variadic = false;
        loop {
            if self.eat(&Token::Ellipsis) {
                variadic = true;
            } else {
                args.push(self.parse_union()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        if !self.eat(&Token::RightBracket) {
            return None;
        }

        self.instantiate(&name, args, variadic)
    }

    /// Resolve a name with no argument list.
    fn resolve_bare(&self, name: &str) -> Option<SchemaNode> {
        if let Some(node) = builtin_schema(name) {
            return Some(node);
        }
        self.provider.describe(name)
    }

    /// Instantiate a parameterized container or alias.
    fn instantiate(
        &self,
        name: &str,
        mut args: Vec<SchemaNode>,
        variadic: bool,
    ) -> Option<SchemaNode> {
        match name {
            "list" | "List" => {
                let elem = args.pop().unwrap_or(SchemaNode::Any);
                Some(SchemaNode::sequence(elem))
            }
            "set" | "Set" => {
                let elem = args.pop().unwrap_or(SchemaNode::Any);
                Some(SchemaNode::set(elem))
            }
            "dict" | "Dict" => {
                let value = args.pop().unwrap_or(SchemaNode::Any);
                let key = args.pop().unwrap_or_else(SchemaNode::string);
                Some(SchemaNode::mapping(key, value))
            }
            "tuple" | "Tuple" => {
                if variadic {
                    let elem = args.pop().unwrap_or(SchemaNode::Any);
                    Some(SchemaNode::variadic_tuple(elem))
                } else {
                    Some(SchemaNode::tuple(args))
                }
            }
            "Optional" | "optional" => {
                let inner = args.pop().unwrap_or(SchemaNode::Any);
                Some(SchemaNode::optional(inner))
            }
            "Union" | "union" => Some(SchemaNode::union(args)),
            // A parameterized record name: parameters carry no meaning for
            // the parse layer, the record's own field table governs.
            _ => self.resolve_bare(name),
        }
    }
}

/// Parse a type expression against a provider. Returns None when the
/// expression is malformed or names an unknown type.
pub fn parse_type_expr(input: &str, provider: &dyn SchemaProvider) -> Option<SchemaNode> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        provider,
    };
    let node = parser.parse_union()?;
    if *parser.peek() != Token::Eof {
        return None;
    }
    Some(node)
}
