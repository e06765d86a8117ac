//! Chunk-safe tokenizer
//!
//! Turns arbitrarily split byte chunks into tag events. The tokenizer owns
//! a carry buffer of unconsumed tail bytes; every `feed` appends the new
//! chunk and re-enters the saved state at the front of the buffer, so input
//! may be interrupted mid-tag, mid-attribute value, mid-entity, mid-CDATA
//! marker, or between `<` and the following name character.
//!
//! Text is emitted eagerly: as soon as bytes are known to be character
//! data they become `Text` events, except for a short held-back tail that
//! could still be the start of an entity reference or the remainder of a
//! multi-byte UTF-8 sequence.
//!
//! The tokenizer also owns the ignored-tag set. Subtrees rooted at an
//! ignored tag are consumed here, before any event exists: they cost one
//! name + depth counter and produce nothing downstream.

use super::attributes::parse_attributes;
use super::entities::{decode_text, partial_entity_start};
use super::scanner::{is_name_char, is_name_start_char, is_whitespace, Scanner};
use crate::events::{Span, TagEvent};
use log::{debug, trace};

/// Persistent cross-chunk scanning state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Default: scanning character data, looking for `<`.
    Text,
    /// Inside `<![CDATA[ … ]]>`.
    CData,
    /// Inside `<!-- … -->`.
    Comment,
    /// Inside `<? … ?>` (pi = true) or `<!DOCTYPE … >` (pi = false).
    Declaration { pi: bool },
}

/// Active ignored-tag skip region.
#[derive(Debug, Clone)]
struct SkipRegion {
    name: String,
    depth: usize,
}

/// Resumable tokenizer with a carry buffer.
pub struct Tokenizer {
    /// Unconsumed bytes carried between feeds.
    buf: Vec<u8>,
    /// Cursor into `buf` during a run; always 0 between feeds.
    pos: usize,
    /// Global offset of `buf[0]` in the overall stream.
    base: usize,
    state: State,
    /// Tag names whose subtrees are discarded before events exist.
    ignored: Vec<String>,
    skip: Option<SkipRegion>,
}

impl Tokenizer {
    /// Create a tokenizer with the given ignored-tag set.
    pub fn new(ignored: Vec<String>) -> Self {
        Tokenizer {
            buf: Vec::with_capacity(8192),
            pos: 0,
            base: 0,
            state: State::Text,
            ignored,
            skip: None,
        }
    }

    /// Feed one chunk and collect the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<TagEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let progressed = match self.state {
                State::Text => self.run_text(&mut events),
                State::CData => self.run_cdata(&mut events),
                State::Comment => self.run_comment(),
                State::Declaration { pi } => self.run_declaration(pi),
            };
            if !progressed {
                break;
            }
        }

        // Drop the consumed prefix; the rest carries to the next feed.
        self.base += self.pos;
        self.buf.drain(..self.pos);
        self.pos = 0;
        // Cap retained capacity so long-lived streams don't pin the
        // largest chunk ever seen.
        self.buf.shrink_to(8192);

        events
    }

    /// Whether unconsumed bytes are waiting for more input.
    pub fn has_pending(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Whether an ignored-tag skip region is still open.
    pub fn in_skip_region(&self) -> bool {
        self.skip.is_some()
    }

    #[inline]
    fn global(&self, start: usize, end: usize) -> Span {
        Span::new(self.base + start, self.base + end)
    }

    /// Scan character data up to the next `<`. Returns false when the
    /// buffer is exhausted and more input is needed.
    fn run_text(&mut self, events: &mut Vec<TagEvent>) -> bool {
        let start = self.pos;
        let scanner = {
            let mut s = Scanner::new(&self.buf);
            s.set_position(start);
            s
        };

        match scanner.find_tag_start() {
            Some(lt) => {
                if lt > start {
                    self.emit_text(start, lt, events);
                }
                self.pos = lt;
                self.begin_markup(events)
            }
            None => {
                // Whole tail is text. Hold back anything that could still
                // be the start of an entity or a split UTF-8 sequence.
                let tail = &self.buf[start..];
                let mut end = match partial_entity_start(tail) {
                    Some(amp) => start + amp,
                    None => self.buf.len(),
                };
                end -= utf8_incomplete_suffix(&self.buf[start..end]);
                if end > start {
                    self.emit_text(start, end, events);
                }
                self.pos = end;
                false
            }
        }
    }

    /// Classify the markup construct at `self.pos` (which is a `<`).
    /// Returns false when the construct is incomplete in this buffer.
    fn begin_markup(&mut self, events: &mut Vec<TagEvent>) -> bool {
        let rest = &self.buf[self.pos..];
        if rest.len() < 2 {
            return false;
        }

        match rest[1] {
            b'!' => {
                if rest.starts_with(b"<!--") {
                    self.pos += 4;
                    self.state = State::Comment;
                    return true;
                }
                if rest.starts_with(b"<![CDATA[") {
                    self.pos += 9;
                    self.state = State::CData;
                    return true;
                }
                if rest.starts_with(b"<!DOCTYPE") {
                    self.pos += 9;
                    self.state = State::Declaration { pi: false };
                    return true;
                }
                if is_marker_prefix(rest) {
                    return false;
                }
                self.recover(events, "malformed markup after \"<!\"");
                true
            }
            b'?' => {
                self.pos += 2;
                self.state = State::Declaration { pi: true };
                true
            }
            b'/' => self.scan_end_tag(events),
            c if is_name_start_char(c) => self.scan_start_tag(events),
            _ => {
                self.recover(events, "\"<\" not followed by a tag name");
                true
            }
        }
    }

    /// Scan a start tag. `self.pos` is at `<` and the next byte starts a
    /// name. Returns false when the closing `>` has not arrived yet.
    fn scan_start_tag(&mut self, events: &mut Vec<TagEvent>) -> bool {
        let open = self.pos;
        let mut scanner = Scanner::new(&self.buf);
        scanner.set_position(open);

        let gt = match scanner.find_tag_end_quoted() {
            Some(gt) => gt,
            None => return false,
        };

        scanner.set_position(open + 1);
        let name = match scanner.read_name() {
            Some(name) => String::from_utf8_lossy(name).into_owned(),
            None => {
                self.recover(events, "invalid element name");
                return true;
            }
        };
        let name_end = scanner.position();

        let self_closing = gt > open && self.buf[gt - 1] == b'/';
        let attr_end = if self_closing { gt - 1 } else { gt };
        let span = self.global(open, gt + 1);

        if let Some(region) = self.skip.as_mut() {
            if region.name == name && !self_closing {
                region.depth += 1;
                trace!("skip depth +1 inside <{}>: {}", region.name, region.depth);
            }
        } else if self.ignored.iter().any(|t| t == &name) {
            if !self_closing {
                debug!("entering ignored region <{name}>");
                self.skip = Some(SkipRegion { name, depth: 1 });
            }
            // A self-closing ignored tag is a no-op.
        } else {
            let attrs = if attr_end > name_end {
                parse_attributes(&self.buf[name_end..attr_end])
            } else {
                crate::events::AttrList::new()
            };
            events.push(TagEvent::Start {
                name,
                attrs,
                self_closing,
                span,
            });
        }

        self.pos = gt + 1;
        self.state = State::Text;
        true
    }

    /// Scan an end tag at `self.pos`. Returns false when incomplete.
    fn scan_end_tag(&mut self, events: &mut Vec<TagEvent>) -> bool {
        let open = self.pos;
        let scanner = {
            let mut s = Scanner::new(&self.buf);
            s.set_position(open);
            s
        };
        let gt = match scanner.find_byte(b'>') {
            Some(gt) => gt,
            None => return false,
        };

        let body = &self.buf[open + 2..gt];
        let name_len = body.iter().take_while(|&&b| is_name_char(b)).count();
        let valid = name_len > 0
            && body[0] != b'-'
            && !body[0].is_ascii_digit()
            && body[name_len..].iter().all(|&b| is_whitespace(b));

        if !valid {
            self.recover(events, "malformed end tag");
            return true;
        }

        let name = String::from_utf8_lossy(&body[..name_len]).into_owned();
        let span = self.global(open, gt + 1);

        if let Some(region) = self.skip.as_mut() {
            if region.name == name {
                region.depth -= 1;
                trace!("skip depth -1 inside <{}>: {}", region.name, region.depth);
                if region.depth == 0 {
                    debug!("leaving ignored region <{}>", region.name);
                    self.skip = None;
                }
            }
        } else {
            events.push(TagEvent::End { name, span });
        }

        self.pos = gt + 1;
        self.state = State::Text;
        true
    }

    /// Consume comment bytes. Comment content is discarded; only the
    /// closing `-->` matters. Returns false when it has not arrived.
    fn run_comment(&mut self) -> bool {
        match find_subsequence(&self.buf[self.pos..], b"-->") {
            Some(i) => {
                self.pos += i + 3;
                self.state = State::Text;
                true
            }
            None => {
                // Keep a tail that could be a split terminator.
                self.pos = self.buf.len().saturating_sub(2).max(self.pos);
                false
            }
        }
    }

    /// Consume declaration bytes (`<?…?>` or `<!DOCTYPE…>`), discarded.
    fn run_declaration(&mut self, pi: bool) -> bool {
        if pi {
            match find_subsequence(&self.buf[self.pos..], b"?>") {
                Some(i) => {
                    self.pos += i + 2;
                    self.state = State::Text;
                    true
                }
                None => {
                    self.pos = self.buf.len().saturating_sub(1).max(self.pos);
                    false
                }
            }
        } else {
            let scanner = {
                let mut s = Scanner::new(&self.buf);
                s.set_position(self.pos);
                s
            };
            match scanner.find_byte(b'>') {
                Some(gt) => {
                    self.pos = gt + 1;
                    self.state = State::Text;
                    true
                }
                None => {
                    self.pos = self.buf.len();
                    false
                }
            }
        }
    }

    /// Emit CDATA content verbatim, streaming it as it arrives. Holds back
    /// a tail that could be a split `]]>` terminator or UTF-8 sequence.
    fn run_cdata(&mut self, events: &mut Vec<TagEvent>) -> bool {
        match find_subsequence(&self.buf[self.pos..], b"]]>") {
            Some(i) => {
                let end = self.pos + i;
                if end > self.pos && self.skip.is_none() {
                    let span = self.global(self.pos, end);
                    events.push(TagEvent::CData {
                        text: String::from_utf8_lossy(&self.buf[self.pos..end]).into_owned(),
                        span,
                    });
                }
                self.pos = end + 3;
                self.state = State::Text;
                true
            }
            None => {
                let mut end = self.buf.len();
                // "]]" or "]" at the tail could start the terminator.
                if self.buf[self.pos..end].ends_with(b"]]") {
                    end -= 2;
                } else if self.buf[self.pos..end].ends_with(b"]") {
                    end -= 1;
                }
                end -= utf8_incomplete_suffix(&self.buf[self.pos..end]);
                if end > self.pos {
                    if self.skip.is_none() {
                        let span = self.global(self.pos, end);
                        events.push(TagEvent::CData {
                            text: String::from_utf8_lossy(&self.buf[self.pos..end]).into_owned(),
                            span,
                        });
                    }
                    self.pos = end;
                }
                false
            }
        }
    }

    /// Emit a text slice with entities decoded, unless inside a skip region.
    fn emit_text(&mut self, start: usize, end: usize, events: &mut Vec<TagEvent>) {
        if self.skip.is_some() {
            return;
        }
        let decoded = decode_text(&self.buf[start..end]);
        let span = self.global(start, end);
        events.push(TagEvent::Text {
            text: String::from_utf8_lossy(&decoded).into_owned(),
            span,
        });
    }

    /// Record a scanner error, consume one byte, and resume in text state.
    fn recover(&mut self, events: &mut Vec<TagEvent>, message: &str) {
        let span = self.global(self.pos, self.pos + 1);
        if self.skip.is_none() {
            events.push(TagEvent::Error {
                message: message.to_string(),
                span,
            });
        }
        self.pos += 1;
        self.state = State::Text;
    }
}

/// Find a byte subsequence.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Is `rest` a proper prefix of one of the `<!…` markers, meaning the
/// construct cannot be classified until more bytes arrive?
fn is_marker_prefix(rest: &[u8]) -> bool {
    const MARKERS: [&[u8]; 3] = [b"<!--", b"<![CDATA[", b"<!DOCTYPE"];
    MARKERS
        .iter()
        .any(|m| rest.len() < m.len() && m.starts_with(rest))
}

/// Number of trailing bytes that form an incomplete UTF-8 sequence and
/// must be held back until the rest of the character arrives.
fn utf8_incomplete_suffix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let mut i = len;
    let mut cont = 0;
    while i > 0 && cont < 3 && bytes[i - 1] & 0xC0 == 0x80 {
        i -= 1;
        cont += 1;
    }
    if i == 0 {
        return 0;
    }
    let lead = bytes[i - 1];
    let need = if lead >= 0xF0 {
        4
    } else if lead >= 0xE0 {
        3
    } else if lead >= 0xC0 {
        2
    } else {
        return 0;
    };
    let have = len - (i - 1);
    if have < need {
        have
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TagEvent;

    fn collect(chunks: &[&str], ignored: &[&str]) -> Vec<TagEvent> {
        let mut tok = Tokenizer::new(ignored.iter().map(|s| s.to_string()).collect());
        let mut events = Vec::new();
        for c in chunks {
            events.extend(tok.feed(c.as_bytes()));
        }
        events
    }

    fn text_of(events: &[TagEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TagEvent::Text { text, .. } | TagEvent::CData { text, .. } => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_simple_element() {
        let events = collect(&["<root>content</root>"], &[]);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], TagEvent::Start { name, .. } if name == "root"));
        assert!(matches!(&events[1], TagEvent::Text { text, .. } if text == "content"));
        assert!(matches!(&events[2], TagEvent::End { name, .. } if name == "root"));
    }

    #[test]
    fn test_split_mid_tag() {
        let events = collect(&["<ro", "ot><i", "tem/></root>"], &[]);
        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TagEvent::Start { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["root", "item"]);
    }

    #[test]
    fn test_split_mid_attribute_value() {
        let events = collect(&["<x type=\"li", "st[int]\">"], &[]);
        match &events[0] {
            TagEvent::Start { attrs, .. } => assert_eq!(attrs.get("type"), Some("list[int]")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_entity_split_three_ways() {
        let events = collect(&["<s>", "&a", "m", "p; done</s>"], &[]);
        assert_eq!(text_of(&events), "& done");
    }

    #[test]
    fn test_cdata_split_marker() {
        let events = collect(&["<s><![CD", "ATA[a<b&c]", "]></s>"], &[]);
        assert_eq!(text_of(&events), "a<b&c");
    }

    #[test]
    fn test_cdata_streams_content() {
        let mut tok = Tokenizer::new(Vec::new());
        tok.feed(b"<s><![CDATA[");
        let events = tok.feed(b"hello ");
        assert_eq!(text_of(&events), "hello ");
        let events = tok.feed(b"world]]></s>");
        assert_eq!(text_of(&events), "world");
    }

    #[test]
    fn test_comment_discarded() {
        let events = collect(&["<r>a<!-- ignore <x> -->b</r>"], &[]);
        assert_eq!(text_of(&events), "ab");
    }

    #[test]
    fn test_comment_split() {
        let events = collect(&["<r>a<!-- c", "omment --", ">b</r>"], &[]);
        assert_eq!(text_of(&events), "ab");
    }

    #[test]
    fn test_declaration_ignored() {
        let events = collect(&["<?xml version=\"1.0\"?><r>x</r>"], &[]);
        assert_eq!(text_of(&events), "x");
        assert!(matches!(&events[0], TagEvent::Start { name, .. } if name == "r"));
    }

    #[test]
    fn test_ignored_tag_with_same_name_nesting() {
        let events = collect(
            &["<think>a<think>b</think>c</think><Root><x>ok</x></Root>"],
            &["think"],
        );
        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TagEvent::Start { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["Root", "x"]);
        assert_eq!(text_of(&events), "ok");
    }

    #[test]
    fn test_ignored_tag_split_across_chunks() {
        let input = "<think>some <deep><reasoning/></deep></think><r>v</r>";
        for size in [1, 2, 3, 7] {
            let chunks: Vec<String> = input
                .as_bytes()
                .chunks(size)
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect();
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            let events = collect(&refs, &["think"]);
            assert_eq!(text_of(&events), "v", "chunk size {size}");
        }
    }

    #[test]
    fn test_self_closing_ignored_tag() {
        let events = collect(&["<think/><r>v</r>"], &["think"]);
        assert!(matches!(&events[0], TagEvent::Start { name, .. } if name == "r"));
    }

    #[test]
    fn test_self_closing_flag() {
        let events = collect(&["<item/>"], &[]);
        assert!(
            matches!(&events[0], TagEvent::Start { self_closing, .. } if *self_closing)
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_malformed_markup_recovers() {
        let events = collect(&["<r>a < b</r>"], &[]);
        assert!(events
            .iter()
            .any(|e| matches!(e, TagEvent::Error { .. })));
        // The end tag is still seen
        assert!(events
            .iter()
            .any(|e| matches!(e, TagEvent::End { name, .. } if name == "r")));
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let input = "<s>héllo wörld</s>".as_bytes();
        for size in 1..6 {
            let mut tok = Tokenizer::new(Vec::new());
            let mut events = Vec::new();
            for chunk in input.chunks(size) {
                events.extend(tok.feed(chunk));
            }
            assert_eq!(text_of(&events), "héllo wörld", "chunk size {size}");
        }
    }

    #[test]
    fn test_text_streams_before_closing_tag() {
        let mut tok = Tokenizer::new(Vec::new());
        tok.feed(b"<s>");
        let events = tok.feed(b"partial text");
        assert_eq!(text_of(&events), "partial text");
    }

    #[test]
    fn test_spans_are_global() {
        let mut tok = Tokenizer::new(Vec::new());
        let a = tok.feed(b"<r>");
        let b = tok.feed(b"abc</r>");
        assert_eq!(a[0].span(), Span::new(0, 3));
        assert_eq!(b[0].span(), Span::new(3, 6));
    }
}
