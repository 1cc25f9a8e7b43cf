//! Tolerant recursive-descent scanner for JSON prefixes.
//!
//! Every value parser reports how the value ended. A value cut off by the end
//! of input is still returned with whatever was decoded so far; a syntax error
//! stops the scan and the containers return the members completed before it.

use serde_json::{Map, Number, Value};

const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The value ended with its own closing token.
    Closed,
    /// Input ran out inside the value.
    Truncated,
    /// A syntax error stopped the scan.
    Malformed,
}

#[derive(Debug, Clone)]
pub(crate) struct Scanned {
    pub value: Option<Value>,
    pub completion: Completion,
}

impl Scanned {
    fn new(value: Option<Value>, completion: Completion) -> Self {
        Self { value, completion }
    }

    fn missing(completion: Completion) -> Self {
        Self::new(None, completion)
    }
}

pub(crate) fn scan_document(src: &str) -> Scanned {
    let mut scanner = TolerantScanner::new(src);
    scanner.skip_ws();
    if scanner.at_end() {
        return Scanned::missing(Completion::Truncated);
    }
    let mut scanned = scanner.parse_value();
    if scanned.completion == Completion::Closed {
        scanner.skip_ws();
        if !scanner.at_end() {
            scanned.completion = Completion::Malformed;
        }
    }
    scanned
}

struct TolerantScanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> TolerantScanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b' ' | b'\n' | b'\r' | b'\t') = self.peek() {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Scanned {
        self.skip_ws();
        if self.depth >= MAX_DEPTH {
            return Scanned::missing(Completion::Malformed);
        }
        match self.peek() {
            None => Scanned::missing(Completion::Truncated),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => {
                let (text, completion) = self.parse_string();
                Scanned::new(Some(Value::String(text)), completion)
            }
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(b't') => self.parse_literal("true", Value::Bool(true)),
            Some(b'f') => self.parse_literal("false", Value::Bool(false)),
            Some(b'n') => self.parse_literal("null", Value::Null),
            Some(_) => Scanned::missing(Completion::Malformed),
        }
    }

    fn parse_object(&mut self) -> Scanned {
        self.pos += 1;
        self.depth += 1;
        let mut map = Map::new();
        let completion = self.object_members(&mut map);
        self.depth -= 1;
        Scanned::new(Some(Value::Object(map)), completion)
    }

    fn object_members(&mut self, map: &mut Map<String, Value>) -> Completion {
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Completion::Truncated,
                Some(b'}') => {
                    self.pos += 1;
                    return Completion::Closed;
                }
                Some(b'"') => {}
                Some(_) => return Completion::Malformed,
            }

            // A key that is still streaming in has no value yet; drop it.
            let (key, key_completion) = self.parse_string();
            if key_completion != Completion::Closed {
                return key_completion;
            }

            self.skip_ws();
            match self.peek() {
                None => return Completion::Truncated,
                Some(b':') => self.pos += 1,
                Some(_) => return Completion::Malformed,
            }

            let member = self.parse_value();
            let Some(value) = member.value else {
                return member.completion;
            };
            map.insert(key, value);
            if member.completion != Completion::Closed {
                return member.completion;
            }

            self.skip_ws();
            match self.peek() {
                None => return Completion::Truncated,
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Completion::Closed;
                }
                Some(_) => return Completion::Malformed,
            }
        }
    }

    fn parse_array(&mut self) -> Scanned {
        self.pos += 1;
        self.depth += 1;
        let mut items = Vec::new();
        let completion = self.array_items(&mut items);
        self.depth -= 1;
        Scanned::new(Some(Value::Array(items)), completion)
    }

    fn array_items(&mut self, items: &mut Vec<Value>) -> Completion {
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Completion::Truncated,
                Some(b']') => {
                    self.pos += 1;
                    return Completion::Closed;
                }
                Some(_) => {}
            }

            let item = self.parse_value();
            let Some(value) = item.value else {
                return item.completion;
            };
            items.push(value);
            if item.completion != Completion::Closed {
                return item.completion;
            }

            self.skip_ws();
            match self.peek() {
                None => return Completion::Truncated,
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Completion::Closed;
                }
                Some(_) => return Completion::Malformed,
            }
        }
    }

    /// Decodes a string starting at the opening quote. Quote and backslash are
    /// ASCII, so slicing between them always lands on char boundaries.
    fn parse_string(&mut self) -> (String, Completion) {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let run_end = self.bytes[self.pos..]
                .iter()
                .position(|b| *b == b'"' || *b == b'\\')
                .map(|offset| self.pos + offset);
            let Some(idx) = run_end else {
                out.push_str(&self.src[self.pos..]);
                self.pos = self.bytes.len();
                return (out, Completion::Truncated);
            };
            out.push_str(&self.src[self.pos..idx]);
            self.pos = idx;

            if self.bytes[idx] == b'"' {
                self.pos += 1;
                return (out, Completion::Closed);
            }

            match self.parse_escape(&mut out) {
                Completion::Closed => {}
                other => return (out, other),
            }
        }
    }

    /// Handles one escape sequence at `self.pos` (the backslash). A sequence
    /// cut off by the end of input is dropped.
    fn parse_escape(&mut self, out: &mut String) -> Completion {
        let Some(&escaped) = self.bytes.get(self.pos + 1) else {
            self.pos = self.bytes.len();
            return Completion::Truncated;
        };
        let simple = match escaped {
            b'"' => Some('"'),
            b'\\' => Some('\\'),
            b'/' => Some('/'),
            b'b' => Some('\u{8}'),
            b'f' => Some('\u{c}'),
            b'n' => Some('\n'),
            b'r' => Some('\r'),
            b't' => Some('\t'),
            b'u' => None,
            _ => return Completion::Malformed,
        };
        if let Some(ch) = simple {
            out.push(ch);
            self.pos += 2;
            return Completion::Closed;
        }

        let first = match self.hex_quad(self.pos + 2) {
            Ok(code) => code,
            Err(completion) => return completion,
        };
        self.pos += 6;

        match first {
            0xD800..=0xDBFF => {
                let rest = &self.bytes[self.pos..];
                if rest.len() < 6 && b"\\u".starts_with(&rest[..rest.len().min(2)]) {
                    // The low half may still be on its way.
                    self.pos = self.bytes.len();
                    return Completion::Truncated;
                }
                if rest.starts_with(b"\\u") {
                    match self.hex_quad(self.pos + 2) {
                        Ok(low @ 0xDC00..=0xDFFF) => {
                            let combined = 0x10000 + ((first - 0xD800) << 10) + (low - 0xDC00);
                            out.push(char::from_u32(combined).unwrap_or('\u{FFFD}'));
                            self.pos += 6;
                        }
                        Ok(_) => out.push('\u{FFFD}'),
                        Err(completion) => return completion,
                    }
                } else {
                    out.push('\u{FFFD}');
                }
            }
            code => out.push(char::from_u32(code).unwrap_or('\u{FFFD}')),
        }
        Completion::Closed
    }

    fn hex_quad(&self, start: usize) -> Result<u32, Completion> {
        let tail = self.bytes.get(start..).unwrap_or_default();
        let digits = &tail[..tail.len().min(4)];
        if !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(Completion::Malformed);
        }
        if digits.len() < 4 {
            return Err(Completion::Truncated);
        }
        let text = std::str::from_utf8(digits).map_err(|_| Completion::Malformed)?;
        u32::from_str_radix(text, 16).map_err(|_| Completion::Malformed)
    }

    fn parse_number(&mut self) -> Scanned {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        self.take_digits();
        if self.peek() == Some(b'.') {
            self.pos += 1;
            self.take_digits();
        }
        if let Some(b'e' | b'E') = self.peek() {
            self.pos += 1;
            if let Some(b'+' | b'-') = self.peek() {
                self.pos += 1;
            }
            self.take_digits();
        }

        let raw = &self.src[start..self.pos];
        if self.at_end() {
            // The number may still be growing: keep its longest valid prefix.
            let prefix = raw.trim_end_matches(['.', 'e', 'E', '+', '-']);
            return match parse_number(prefix) {
                Some(number) => Scanned::new(Some(Value::Number(number)), Completion::Truncated),
                None => Scanned::missing(Completion::Truncated),
            };
        }
        match parse_number(raw) {
            Some(number) => Scanned::new(Some(Value::Number(number)), Completion::Closed),
            None => Scanned::missing(Completion::Malformed),
        }
    }

    fn take_digits(&mut self) {
        while let Some(b'0'..=b'9') = self.peek() {
            self.pos += 1;
        }
    }

    fn parse_literal(&mut self, word: &str, value: Value) -> Scanned {
        let rest = &self.bytes[self.pos..];
        let n = rest.len().min(word.len());
        if rest[..n] != word.as_bytes()[..n] {
            return Scanned::missing(Completion::Malformed);
        }
        self.pos += n;
        if n == word.len() {
            Scanned::new(Some(value), Completion::Closed)
        } else {
            Scanned::new(Some(value), Completion::Truncated)
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if text.is_empty() || text == "-" {
        return None;
    }
    serde_json::from_str::<Number>(text).ok()
}
