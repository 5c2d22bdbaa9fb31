//! Minimal XML reader for system-map documents.
//!
//! Parses a well-formed subset of XML into an [`Element`] tree: elements,
//! attributes, text content, self-closing tags. Declarations (`<?..?>`),
//! doctypes and comments are skipped. This covers everything the block-design
//! flow emits into `system_map.xml`; it is not a general XML parser.

use crate::ParseError;

/// A parsed XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Tag name.
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<Element>,
    /// Concatenated, trimmed text content directly under this element.
    pub text: String,
}

impl Element {
    /// Looks up an attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the first child element with the given tag name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the trimmed text of the first child with the given tag name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Iterates over child elements with the given tag name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Parses an XML document and returns its root element.
pub fn parse(input: &str) -> Result<Element, ParseError> {
    let mut reader = Reader {
        bytes: input.as_bytes(),
        pos: 0,
    };
    reader.skip_prolog();
    let root = reader.element()?;
    Ok(root)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn err(&self, reason: impl Into<String>) -> ParseError {
        ParseError::Xml {
            pos: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.bytes[self.pos..].starts_with(prefix.as_bytes())
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Skips declarations, doctypes, comments, and surrounding whitespace.
    fn skip_prolog(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with("<?") {
                self.skip_until("?>");
            } else if self.starts_with("<!--") {
                self.skip_until("-->");
            } else if self.starts_with("<!") {
                self.skip_until(">");
            } else {
                return;
            }
        }
    }

    fn skip_until(&mut self, terminator: &str) {
        match self.bytes[self.pos..]
            .windows(terminator.len())
            .position(|w| w == terminator.as_bytes())
        {
            Some(off) => self.pos += off + terminator.len(),
            None => self.pos = self.bytes.len(),
        }
    }

    fn name(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':' || b == b'.')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// Parses one element, cursor positioned at its `<`.
    fn element(&mut self) -> Result<Element, ParseError> {
        if self.peek() != Some(b'<') {
            return Err(self.err("expected `<`"));
        }
        self.pos += 1;
        let name = self.name()?;

        let mut element = Element {
            name,
            attributes: Vec::new(),
            children: Vec::new(),
            text: String::new(),
        };

        // Attributes up to `>` or `/>`.
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') => {
                    self.pos += 1;
                    if self.peek() != Some(b'>') {
                        return Err(self.err("expected `>` after `/`"));
                    }
                    self.pos += 1;
                    return Ok(element);
                }
                Some(_) => {
                    let key = self.name()?;
                    self.skip_whitespace();
                    if self.peek() != Some(b'=') {
                        return Err(self.err(format!("expected `=` after attribute `{key}`")));
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let value = self.quoted_value()?;
                    element.attributes.push((key, value));
                }
                None => return Err(self.err("unexpected end of input in tag")),
            }
        }

        // Content: text and child elements until the matching close tag.
        loop {
            if self.starts_with("<!--") {
                self.skip_until("-->");
                continue;
            }
            if self.starts_with("</") {
                self.pos += 2;
                let close = self.name()?;
                if close != element.name {
                    return Err(self.err(format!(
                        "mismatched close tag: expected `{}`, found `{close}`",
                        element.name
                    )));
                }
                self.skip_whitespace();
                if self.peek() != Some(b'>') {
                    return Err(self.err("expected `>` in close tag"));
                }
                self.pos += 1;
                element.text = element.text.trim().to_string();
                return Ok(element);
            }
            match self.peek() {
                Some(b'<') => element.children.push(self.element()?),
                Some(_) => {
                    let start = self.pos;
                    while self.peek().is_some_and(|b| b != b'<') {
                        self.pos += 1;
                    }
                    let chunk = String::from_utf8_lossy(&self.bytes[start..self.pos]);
                    element.text.push_str(&unescape(&chunk));
                }
                None => {
                    return Err(self.err(format!("unterminated element `{}`", element.name)));
                }
            }
        }
    }

    fn quoted_value(&mut self) -> Result<String, ParseError> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err(self.err("expected a quoted attribute value")),
        };
        self.pos += 1;
        let start = self.pos;
        while self.peek().is_some_and(|b| b != quote) {
            self.pos += 1;
        }
        if self.peek() != Some(quote) {
            return Err(self.err("unterminated attribute value"));
        }
        let raw = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(unescape(&raw))
    }
}

/// Resolves the five predefined XML entities.
fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
