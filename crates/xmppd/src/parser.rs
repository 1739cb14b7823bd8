//! Incremental XML framing for XMPP client streams.
//!
//! An XMPP session is one long-lived XML document: a single
//! `<stream:stream>` root whose depth-1 children are complete,
//! independently dispatchable stanzas. Bytes arrive in arbitrary TCP
//! chunks, so the framer accumulates them, tracks element nesting
//! tag-by-tag, and surfaces three events: the root opening, each
//! complete stanza subtree, and the root closing.
//!
//! Complete stanza slices are parsed into [`minidom::Element`] trees,
//! which preserve every namespace declaration on the subtree — handlers
//! dispatch on the first child's namespace and routed stanzas must keep
//! `jabber:client` intact on the wire.

use minidom::Element;

use crate::XmppError;

/// Namespace URIs used in XMPP.
pub mod ns {
    /// XMPP client content namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace (the `stream:` prefix)
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session establishment namespace (RFC 3921 compatibility)
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error condition namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error condition namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Roster management namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// In-band registration namespace (XEP-0077)
    pub const REGISTER: &str = "jabber:iq:register";
    /// Registration stream feature (XEP-0077)
    pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    /// Service discovery info namespace (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery items namespace (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Delayed delivery namespace (XEP-0203)
    pub const DELAY: &str = "urn:xmpp:delay";
}

/// No stanza boundary within this many buffered bytes terminates the
/// session.
pub const MAX_STANZA_SIZE: usize = 8192;

/// Parsed stream header information.
///
/// The stream root tag is intentionally unclosed XML (its end tag
/// arrives at session end), so the attributes are extracted from the
/// raw tag text rather than a document parse.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// Default content namespace declared on the root (`xmlns`)
    pub content_ns: Option<String>,
    /// Namespace URI bound to the root tag's prefix (`xmlns:stream`)
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from the raw root tag text.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if !tag.starts_with('<') {
            return Err(XmppError::xml_parse("not a stream header"));
        }
        Ok(StreamHeader {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
            content_ns: extract_attribute(tag, "xmlns"),
            stream_ns: extract_attribute(tag, "xmlns:stream"),
        })
    }

    /// Validate the stream header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(XmppError::stream(format!(
                    "unsupported XMPP version: {}",
                    version
                )));
            }
        }
        Ok(())
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", name, quote);
        let mut search = 0;
        while let Some(rel) = tag[search..].find(&pattern) {
            let start = search + rel;
            // Require a whitespace boundary so `xmlns=` never matches
            // inside `xmlns:stream=`.
            let boundary = tag[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_whitespace());
            if boundary {
                let value_start = start + pattern.len();
                if let Some(end) = tag[value_start..].find(quote) {
                    return Some(tag[value_start..value_start + end].to_string());
                }
                return None;
            }
            search = start + pattern.len();
        }
    }
    None
}

/// An event surfaced by the framer.
#[derive(Debug)]
pub enum StreamEvent {
    /// The `<stream:stream>` root opened.
    StreamOpened(StreamHeader),
    /// A depth-1 child of the root completed.
    Stanza(Element),
    /// The root element closed.
    StreamClosed,
}

/// Incremental XML framer for one client stream.
///
/// Feed arbitrary byte chunks with [`XmlParser::feed`], then drain
/// events with [`XmlParser::next_event`] until it returns `None`.
/// [`XmlParser::reset`] discards all state for the post-SASL stream
/// restart.
pub struct XmlParser {
    /// Unconsumed bytes.
    buf: Vec<u8>,
    /// Scanner resume offset into `buf`.
    scan: usize,
    /// Current element nesting depth; the stream root is depth 1.
    depth: usize,
    /// Names of open elements, for end-tag matching.
    open: Vec<String>,
    /// Offset of the in-progress stanza's opening `<`, if any.
    stanza_start: Option<usize>,
    /// Default content namespace declared on the stream root.
    default_ns: String,
    /// Whether the stream root has been seen.
    opened: bool,
}

impl XmlParser {
    /// Create a fresh framer.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            scan: 0,
            depth: 0,
            open: Vec::new(),
            stanza_start: None,
            default_ns: ns::JABBER_CLIENT.to_string(),
            opened: false,
        }
    }

    /// Feed a chunk of bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discard all parser state for a stream restart.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan = 0;
        self.depth = 0;
        self.open.clear();
        self.stanza_start = None;
        self.default_ns = ns::JABBER_CLIENT.to_string();
        self.opened = false;
    }

    /// Produce the next framing event, or `None` when more bytes are
    /// needed.
    ///
    /// Fails when the unconsumed buffer exceeds [`MAX_STANZA_SIZE`]
    /// without reaching a stanza boundary.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        let event = self.scan_event()?;
        if event.is_none() && self.buf.len() > MAX_STANZA_SIZE {
            return Err(XmppError::stream("no stanza boundary within buffer limit"));
        }
        Ok(event)
    }

    fn scan_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        loop {
            // Locate the next tag.
            let lt = match find_byte(&self.buf, self.scan, b'<') {
                Some(pos) => pos,
                None => {
                    self.discard_interstanza_text(self.buf.len());
                    return Ok(None);
                }
            };

            // Text before the tag: stanza content stays in the buffer,
            // text between stanzas (keep-alive whitespace) is dropped.
            if self.stanza_start.is_none() {
                self.discard_interstanza_text(lt);
                // Offsets may have shifted; rescan from the start.
                if self.buf.first() != Some(&b'<') {
                    continue;
                }
            }
            let lt = match find_byte(&self.buf, self.scan, b'<') {
                Some(pos) => pos,
                None => return Ok(None),
            };

            if self.buf[lt..].starts_with(b"<!") {
                return Err(XmppError::xml_parse(
                    "comments and doctype are not allowed on an XMPP stream",
                ));
            }

            // XML declaration before the root: skip it.
            if self.buf[lt..].starts_with(b"<?") {
                match find_subslice(&self.buf, lt, b"?>") {
                    Some(end) => {
                        if self.opened {
                            return Err(XmppError::xml_parse(
                                "processing instruction inside stream",
                            ));
                        }
                        self.consume_to(end + 2);
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let gt = match find_tag_end(&self.buf, lt)? {
                Some(pos) => pos,
                None => {
                    // Incomplete tag; wait for more bytes.
                    self.scan = lt;
                    return Ok(None);
                }
            };

            if self.buf[lt + 1] == b'/' {
                // End tag.
                let name = tag_text(&self.buf, lt + 2, gt)?.trim().to_string();
                match self.open.pop() {
                    Some(expected) if expected == name => {}
                    Some(expected) => {
                        return Err(XmppError::xml_parse(format!(
                            "mismatched end tag </{}>, expected </{}>",
                            name, expected
                        )));
                    }
                    None => {
                        return Err(XmppError::xml_parse(format!(
                            "unexpected end tag </{}>",
                            name
                        )));
                    }
                }
                self.depth -= 1;

                if self.depth == 0 {
                    self.consume_to(gt + 1);
                    return Ok(Some(StreamEvent::StreamClosed));
                }
                if self.depth == 1 {
                    return self.complete_stanza(gt + 1).map(Some);
                }
                self.scan = gt + 1;
                continue;
            }

            // Start tag (possibly self-closing).
            let self_closing = self.buf[gt - 1] == b'/';
            let name = start_tag_name(&self.buf, lt, gt)?;

            if !self.opened {
                if self_closing {
                    return Err(XmppError::xml_parse("stream root must stay open"));
                }
                let tag = tag_text(&self.buf, lt, gt + 1)?.to_string();
                let header = StreamHeader::parse(&tag)?;
                if let Some(ref content_ns) = header.content_ns {
                    self.default_ns = content_ns.clone();
                }
                self.opened = true;
                self.depth = 1;
                self.open.push(name);
                self.consume_to(gt + 1);
                return Ok(Some(StreamEvent::StreamOpened(header)));
            }

            if self.depth == 1 {
                self.stanza_start = Some(lt);
            }

            if self_closing {
                if self.depth == 1 {
                    return self.complete_stanza(gt + 1).map(Some);
                }
                self.scan = gt + 1;
            } else {
                self.open.push(name);
                self.depth += 1;
                self.scan = gt + 1;
            }
        }
    }

    /// Slice out the finished stanza ending at `end`, parse it, and
    /// consume it from the buffer.
    fn complete_stanza(&mut self, end: usize) -> Result<StreamEvent, XmppError> {
        let start = self
            .stanza_start
            .take()
            .ok_or_else(|| XmppError::internal("stanza end without start"))?;
        let text = std::str::from_utf8(&self.buf[start..end])
            .map_err(|_| XmppError::xml_parse("stanza is not valid UTF-8"))?;
        let with_ns = ensure_default_ns(text, &self.default_ns);
        let element: Element = with_ns
            .parse()
            .map_err(|e| XmppError::xml_parse(format!("malformed stanza: {}", e)))?;
        self.consume_to(end);
        Ok(StreamEvent::Stanza(element))
    }

    /// Drop consumed bytes and reset scan offsets.
    fn consume_to(&mut self, end: usize) {
        self.buf.drain(..end);
        self.scan = 0;
        self.stanza_start = None;
    }

    /// Drop ignorable character data that sits before the next tag when
    /// no stanza is in progress.
    fn discard_interstanza_text(&mut self, end: usize) {
        if self.stanza_start.is_none() && end > 0 {
            self.buf.drain(..end);
            self.scan = 0;
        } else if self.stanza_start.is_some() {
            self.scan = end.min(self.buf.len());
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find `needle` in `haystack[from..]`, returning an absolute offset.
fn find_byte(haystack: &[u8], from: usize, needle: u8) -> Option<usize> {
    haystack[from.min(haystack.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|p| from + p)
}

/// Find a byte subsequence starting at `from`, returning an absolute
/// offset.
fn find_subslice(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    let hay = &haystack[from.min(haystack.len())..];
    hay.windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Find the `>` that closes the tag opened at `lt`, honoring quoted
/// attribute values. `Ok(None)` means the tag is still incomplete.
fn find_tag_end(buf: &[u8], lt: usize) -> Result<Option<usize>, XmppError> {
    let mut quote: Option<u8> = None;
    for (i, &b) in buf.iter().enumerate().skip(lt + 1) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'>' => return Ok(Some(i)),
                b'<' => return Err(XmppError::xml_parse("unescaped '<' inside tag")),
                _ => {}
            },
        }
    }
    Ok(None)
}

/// UTF-8 view of `buf[start..end]`.
fn tag_text(buf: &[u8], start: usize, end: usize) -> Result<&str, XmppError> {
    std::str::from_utf8(&buf[start..end]).map_err(|_| XmppError::xml_parse("tag is not valid UTF-8"))
}

/// Extract the element name from a start tag.
fn start_tag_name(buf: &[u8], lt: usize, gt: usize) -> Result<String, XmppError> {
    let text = tag_text(buf, lt + 1, gt)?;
    let name: String = text
        .chars()
        .take_while(|c| !c.is_ascii_whitespace() && *c != '/' && *c != '>')
        .collect();
    if name.is_empty() {
        return Err(XmppError::xml_parse("empty element name"));
    }
    Ok(name)
}

/// Inject the stream's default namespace into a stanza slice whose top
/// tag does not declare one; minidom requires every element to live in
/// a namespace, and stanzas inherit `jabber:client` from the root.
fn ensure_default_ns(stanza: &str, default_ns: &str) -> String {
    let tag_end = find_tag_end(stanza.as_bytes(), 0)
        .ok()
        .flatten()
        .unwrap_or(stanza.len());
    let tag = &stanza[..tag_end];
    if has_default_xmlns(tag) {
        return stanza.to_string();
    }
    let insert_at = stanza
        .char_indices()
        .skip(1)
        .find(|(_, c)| c.is_ascii_whitespace() || *c == '/' || *c == '>')
        .map(|(i, _)| i)
        .unwrap_or(stanza.len());
    format!(
        "{} xmlns='{}'{}",
        &stanza[..insert_at],
        default_ns,
        &stanza[insert_at..]
    )
}

/// Whether a tag carries a default `xmlns=` declaration (as opposed to
/// a prefixed `xmlns:foo=`).
fn has_default_xmlns(tag: &str) -> bool {
    let mut search = 0;
    while let Some(rel) = tag[search..].find("xmlns=") {
        let start = search + rel;
        let boundary = tag[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_whitespace());
        if boundary {
            return true;
        }
        search = start + "xmlns=".len();
    }
    false
}

/// Serialize an element back to XML text.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("invalid UTF-8: {}", e)))
}
