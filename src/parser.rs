//! Incremental XML stanza parser (component C).
//!
//! Turns a byte stream into [`ParserEvent`]s without ever requiring a
//! complete document: depth-1 open/close brackets the stream itself,
//! and each depth-2 child is buffered until its end tag and handed back
//! as a complete [`minidom::Element`]. See §4.1 of the design for the
//! exact contract, including quirks mode.

use minidom::Element;

use crate::error::XmppError;

/// Well-known namespaces used across the pipeline.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const JABBER_SERVER: &str = "jabber:server";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const IQ_AUTH: &str = "jabber:iq:auth";
    pub const IQ_ROSTER: &str = "jabber:iq:roster";
    pub const IQ_AUTH_FEATURE: &str = "http://jabber.org/features/iq-auth";
}

/// Attributes on the unclosed `<stream:stream ...>` open tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    fn from_attrs(attrs: &[(String, String)]) -> Self {
        let get = |k: &str| {
            attrs
                .iter()
                .find(|(name, _)| name == k || name.ends_with(&format!(":{k}")))
                .map(|(_, v)| v.clone())
        };
        StreamHeader {
            to: get("to"),
            from: get("from"),
            id: get("id"),
            version: get("version"),
            lang: get("lang"),
        }
    }

    /// Per §3/§4.1: the presence of `id` distinguishes a reply to our own
    /// outbound stream from a fresh inbound open.
    pub fn is_reply(&self) -> bool {
        self.id.is_some()
    }

    pub fn validate(&self) -> Result<(), XmppError> {
        match self.version.as_deref() {
            Some("1.0") => Ok(()),
            _ => Err(XmppError::stream("unsupported or missing stream version")),
        }
    }
}

/// Events emitted by [`StreamParser::feed`], in source order.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    /// First depth-1 open. `reply` is true when this is the remote's reply
    /// to *our* outbound stream (distinguished by an `id` attribute).
    StreamOpen { header: StreamHeader, default_ns: String, reply: bool },
    /// A second depth-1 open on an already-open parser (post-SASL restart).
    StreamReinit { header: StreamHeader },
    /// A fully-built depth-2 subtree, tag-normalized to `{ns}local`.
    Stanza(Element),
    /// Depth-1 close.
    StreamEnd,
}

#[derive(Debug, Clone)]
enum Token {
    /// `name` is the raw (possibly prefixed) tag name as written on the wire.
    Start { name: String, attrs: Vec<(String, String)>, self_closing: bool },
    End { name: String },
    Text(String),
    /// `<?xml ... ?>` or a comment — parsed but otherwise ignored.
    Skip,
}

/// Streaming, depth-tracking XML parser bound to one connection.
///
/// `resetStream` is [`StreamParser::reset_stream`]; `resetParser` is
/// [`StreamParser::reset_parser`] (for this implementation the two differ
/// only in whether the default namespace and quirks flag are dropped, since
/// there is no separate native parser-engine object to recreate).
pub struct StreamParser {
    buf: String,
    depth: usize,
    default_ns: Option<String>,
    header: Option<StreamHeader>,
    /// Raw XML text of the stanza subtree currently being accumulated
    /// (depth >= 2). `None` when between stanzas.
    stanza_text: Option<String>,
    closed: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        StreamParser {
            buf: String::new(),
            depth: 0,
            default_ns: None,
            header: None,
            stanza_text: None,
            closed: false,
        }
    }

    pub fn default_ns(&self) -> Option<&str> {
        self.default_ns.as_deref()
    }

    /// `resetStream`: clears stanza/stream state but keeps the parser usable.
    pub fn reset_stream(&mut self) {
        self.depth = 0;
        self.default_ns = None;
        self.header = None;
        self.stanza_text = None;
    }

    /// `resetParser`: used after SASL success so the new `<stream>` can
    /// re-enter the grammar cleanly. Also drops any buffered partial token.
    pub fn reset_parser(&mut self) {
        self.reset_stream();
        self.buf.clear();
        self.closed = false;
    }

    pub fn close(&mut self) -> Result<(), XmppError> {
        if self.depth != 0 {
            self.closed = true;
            return Err(XmppError::xml_parse("closing an unbalanced tree"));
        }
        self.closed = true;
        self.reset_stream();
        Ok(())
    }

    /// Feed a chunk of bytes, returning events produced in order.
    ///
    /// Implements the quirks-mode bailout from §4.1: if the first depth-1
    /// element is not `stream:stream`, a synthetic open is fabricated, the
    /// namespace is primed to `jabber:client`, and the original data is
    /// re-fed against the primed parser.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ParserEvent>, XmppError> {
        if self.closed {
            return Err(XmppError::InvalidState("parser is closed".into()));
        }

        let text = std::str::from_utf8(data)
            .map_err(|e| XmppError::xml_parse(format!("invalid utf-8: {e}")))?;
        self.buf.push_str(text);

        let mut events = Vec::new();
        loop {
            let Some((token, consumed)) = next_token(&self.buf) else {
                break;
            };
            self.buf.drain(..consumed);

            match self.handle_token(token)? {
                HandleOutcome::Event(ev) => events.push(ev),
                HandleOutcome::Quirks(original) => {
                    // `original` is the triggering tag's own text, reconstructed
                    // by the caller since it was already drained from `self.buf`.
                    // Whatever's still sitting in `self.buf` belongs after it —
                    // capture both before `reset_parser` wipes the buffer.
                    let rest = std::mem::take(&mut self.buf);
                    self.reset_parser();
                    self.default_ns = Some(ns::JABBER_CLIENT.to_string());
                    self.depth = 1;
                    let synthetic_header = StreamHeader {
                        version: Some("1.0".into()),
                        ..Default::default()
                    };
                    events.push(ParserEvent::StreamOpen {
                        header: synthetic_header.clone(),
                        default_ns: ns::JABBER_CLIENT.to_string(),
                        reply: false,
                    });
                    self.header = Some(synthetic_header);
                    let mut retry = original;
                    retry.push_str(&rest);
                    let mut tail = self.feed(retry.as_bytes())?;
                    events.append(&mut tail);
                    return Ok(events);
                }
                HandleOutcome::None => {}
            }
        }
        Ok(events)
    }

    fn handle_token(&mut self, token: Token) -> Result<HandleOutcome, XmppError> {
        match token {
            Token::Skip => Ok(HandleOutcome::None),
            Token::Text(t) => {
                if self.depth <= 1 {
                    if t.trim().is_empty() {
                        Ok(HandleOutcome::None)
                    } else {
                        // "Disallowed text between stanzas → ignore" (§4.1, §7).
                        Ok(HandleOutcome::None)
                    }
                } else {
                    if let Some(buf) = self.stanza_text.as_mut() {
                        buf.push_str(&xml_escape_text(&t));
                    }
                    Ok(HandleOutcome::None)
                }
            }
            Token::Start { name, attrs, self_closing } => {
                self.depth += 1;
                let outcome = if self.depth == 1 {
                    self.handle_depth1_start(&name, &attrs, self_closing)?
                } else if self.depth == 2 {
                    self.stanza_text = Some(render_open_tag(&name, &attrs, self.default_ns.as_deref()));
                    HandleOutcome::None
                } else {
                    if let Some(buf) = self.stanza_text.as_mut() {
                        buf.push_str(&render_open_tag(&name, &attrs, None));
                    }
                    HandleOutcome::None
                };

                if self_closing {
                    // A self-closing tag is a start immediately followed by
                    // its own end; recurse so depth bookkeeping stays uniform.
                    if !matches!(outcome, HandleOutcome::Quirks(_)) {
                        let end_outcome = self.handle_token(Token::End { name })?;
                        return Ok(match end_outcome {
                            HandleOutcome::None => outcome,
                            other => other,
                        });
                    }
                }
                Ok(outcome)
            }
            Token::End { name } => {
                if self.depth == 0 {
                    return Err(XmppError::xml_parse("unbalanced end tag </".to_string() + &name + ">"));
                }
                self.depth -= 1;
                if self.depth == 0 {
                    self.reset_stream();
                    Ok(HandleOutcome::Event(ParserEvent::StreamEnd))
                } else if self.depth == 1 {
                    if let Some(buf) = self.stanza_text.as_mut() {
                        buf.push_str(&format!("</{name}>"));
                    }
                    let raw = self.stanza_text.take().unwrap_or_default();
                    let elem = parse_stanza(&raw, self.default_ns.as_deref())?;
                    Ok(HandleOutcome::Event(ParserEvent::Stanza(elem)))
                } else {
                    if let Some(buf) = self.stanza_text.as_mut() {
                        buf.push_str(&format!("</{name}>"));
                    }
                    Ok(HandleOutcome::None)
                }
            }
        }
    }

    fn handle_depth1_start(
        &mut self,
        name: &str,
        attrs: &[(String, String)],
        self_closing: bool,
    ) -> Result<HandleOutcome, XmppError> {
        if self.header.is_none() {
            // First-ever depth-1 start: check the quirks-mode predicate.
            // Per §9 this must be preserved exactly: the raw tag name must
            // contain "stream".
            if !name.contains("stream") {
                return Ok(HandleOutcome::Quirks(render_trigger_tag(name, attrs, self_closing)));
            }

            if self.default_ns.is_none() {
                if let Some((_, uri)) = attrs.iter().find(|(k, _)| k == "xmlns") {
                    self.default_ns = Some(uri.clone());
                }
            }
            let header = StreamHeader::from_attrs(attrs);
            let default_ns = self
                .default_ns
                .clone()
                .unwrap_or_else(|| ns::JABBER_CLIENT.to_string());
            let reply = header.is_reply();
            self.header = Some(header.clone());
            Ok(HandleOutcome::Event(ParserEvent::StreamOpen { header, default_ns, reply }))
        } else {
            // Second depth-1 open: post-SASL stream restart.
            let header = StreamHeader::from_attrs(attrs);
            Ok(HandleOutcome::Event(ParserEvent::StreamReinit { header }))
        }
    }
}

enum HandleOutcome {
    None,
    Event(ParserEvent),
    /// Triggers the quirks-mode bailout. The payload is the triggering tag's
    /// own rendered text, already drained from `self.buf` by the time this
    /// is returned; the caller re-feeds it ahead of whatever's left in `buf`.
    Quirks(String),
}

/// Parses a complete, self-contained stanza fragment (e.g. `<iq ...>...</iq>`)
/// into a [`minidom::Element`], injecting the stream's default namespace when
/// the fragment declares none of its own so the fragment parses standalone.
fn parse_stanza(raw: &str, default_ns: Option<&str>) -> Result<Element, XmppError> {
    let with_ns = if raw.contains("xmlns") {
        raw.to_string()
    } else if let Some(ns) = default_ns {
        inject_default_ns(raw, ns)
    } else {
        raw.to_string()
    };
    with_ns
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("malformed stanza: {e}")))
}

fn inject_default_ns(raw: &str, default_ns: &str) -> String {
    match raw.find('>') {
        Some(idx) => {
            let (head, tail) = raw.split_at(idx);
            if head.ends_with('/') {
                format!("{} xmlns='{}'{}", &head[..head.len() - 1], default_ns, tail)
            } else {
                format!("{head} xmlns='{default_ns}'{tail}")
            }
        }
        None => raw.to_string(),
    }
}

/// Re-renders a depth-1 start tag exactly as it must be re-fed to the parser
/// once quirks mode fabricates the stream open around it.
fn render_trigger_tag(name: &str, attrs: &[(String, String)], self_closing: bool) -> String {
    let mut out = format!("<{name}");
    for (k, v) in attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&xml_escape_attr(v));
        out.push('"');
    }
    out.push_str(if self_closing { "/>" } else { ">" });
    out
}

fn render_open_tag(name: &str, attrs: &[(String, String)], inject_ns: Option<&str>) -> String {
    let mut out = format!("<{name}");
    for (k, v) in attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&xml_escape_attr(v));
        out.push('"');
    }
    if let Some(ns) = inject_ns {
        if !attrs.iter().any(|(k, _)| k == "xmlns") {
            out.push_str(&format!(" xmlns=\"{ns}\""));
        }
    }
    out.push('>');
    out
}

fn xml_escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn xml_escape_attr(s: &str) -> String {
    xml_escape_text(s).replace('"', "&quot;")
}

/// Scans `buf` for the next complete token, returning it along with the
/// number of bytes consumed. Returns `None` if `buf` holds only a partial
/// token (the caller must wait for more data).
fn next_token(buf: &str) -> Option<(Token, usize)> {
    if buf.is_empty() {
        return None;
    }
    if !buf.starts_with('<') {
        let end = buf.find('<').unwrap_or(buf.len());
        if end == 0 {
            return None;
        }
        // If there's no '<' yet at all, the text run might still be growing;
        // only emit it once we know where it ends (i.e. we found the next '<'),
        // or the caller is clearly done feeding (handled by leaving it buffered).
        if !buf[end..].starts_with('<') && end == buf.len() {
            return None;
        }
        return Some((Token::Text(buf[..end].to_string()), end));
    }

    if buf.starts_with("<?") {
        return buf.find("?>").map(|end| (Token::Skip, end + 2));
    }
    if buf.starts_with("<!--") {
        return buf.find("-->").map(|end| (Token::Skip, end + 3));
    }

    let tag_end = find_tag_end(buf)?;
    let inner = &buf[1..tag_end];
    if let Some(name) = inner.strip_prefix('/') {
        return Some((Token::End { name: name.trim().to_string() }, tag_end + 1));
    }

    let self_closing = inner.trim_end().ends_with('/');
    let body = if self_closing { &inner[..inner.trim_end().len() - 1] } else { inner };
    let (name, attrs) = parse_tag_body(body);
    Some((Token::Start { name, attrs, self_closing }, tag_end + 1))
}

/// Finds the index of the `>` that closes the tag starting at `buf[0]`,
/// respecting quoted attribute values so a `>` inside `"..."` doesn't
/// terminate the tag early. Returns `None` if the tag is not yet complete.
fn find_tag_end(buf: &str) -> Option<usize> {
    let mut in_quote: Option<char> = None;
    for (i, c) in buf.char_indices().skip(1) {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => in_quote = Some(c),
                '>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn parse_tag_body(body: &str) -> (String, Vec<(String, String)>) {
    let body = body.trim();
    let name_end = body.find(|c: char| c.is_whitespace()).unwrap_or(body.len());
    let name = body[..name_end].to_string();
    let rest = body[name_end..].trim_start();

    let mut attrs = Vec::new();
    let mut rest = rest;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        if key.is_empty() {
            break;
        }
        let after_eq = rest[eq + 1..].trim_start();
        let Some(quote) = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let value_start = 1;
        let Some(value_end) = after_eq[value_start..].find(quote) else {
            break;
        };
        let value = &after_eq[value_start..value_start + value_end];
        attrs.push((key.to_string(), unescape(value)));
        rest = after_eq[value_start + value_end + 1..].trim_start();
    }
    (name, attrs)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(p: &mut StreamParser, chunks: &[&str]) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        for c in chunks {
            events.extend(p.feed(c.as_bytes()).unwrap());
        }
        events
    }

    #[test]
    fn stream_open_then_stanza_then_end() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &[
                "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='localhost' version='1.0'>",
                "<iq type='get' id='1'><query xmlns='jabber:iq:roster'/></iq>",
                "</stream:stream>",
            ],
        );
        assert_eq!(events.len(), 3);
        match &events[0] {
            ParserEvent::StreamOpen { header, default_ns, reply } => {
                assert_eq!(header.to.as_deref(), Some("localhost"));
                assert_eq!(default_ns, "jabber:client");
                assert!(!reply);
            }
            other => panic!("expected StreamOpen, got {other:?}"),
        }
        match &events[1] {
            ParserEvent::Stanza(elem) => {
                assert_eq!(elem.name(), "iq");
                assert_eq!(elem.attr("type"), Some("get"));
            }
            other => panic!("expected Stanza, got {other:?}"),
        }
        assert!(matches!(events[2], ParserEvent::StreamEnd));
    }

    #[test]
    fn stanza_split_across_feeds() {
        let mut p = StreamParser::new();
        p.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
            .unwrap();
        let mut events = p.feed(b"<message type='chat'><bo").unwrap();
        assert!(events.is_empty());
        events.extend(p.feed(b"dy>hi</body></message>").unwrap());
        assert_eq!(events.len(), 1);
        match &events[0] {
            ParserEvent::Stanza(elem) => assert_eq!(elem.name(), "message"),
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn reinit_on_second_stream_open() {
        let mut p = StreamParser::new();
        p.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
            .unwrap();
        let events = p
            .feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ParserEvent::StreamReinit { .. }));
    }

    #[test]
    fn quirks_mode_fabricates_stream_open() {
        let mut p = StreamParser::new();
        let events = p.feed(b"<iq type='get' id='1'/>").unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParserEvent::StreamOpen { default_ns, reply, .. } => {
                assert_eq!(default_ns, "jabber:client");
                assert!(!reply);
            }
            other => panic!("expected fabricated StreamOpen, got {other:?}"),
        }
        match &events[1] {
            ParserEvent::Stanza(elem) => assert_eq!(elem.name(), "iq"),
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_between_stanzas_is_discarded() {
        let mut p = StreamParser::new();
        p.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>\n  ")
            .unwrap();
        let events = p.feed(b"<presence/>").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn unbalanced_close_is_an_error() {
        let mut p = StreamParser::new();
        p.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
            .unwrap();
        p.feed(b"</stream:stream>").unwrap();
        assert!(p.feed(b"</stream:stream>").is_err());
    }

    #[test]
    fn stream_header_validate_rejects_bad_version() {
        let h = StreamHeader { version: Some("0.9".into()), ..Default::default() };
        assert!(h.validate().is_err());
        let h2 = StreamHeader { version: Some("1.0".into()), ..Default::default() };
        assert!(h2.validate().is_ok());
    }
}
