//! Incremental XML stream parser.
//!
//! Bytes are fed as they arrive from the transport; [`Parser::next_element`]
//! yields one top-level element at a time. In socket mode the first element
//! is the `<stream:stream>` opener (yielded without children) and each
//! direct child of the stream is yielded separately afterwards. Partial
//! input is kept buffered until the element completes.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::{Attribute, XElement};

/// Default cap for a single top-level element.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 32 * 1024;

/// How top-level elements are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingMode {
    /// Every well-formed fragment is a top-level element.
    Default,
    /// `<stream:stream>` opener followed by its children.
    SocketStream,
    /// RFC 7395 framing: `<open/>` and `<close/>` are ordinary elements.
    WebSocketStream,
}

#[derive(Debug, Error)]
pub enum ParserError {
    /// The peer closed its stream (`</stream:stream>` or `<close/>`).
    #[error("stream closed by peer")]
    StreamClosedByPeer,

    #[error("stanza exceeds the maximum allowed size")]
    TooLargeStanza,

    #[error("unexpected end element </{0}>")]
    UnexpectedEndElement(String),

    #[error("XML syntax error: {0}")]
    Syntax(String),

    /// The input ended inside an element.
    #[error("unexpected end of input")]
    UnexpectedEof,
}

/// Element being assembled while its end tag is pending.
struct Pending {
    name: String,
    attributes: Vec<Attribute>,
    children: Vec<XElement>,
    text: String,
}

impl Pending {
    fn into_element(self) -> XElement {
        XElement::from_parts(self.name, self.attributes, self.children, self.text)
    }
}

/// Incremental parser over a growing byte buffer.
pub struct Parser {
    mode: ParsingMode,
    max_stanza_size: usize,
    buf: Vec<u8>,
    stream_opened: bool,
    closed: bool,
}

impl Parser {
    pub fn new(mode: ParsingMode, max_stanza_size: usize) -> Self {
        Self {
            mode,
            max_stanza_size,
            buf: Vec::new(),
            stream_opened: false,
            closed: false,
        }
    }

    pub fn mode(&self) -> ParsingMode {
        self.mode
    }

    /// Append raw bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True when only whitespace is buffered.
    pub fn is_idle(&self) -> bool {
        self.buf.iter().all(|b| b.is_ascii_whitespace())
    }

    /// Called when the transport reaches end of input.
    pub fn finish(&self) -> ParserError {
        if self.is_idle() {
            ParserError::StreamClosedByPeer
        } else {
            ParserError::UnexpectedEof
        }
    }

    /// Try to extract the next complete top-level element.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_element(&mut self) -> Result<Option<XElement>, ParserError> {
        if self.closed {
            return Err(ParserError::StreamClosedByPeer);
        }
        match self.scan()? {
            Scan::Element {
                element,
                consumed,
                opener,
            } => {
                self.consume(consumed);
                if opener {
                    self.stream_opened = true;
                }
                Ok(Some(element))
            }
            Scan::Closed { consumed } => {
                self.consume(consumed);
                self.closed = true;
                Err(ParserError::StreamClosedByPeer)
            }
            Scan::Incomplete {
                pending_from,
                skipped,
            } => {
                if self.buf.len() - pending_from > self.max_stanza_size {
                    return Err(ParserError::TooLargeStanza);
                }
                self.consume(skipped);
                Ok(None)
            }
        }
    }

    fn scan(&self) -> Result<Scan, ParserError> {
        let input = &self.buf[..];
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        let mut stack: Vec<Pending> = Vec::new();
        // Offset of the current top-level element's first byte.
        let mut element_start: Option<usize> = None;
        // Bytes before this offset hold nothing but skipped markup.
        let mut skipped = 0usize;

        loop {
            let before = reader.buffer_position() as usize;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(quick_xml::Error::Syntax(
                    SyntaxError::UnclosedTag
                    | SyntaxError::UnclosedComment
                    | SyntaxError::UnclosedCData
                    | SyntaxError::UnclosedDoctype
                    | SyntaxError::UnclosedPIOrXmlDecl
                    | SyntaxError::InvalidBangMarkup,
                )) => {
                    return Ok(Scan::Incomplete {
                        pending_from: element_start.unwrap_or(skipped),
                        skipped,
                    });
                }
                Err(e) => return Err(ParserError::Syntax(e.to_string())),
            };
            let after = reader.buffer_position() as usize;
            if after - element_start.unwrap_or(before) > self.max_stanza_size {
                return Err(ParserError::TooLargeStanza);
            }

            match event {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {
                    if stack.is_empty() {
                        skipped = after;
                    }
                }
                Event::Start(start) => {
                    let pending = pending_from(&start)?;
                    if stack.is_empty() {
                        if self.mode == ParsingMode::SocketStream && !self.stream_opened {
                            return Ok(Scan::Element {
                                element: pending.into_element(),
                                consumed: after,
                                opener: true,
                            });
                        }
                        element_start = Some(before);
                    }
                    stack.push(pending);
                }
                Event::Empty(start) => {
                    let element = pending_from(&start)?.into_element();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => {
                            if self.mode == ParsingMode::WebSocketStream && element.name() == "close" {
                                return Ok(Scan::Closed { consumed: after });
                            }
                            let opener =
                                self.mode == ParsingMode::SocketStream && !self.stream_opened;
                            return Ok(Scan::Element {
                                element,
                                consumed: after,
                                opener,
                            });
                        }
                    }
                }
                Event::Text(text) => match stack.last_mut() {
                    Some(top) => match text.unescape() {
                        Ok(unescaped) => top.text.push_str(&unescaped),
                        // An entity reference may be split across reads.
                        Err(_) if after == input.len() => {
                            return Ok(Scan::Incomplete {
                                pending_from: element_start.unwrap_or(skipped),
                                skipped,
                            });
                        }
                        Err(e) => return Err(ParserError::Syntax(e.to_string())),
                    },
                    None => skipped = after,
                },
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::End(end) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    match stack.pop() {
                        None if self.mode == ParsingMode::SocketStream && name == "stream:stream" => {
                            return Ok(Scan::Closed { consumed: after });
                        }
                        None => return Err(ParserError::UnexpectedEndElement(name)),
                        Some(pending) if pending.name != name => {
                            return Err(ParserError::UnexpectedEndElement(name));
                        }
                        Some(pending) => {
                            let element = pending.into_element();
                            match stack.last_mut() {
                                Some(parent) => parent.children.push(element),
                                None if self.mode == ParsingMode::WebSocketStream
                                    && element.name() == "close" =>
                                {
                                    return Ok(Scan::Closed { consumed: after });
                                }
                                None => {
                                    return Ok(Scan::Element {
                                        element,
                                        consumed: after,
                                        opener: false,
                                    });
                                }
                            }
                        }
                    }
                }
                Event::Eof => {
                    return Ok(Scan::Incomplete {
                        pending_from: element_start.unwrap_or(skipped),
                        skipped,
                    });
                }
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n.min(self.buf.len()));
    }
}

/// Outcome of one scan over the buffered input.
enum Scan {
    Element {
        element: XElement,
        consumed: usize,
        opener: bool,
    },
    Closed {
        consumed: usize,
    },
    Incomplete {
        pending_from: usize,
        skipped: usize,
    },
}

fn pending_from(start: &BytesStart<'_>) -> Result<Pending, ParserError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| ParserError::Syntax(e.to_string()))?
        .to_string();
    let mut attributes: Vec<Attribute> = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParserError::Syntax(e.to_string()))?;
        let label = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| ParserError::Syntax(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| ParserError::Syntax(e.to_string()))?
            .into_owned();
        if attributes.iter().any(|a| a.label == label) {
            continue;
        }
        attributes.push(Attribute { label, value });
    }
    Ok(Pending {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(mode: ParsingMode) -> Parser {
        Parser::new(mode, DEFAULT_MAX_STANZA_SIZE)
    }

    #[test]
    fn test_default_mode_single_element() {
        let mut p = parser(ParsingMode::Default);
        p.feed(b"<message to='a@b'><body>hi &amp; bye</body></message>");
        let el = p.next_element().unwrap().unwrap();
        assert_eq!(el.name(), "message");
        assert_eq!(el.attr("to"), Some("a@b"));
        assert_eq!(el.child("body").unwrap().text(), "hi & bye");
        assert!(p.next_element().unwrap().is_none());
    }

    #[test]
    fn test_partial_input_is_buffered() {
        let mut p = parser(ParsingMode::Default);
        p.feed(b"<iq id='1' type='get'><qu");
        assert!(p.next_element().unwrap().is_none());
        p.feed(b"ery xmlns='urn:xmpp:ping'/></i");
        assert!(p.next_element().unwrap().is_none());
        p.feed(b"q>");
        let el = p.next_element().unwrap().unwrap();
        assert_eq!(el.children().len(), 1);
        assert_eq!(el.children()[0].namespace(), Some("urn:xmpp:ping"));
    }

    #[test]
    fn test_split_entity_reference() {
        let mut p = parser(ParsingMode::Default);
        p.feed(b"<body>a &am");
        assert!(p.next_element().unwrap().is_none());
        p.feed(b"p; b</body>");
        assert_eq!(p.next_element().unwrap().unwrap().text(), "a & b");
    }

    #[test]
    fn test_socket_stream_open_children_close() {
        let mut p = parser(ParsingMode::SocketStream);
        p.feed(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='jackal.im' version='1.0'>");
        let opener = p.next_element().unwrap().unwrap();
        assert_eq!(opener.name(), "stream:stream");
        assert_eq!(opener.attr("to"), Some("jackal.im"));
        assert!(opener.children().is_empty());

        p.feed(b"\n  <presence/><message><body>x</body></message>");
        assert_eq!(p.next_element().unwrap().unwrap().name(), "presence");
        assert_eq!(p.next_element().unwrap().unwrap().name(), "message");
        assert!(p.next_element().unwrap().is_none());

        p.feed(b"</stream:stream>");
        assert!(matches!(
            p.next_element(),
            Err(ParserError::StreamClosedByPeer)
        ));
    }

    #[test]
    fn test_websocket_close() {
        let mut p = parser(ParsingMode::WebSocketStream);
        p.feed(b"<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='jackal.im' version='1.0'/>");
        assert_eq!(p.next_element().unwrap().unwrap().name(), "open");
        p.feed(b"<close xmlns=\"urn:ietf:params:xml:ns:xmpp-framing\"/>");
        assert!(matches!(
            p.next_element(),
            Err(ParserError::StreamClosedByPeer)
        ));
    }

    #[test]
    fn test_websocket_close_with_end_tag() {
        let mut p = parser(ParsingMode::WebSocketStream);
        p.feed(b"<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='jackal.im' version='1.0'/>");
        assert_eq!(p.next_element().unwrap().unwrap().name(), "open");
        p.feed(b"<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'></close>");
        assert!(matches!(
            p.next_element(),
            Err(ParserError::StreamClosedByPeer)
        ));
    }

    #[test]
    fn test_too_large_stanza() {
        let mut p = Parser::new(ParsingMode::Default, 64);
        let body = "x".repeat(100);
        p.feed(format!("<message><body>{body}</body></message>").as_bytes());
        assert!(matches!(p.next_element(), Err(ParserError::TooLargeStanza)));
    }

    #[test]
    fn test_too_large_partial_stanza() {
        let mut p = Parser::new(ParsingMode::Default, 64);
        p.feed(format!("<message><body>{}", "y".repeat(80)).as_bytes());
        assert!(matches!(p.next_element(), Err(ParserError::TooLargeStanza)));
    }

    #[test]
    fn test_size_cap_is_per_element() {
        let mut p = Parser::new(ParsingMode::Default, 64);
        for _ in 0..10 {
            p.feed(b"<presence><status>away</status></presence>");
            assert!(p.next_element().unwrap().is_some());
        }
    }

    #[test]
    fn test_unexpected_end_element() {
        let mut p = parser(ParsingMode::Default);
        p.feed(b"<a><b></a>");
        assert!(matches!(
            p.next_element(),
            Err(ParserError::UnexpectedEndElement(name)) if name == "a"
        ));
    }

    #[test]
    fn test_cdata_is_kept_raw() {
        let mut p = parser(ParsingMode::Default);
        p.feed(b"<body><![CDATA[<b>&]]></body>");
        assert_eq!(p.next_element().unwrap().unwrap().text(), "<b>&");
    }

    #[test]
    fn test_finish_reports_partial_element() {
        let mut p = parser(ParsingMode::Default);
        p.feed(b"<message>");
        assert!(p.next_element().unwrap().is_none());
        assert!(matches!(p.finish(), ParserError::UnexpectedEof));
    }
}
