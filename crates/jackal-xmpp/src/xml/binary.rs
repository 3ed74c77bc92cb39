//! Compact binary representation of elements.
//!
//! Strings are a big-endian `u32` byte length followed by UTF-8 bytes.
//! An element is its name, text, attribute count with `(label, value)`
//! pairs, then child count with each child encoded recursively.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Attribute, XElement};

/// Nesting guard for untrusted input.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("element nesting too deep")]
    TooDeep,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unknown stanza kind {0}")]
    UnknownStanzaKind(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEof);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Append the binary form of `element` to `buf`.
pub fn encode_element(element: &XElement, buf: &mut BytesMut) {
    put_string(buf, element.name());
    put_string(buf, element.text());
    buf.put_u32(element.attributes().len() as u32);
    for attr in element.attributes() {
        put_string(buf, &attr.label);
        put_string(buf, &attr.value);
    }
    buf.put_u32(element.children().len() as u32);
    for child in element.children() {
        encode_element(child, buf);
    }
}

/// Read one element from the front of `buf`.
pub fn decode_element(buf: &mut Bytes) -> Result<XElement, CodecError> {
    decode_at(buf, 0)
}

fn decode_at(buf: &mut Bytes, depth: usize) -> Result<XElement, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let name = get_string(buf)?;
    let text = get_string(buf)?;

    let attr_count = get_u32(buf)? as usize;
    let mut attributes = Vec::with_capacity(attr_count.min(64));
    for _ in 0..attr_count {
        let label = get_string(buf)?;
        let value = get_string(buf)?;
        attributes.push(Attribute { label, value });
    }

    let child_count = get_u32(buf)? as usize;
    let mut children = Vec::with_capacity(child_count.min(64));
    for _ in 0..child_count {
        children.push(decode_at(buf, depth + 1)?);
    }

    Ok(XElement::from_parts(name, attributes, children, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{Parser, ParsingMode};

    #[test]
    fn test_parsed_element_survives_binary_form() {
        let mut parser = Parser::new(ParsingMode::Default, 4096);
        parser.feed(
            br#"<message from="a@b/c" to="d@e" type="chat"><body>hi &lt;there&gt;</body><thread>t1</thread><x xmlns="jabber:x:data" type="form"><field var="a"/></x></message>"#,
        );
        let original = parser.next_element().unwrap().unwrap();

        let mut buf = BytesMut::new();
        encode_element(&original, &mut buf);
        let decoded = decode_element(&mut buf.freeze()).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(decoded.attributes()[2].label, "type");
        assert_eq!(decoded.children()[1].name(), "thread");
    }

    #[test]
    fn test_truncated_input() {
        let el = XElement::builder("presence").attr("type", "probe").build();
        let mut buf = BytesMut::new();
        encode_element(&el, &mut buf);
        let mut truncated = buf.freeze().slice(..10);
        assert_eq!(
            decode_element(&mut truncated),
            Err(CodecError::UnexpectedEof)
        );
    }
}
