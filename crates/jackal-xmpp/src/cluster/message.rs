//! Binary codec for messages exchanged between cluster nodes.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! u8      format version
//! u8      message kind
//! string  sender node name
//! u32     payload count
//! payload*:
//!   string node, string domain, string resource      (JID)
//!   u8 0 | u8 1, u8 stanza kind, element             (optional stanza)
//!   u8 0 | u8 1, u32 count, (string key, string value)*  (optional context)
//! ```

use bytes::{Bytes, BytesMut};

use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaKind};
use crate::stream::StreamContext;
use crate::xml::binary::{decode_element, encode_element, get_string, get_u32, get_u8, put_string, CodecError};
use bytes::BufMut;

pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Bind = 0,
    Unbind = 1,
    UpdatePresence = 2,
    RouteStanza = 3,
    BatchBind = 4,
}

impl MessageKind {
    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Bind),
            1 => Ok(Self::Unbind),
            2 => Ok(Self::UpdatePresence),
            3 => Ok(Self::RouteStanza),
            4 => Ok(Self::BatchBind),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub jid: Jid,
    pub stanza: Option<Stanza>,
    pub context: Option<StreamContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMessage {
    pub kind: MessageKind,
    pub node: String,
    pub payloads: Vec<MessagePayload>,
}

impl ClusterMessage {
    pub fn new(kind: MessageKind, node: impl Into<String>, payloads: Vec<MessagePayload>) -> Self {
        Self {
            kind,
            node: node.into(),
            payloads,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(self.kind as u8);
        put_string(&mut buf, &self.node);
        buf.put_u32(self.payloads.len() as u32);
        for payload in &self.payloads {
            encode_payload(payload, &mut buf);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let version = get_u8(&mut buf)?;
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_tag(get_u8(&mut buf)?)?;
        let node = get_string(&mut buf)?;
        let count = get_u32(&mut buf)? as usize;
        let mut payloads = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            payloads.push(decode_payload(&mut buf)?);
        }
        Ok(Self { kind, node, payloads })
    }
}

fn encode_payload(payload: &MessagePayload, buf: &mut BytesMut) {
    put_string(buf, payload.jid.node());
    put_string(buf, payload.jid.domain());
    put_string(buf, payload.jid.resource());

    match &payload.stanza {
        Some(stanza) => {
            buf.put_u8(1);
            buf.put_u8(stanza.kind() as u8);
            encode_element(stanza.element(), buf);
        }
        None => buf.put_u8(0),
    }

    match &payload.context {
        Some(context) => {
            buf.put_u8(1);
            buf.put_u32(context.len() as u32);
            for (key, value) in context {
                put_string(buf, key);
                put_string(buf, value);
            }
        }
        None => buf.put_u8(0),
    }
}

fn decode_payload(buf: &mut Bytes) -> Result<MessagePayload, CodecError> {
    let node = get_string(buf)?;
    let domain = get_string(buf)?;
    let resource = get_string(buf)?;
    // Peers only send prepared JIDs.
    let jid = Jid::new(&node, &domain, &resource, true).map_err(|e| CodecError::InvalidPayload(e.to_string()))?;

    let stanza = if get_u8(buf)? == 1 {
        Some(decode_stanza(buf)?)
    } else {
        None
    };

    let context = if get_u8(buf)? == 1 {
        let count = get_u32(buf)? as usize;
        let mut context = StreamContext::new();
        for _ in 0..count {
            let key = get_string(buf)?;
            let value = get_string(buf)?;
            context.insert(key, value);
        }
        Some(context)
    } else {
        None
    };

    Ok(MessagePayload { jid, stanza, context })
}

fn decode_stanza(buf: &mut Bytes) -> Result<Stanza, CodecError> {
    let tag = get_u8(buf)?;
    let kind = StanzaKind::from_tag(tag).ok_or(CodecError::UnknownStanzaKind(tag))?;
    let element = decode_element(buf)?;
    if StanzaKind::from_name(element.name()) != Some(kind) {
        return Err(CodecError::InvalidPayload(format!(
            "stanza kind {tag} does not match <{}/>",
            element.name()
        )));
    }
    let from = address(element.attr("from"))?;
    let to = address(element.attr("to"))?;
    Stanza::new(kind, element, from, to).map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

fn address(raw: Option<&str>) -> Result<Jid, CodecError> {
    let raw = raw.ok_or_else(|| CodecError::InvalidPayload("stanza without address".to_string()))?;
    Jid::parse(raw).map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Presence, PresenceType};
    use crate::xml::XElement;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[test]
    fn test_update_presence_round_trip() {
        let presence = Presence::new(
            XElement::builder("presence")
                .child(XElement::builder("priority").text("5").build())
                .child(XElement::builder("status").text("on the balcony").build())
                .build(),
            jid("ortuman@jackal.im/balcony"),
            jid("ortuman@jackal.im"),
        )
        .unwrap();
        let mut context = StreamContext::new();
        context.insert("roster:requested".to_string(), "true".to_string());

        let message = ClusterMessage::new(
            MessageKind::UpdatePresence,
            "node-a",
            vec![MessagePayload {
                jid: jid("ortuman@jackal.im/balcony"),
                stanza: Some(Stanza::Presence(presence)),
                context: Some(context),
            }],
        );

        let decoded = ClusterMessage::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
        match &decoded.payloads[0].stanza {
            Some(Stanza::Presence(p)) => assert_eq!(p.priority(), 5),
            other => panic!("unexpected stanza {other:?}"),
        }
    }

    #[test]
    fn test_stanza_decoded_by_kind_tag() {
        let probe = Presence::build(PresenceType::Probe, jid("jackal.im"), jid("juliet@jackal.im"));
        let message = ClusterMessage::new(
            MessageKind::RouteStanza,
            "node-b",
            vec![MessagePayload {
                jid: jid("juliet@jackal.im/phone"),
                stanza: Some(Stanza::Presence(probe)),
                context: None,
            }],
        );
        let mut raw = BytesMut::from(&message.encode()[..]);
        // Header is version, kind, node string, payload count, then the
        // three JID strings; flip the stanza tag to "iq".
        let tag_offset = 2 + 4 + "node-b".len() + 4 + (4 + 6) + (4 + 9) + (4 + 5) + 1;
        assert_eq!(raw[tag_offset], StanzaKind::Presence as u8);
        raw[tag_offset] = StanzaKind::Iq as u8;

        assert!(matches!(
            ClusterMessage::decode(raw.freeze()),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let message = ClusterMessage::new(MessageKind::Unbind, "node-a", vec![]);
        let mut raw = BytesMut::from(&message.encode()[..]);
        raw[0] = 42;
        assert_eq!(
            ClusterMessage::decode(raw.freeze()),
            Err(CodecError::UnsupportedVersion(42))
        );
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let message = ClusterMessage::new(MessageKind::Unbind, "node-a", vec![]);
        let mut raw = BytesMut::from(&message.encode()[..]);
        raw[1] = 9;
        assert_eq!(
            ClusterMessage::decode(raw.freeze()),
            Err(CodecError::UnknownMessageType(9))
        );
    }
}
