//! Server Dialback (XEP-0220).
//!
//! 1. Originating server sends `db:result` with a dialback key
//! 2. Receiving server opens a connection to the originating server's
//!    authoritative host and sends `db:verify`
//! 3. Authoritative server answers `db:verify` with valid/invalid
//! 4. Receiving server answers the original `db:result`
//!
//! Keys are `HMAC-SHA256(secret, stream_id || receiving || originating)`,
//! hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::S2sError;
use crate::xml::XElement;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackResult {
    Valid,
    Invalid,
}

impl DialbackResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

impl From<bool> for DialbackResult {
    fn from(valid: bool) -> Self {
        if valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }
}

/// Dialback key generator. The secret must stay stable for as long as
/// keys generated with it may be verified.
#[derive(Clone)]
pub struct DialbackKey {
    mac: HmacSha256,
}

impl DialbackKey {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, S2sError> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| S2sError::Negotiation(format!("invalid dialback secret: {e}")))?;
        Ok(Self { mac })
    }

    pub fn generate(&self, stream_id: &str, receiving_domain: &str, originating_domain: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(stream_id.as_bytes());
        mac.update(receiving_domain.as_bytes());
        mac.update(originating_domain.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, key: &str, stream_id: &str, receiving_domain: &str, originating_domain: &str) -> bool {
        let expected = self.generate(stream_id, receiving_domain, originating_domain);
        crate::auth::scram::constant_time_eq(key.as_bytes(), expected.as_bytes())
    }
}

/// `<db:result from to>key</db:result>` request.
pub fn result_request(from: &str, to: &str, key: &str) -> XElement {
    XElement::builder("db:result")
        .attr("from", from)
        .attr("to", to)
        .text(key)
        .build()
}

/// `<db:result type/>` answer, `from`/`to` as seen by the answering server.
pub fn result_response(from: &str, to: &str, result: DialbackResult) -> XElement {
    XElement::builder("db:result")
        .attr("from", from)
        .attr("to", to)
        .attr("type", result.as_str())
        .build()
}

pub fn verify_request(from: &str, to: &str, stream_id: &str, key: &str) -> XElement {
    XElement::builder("db:verify")
        .attr("from", from)
        .attr("to", to)
        .attr("id", stream_id)
        .text(key)
        .build()
}

pub fn verify_response(from: &str, to: &str, stream_id: &str, result: DialbackResult) -> XElement {
    XElement::builder("db:verify")
        .attr("from", from)
        .attr("to", to)
        .attr("id", stream_id)
        .attr("type", result.as_str())
        .build()
}
