//! Common types for the XMPP server.

use serde::{Deserialize, Serialize};

/// Client stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the peer's stream opener
    Connecting,
    /// Stream opened, features sent
    Connected,
    /// SASL exchange in progress
    Authenticating,
    /// Authenticated, waiting for resource binding
    Authenticated,
    /// Resource bound, stanzas flow
    Bound,
    /// Stream closed
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Bound => "bound",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Transport type for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// TCP socket, optionally upgraded with STARTTLS
    Socket,
    /// WebSocket (RFC 7395)
    WebSocket,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Socket => write!(f, "socket"),
            TransportType::WebSocket => write!(f, "websocket"),
        }
    }
}

/// What to do when a client binds a resource that is already in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceConflict {
    /// Disconnect the existing session with a `conflict` stream error.
    #[default]
    Replace,
    /// Refuse the bind request.
    Reject,
    /// Assign a server-generated resource to the new session.
    Override,
}

/// SASL mechanisms a listener may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslMechanism {
    /// PLAIN (RFC 4616)
    Plain,
    /// SCRAM-SHA-1 (RFC 5802)
    #[serde(rename = "scram_sha_1")]
    ScramSha1,
    /// SCRAM-SHA-256 (RFC 7677)
    #[serde(rename = "scram_sha_256")]
    ScramSha256,
    /// SCRAM-SHA-512
    #[serde(rename = "scram_sha_512")]
    ScramSha512,
}

impl SaslMechanism {
    /// Wire name used in `<mechanism/>` and `<auth mechanism=.../>`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha1 => "SCRAM-SHA-1",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "PLAIN" => Some(SaslMechanism::Plain),
            "SCRAM-SHA-1" => Some(SaslMechanism::ScramSha1),
            "SCRAM-SHA-256" => Some(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Some(SaslMechanism::ScramSha512),
            _ => None,
        }
    }

    pub fn all() -> Vec<SaslMechanism> {
        vec![
            SaslMechanism::Plain,
            SaslMechanism::ScramSha1,
            SaslMechanism::ScramSha256,
            SaslMechanism::ScramSha512,
        ]
    }
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_names() {
        for mech in SaslMechanism::all() {
            assert_eq!(SaslMechanism::from_name(mech.as_str()), Some(mech));
        }
        assert_eq!(SaslMechanism::from_name("DIGEST-MD5"), None);
    }

    #[test]
    fn test_resource_conflict_default() {
        assert_eq!(ResourceConflict::default(), ResourceConflict::Replace);
    }
}
