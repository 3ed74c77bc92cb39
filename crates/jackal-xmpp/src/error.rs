//! Error types for the XMPP server.

use thiserror::Error;

use crate::jid::JidError;
use crate::xml::ns;

/// Crate-wide error used at public seams (listeners, host table, wiring).
#[derive(Debug, Error)]
pub enum XmppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Malformed address
    #[error("JID error: {0}")]
    Jid(#[from] JidError),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Cluster failure
    #[error("cluster error: {0}")]
    Cluster(#[from] crate::cluster::ClusterError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PaymentRequired,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    /// Unexpected condition, serialized as `unexpected-request`
    UnexpectedCondition,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PaymentRequired => "payment-required",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedCondition => "unexpected-request",
        }
    }

    /// Legacy error code carried in the `code` attribute.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Conflict => 409,
            Self::FeatureNotImplemented => 501,
            Self::Forbidden => 403,
            Self::Gone => 302,
            Self::InternalServerError => 500,
            Self::ItemNotFound => 404,
            Self::JidMalformed => 400,
            Self::NotAcceptable => 406,
            Self::NotAllowed => 405,
            Self::NotAuthorized => 405,
            Self::PaymentRequired => 402,
            Self::RecipientUnavailable => 404,
            Self::Redirect => 302,
            Self::RegistrationRequired => 407,
            Self::RemoteServerNotFound => 404,
            Self::RemoteServerTimeout => 504,
            Self::ResourceConstraint => 500,
            Self::ServiceUnavailable => 503,
            Self::SubscriptionRequired => 407,
            Self::UndefinedCondition => 500,
            Self::UnexpectedCondition => 400,
        }
    }

    /// Error type paired with this condition.
    pub fn error_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest
            | Self::Gone
            | Self::JidMalformed
            | Self::NotAcceptable
            | Self::Redirect => StanzaErrorType::Modify,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable => StanzaErrorType::Cancel,
            Self::Forbidden
            | Self::NotAuthorized
            | Self::PaymentRequired
            | Self::RegistrationRequired
            | Self::SubscriptionRequired => StanzaErrorType::Auth,
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UndefinedCondition
            | Self::UnexpectedCondition => StanzaErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Modify,
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stream error conditions (RFC 6120 Section 4.9.3).
///
/// Every stream error is fatal: it is written to the peer and the stream is
/// closed right after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorCondition {
    InvalidXml,
    InvalidNamespace,
    HostUnknown,
    InvalidFrom,
    ConnectionTimeout,
    UnsupportedStanzaType,
    UnsupportedVersion,
    NotAuthorized,
    InternalServerError,
    PolicyViolation,
    Conflict,
    SystemShutdown,
    RemoteConnectionFailed,
    UndefinedCondition,
}

impl StreamErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidXml => "invalid-xml",
            Self::InvalidNamespace => "invalid-namespace",
            Self::HostUnknown => "host-unknown",
            Self::InvalidFrom => "invalid-from",
            Self::ConnectionTimeout => "connection-timeout",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
            Self::NotAuthorized => "not-authorized",
            Self::InternalServerError => "internal-server-error",
            Self::PolicyViolation => "policy-violation",
            Self::Conflict => "conflict",
            Self::SystemShutdown => "system-shutdown",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::UndefinedCondition => "undefined-condition",
        }
    }

    /// Build the `<stream:error/>` element for this condition.
    pub fn to_element(&self) -> crate::xml::XElement {
        crate::xml::XElement::builder("stream:error")
            .child(
                crate::xml::XElement::builder(self.as_str())
                    .attr("xmlns", ns::STREAMS_ERRORS)
                    .build(),
            )
            .build()
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
