//! Error types for the XMPP server.

use thiserror::Error;

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML parsing / framing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Stream-level protocol error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Stream-level error conditions (RFC 6120 §4.9.3).
///
/// A stream error always terminates the session.
pub mod stream_errors {
    /// Stream header addressed a domain this server does not serve.
    pub const HOST_UNKNOWN: &str = "host-unknown";
    /// Stanza sent before authentication completed.
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// A newer session bound the same bare JID.
    pub const CONFLICT: &str = "conflict";
    /// Server is shutting down.
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    /// Top-level element was not iq/message/presence.
    pub const UNSUPPORTED_STANZA_TYPE: &str = "unsupported-stanza-type";
}

/// Error type attribute on a stanza `<error/>` element (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after changing the data sent.
    Modify,
    /// Do not retry; the error cannot be remedied.
    Cancel,
    /// Retry after waiting.
    Wait,
    /// Retry after providing credentials.
    Auth,
}

impl StanzaErrorType {
    /// XML attribute value for this error type.
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorType::Modify => "modify",
            StanzaErrorType::Cancel => "cancel",
            StanzaErrorType::Wait => "wait",
            StanzaErrorType::Auth => "auth",
        }
    }
}

/// Stanza-level error conditions used by this server (RFC 6120 §8.3.3).
///
/// Returned in-band; the session stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    NotAllowed,
    ItemNotFound,
    ServiceUnavailable,
    FeatureNotImplemented,
    JidMalformed,
    Conflict,
    NotAcceptable,
    InternalServerError,
}

impl StanzaErrorCondition {
    /// XML element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "bad-request",
            StanzaErrorCondition::NotAllowed => "not-allowed",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
            StanzaErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            StanzaErrorCondition::JidMalformed => "jid-malformed",
            StanzaErrorCondition::Conflict => "conflict",
            StanzaErrorCondition::NotAcceptable => "not-acceptable",
            StanzaErrorCondition::InternalServerError => "internal-server-error",
        }
    }

    /// The error type this condition is conventionally paired with.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            StanzaErrorCondition::BadRequest
            | StanzaErrorCondition::JidMalformed
            | StanzaErrorCondition::NotAcceptable => StanzaErrorType::Modify,
            StanzaErrorCondition::InternalServerError => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }
}
