//! Common types for the XMPP server.

/// Session state in the XMPP connection lifecycle.
///
/// Only the transitions enumerated in the handlers are legal:
/// `Connected` → `StreamOpened` (stream header for our domain),
/// `StreamOpened` → `Authenticated` (SASL PLAIN success),
/// `Authenticated` → `StreamOpened` (post-SASL stream restart),
/// `StreamOpened`/`Authenticated` → `Bound` (bind iq),
/// `Bound` → `SessionActive` (session iq), and anything →
/// `Disconnected` on parse error, EOF, or shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP accepted, no stream header yet
    Connected,
    /// Stream negotiated, features sent
    StreamOpened,
    /// SASL completed, awaiting stream restart or bind
    Authenticated,
    /// Resource bound
    Bound,
    /// Session iq accepted (RFC 3921 compatibility, no-op in RFC 6120)
    SessionActive,
    /// Torn down
    Disconnected,
}

impl SessionState {
    /// Whether the session may exchange message/presence/roster traffic.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Bound | SessionState::SessionActive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(SessionState::Bound.is_active());
        assert!(SessionState::SessionActive.is_active());
        assert!(!SessionState::Connected.is_active());
        assert!(!SessionState::StreamOpened.is_active());
        assert!(!SessionState::Authenticated.is_active());
        assert!(!SessionState::Disconnected.is_active());
    }
}
