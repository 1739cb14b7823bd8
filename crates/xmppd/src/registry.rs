//! Live-session bookkeeping.
//!
//! [`ServerState`] is the single shared table of connected sessions.
//! Stanza handlers run under one lock over this state, so a handler
//! that mutates two sessions' rosters (the subscription engine) or
//! walks every session (presence broadcast, pending-subscribe
//! redelivery) does so atomically with respect to every other handler.
//!
//! Socket I/O stays out of the lock: each entry holds the sending half
//! of its connection's outbound queue, drained by that connection's
//! writer task in queue order.

use std::collections::HashMap;

use jid::{BareJid, FullJid};
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::element_to_string;
use crate::roster::Roster;
use crate::types::SessionState;

/// Opaque per-connection identifier.
pub type SessionId = u64;

/// An item on a session's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// Protocol text to write.
    Data(String),
    /// Final protocol text; the writer flushes it and closes the
    /// socket.
    Close(String),
}

/// Per-connection state shared with the stanza handlers.
pub struct SessionEntry {
    /// Connection lifecycle state.
    pub state: SessionState,
    /// Authenticated local-part, set by SASL.
    pub local: Option<String>,
    /// Bound resource.
    pub resource: Option<String>,
    /// Whether SASL completed.
    pub authenticated: bool,
    /// Whether the session has published available presence.
    pub available: bool,
    /// Whether the first available presence was processed (offline
    /// drain and subscribe redelivery happen once).
    pub initial_presence_sent: bool,
    /// Normalized copy of the most recent available presence, `from`
    /// rewritten to the full JID. Echoed to newly-approving contacts.
    pub presence: Option<Element>,
    /// Cached roster.
    pub roster: Roster,
    /// The framer must be recreated after SASL success; the handler
    /// records the request here and the read loop consumes it once the
    /// current parser call has returned.
    pub parser_reset_pending: bool,
    /// The session must be destroyed, but the request surfaced inside
    /// stanza handling; the read loop consumes it and runs teardown.
    pub teardown_pending: bool,
    /// Sending half of the outbound queue.
    tx: mpsc::UnboundedSender<Outbound>,
    /// Cancels this connection's read loop.
    cancel: CancellationToken,
}

impl SessionEntry {
    /// The session's bare JID, once authenticated.
    pub fn bare_jid(&self, domain: &str) -> Option<BareJid> {
        let local = self.local.as_deref()?;
        format!("{}@{}", local, domain).parse().ok()
    }

    /// The session's full JID, once bound.
    pub fn full_jid(&self, domain: &str) -> Option<FullJid> {
        let local = self.local.as_deref()?;
        let resource = self.resource.as_deref()?;
        format!("{}@{}/{}", local, domain, resource).parse().ok()
    }

    /// Queue a serialized stanza for this session.
    pub fn send_element(&self, element: &Element) {
        match element_to_string(element) {
            Ok(text) => self.send_raw(&text),
            Err(e) => warn!(error = %e, "Dropping unserializable stanza"),
        }
    }

    /// Queue raw protocol text for this session.
    pub fn send_raw(&self, text: &str) {
        debug!(target: "xmppd::wire", ">> {}", text);
        let _ = self.tx.send(Outbound::Data(text.to_string()));
    }

    /// Queue final protocol text, then close the socket and cancel the
    /// read loop.
    pub fn close_with(&self, text: String) {
        debug!(target: "xmppd::wire", ">> {}", text);
        let _ = self.tx.send(Outbound::Close(text));
        self.cancel.cancel();
    }

    /// Cancel the read loop without sending anything further.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// The table of live sessions.
#[derive(Default)]
pub struct ServerState {
    next_id: SessionId,
    /// Live sessions by id.
    pub sessions: HashMap<SessionId, SessionEntry>,
}

impl ServerState {
    /// Create an empty state table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    pub fn register(
        &mut self,
        tx: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) -> SessionId {
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.insert(
            id,
            SessionEntry {
                state: SessionState::Connected,
                local: None,
                resource: None,
                authenticated: false,
                available: false,
                initial_presence_sent: false,
                presence: None,
                roster: Roster::default(),
                parser_reset_pending: false,
                teardown_pending: false,
                tx,
                cancel,
            },
        );
        id
    }

    /// Remove a session entry.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionEntry> {
        self.sessions.remove(&id)
    }

    /// Borrow a session entry.
    pub fn get(&self, id: SessionId) -> Option<&SessionEntry> {
        self.sessions.get(&id)
    }

    /// Borrow a session entry mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(&id)
    }

    /// Find the session for a bare JID.
    ///
    /// Matches any authenticated session of that user; when several
    /// exist (an older one mid-teardown), a bound one wins.
    pub fn find_by_bare(&self, bare: &BareJid, domain: &str) -> Option<SessionId> {
        let mut fallback = None;
        for (id, entry) in &self.sessions {
            if entry.state == SessionState::Disconnected {
                continue;
            }
            if entry.bare_jid(domain).as_ref() == Some(bare) {
                if entry.state.is_active() {
                    return Some(*id);
                }
                fallback.get_or_insert(*id);
            }
        }
        fallback
    }

    /// Ids of all live sessions.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn add_session(state: &mut ServerState) -> (SessionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded_channel();
        let id = state.register(tx, CancellationToken::new());
        (id, rx)
    }

    #[test]
    fn register_and_find_by_bare() {
        let mut state = ServerState::new();
        let (id, _rx) = add_session(&mut state);
        {
            let entry = state.get_mut(id).unwrap();
            entry.local = Some("alice".to_string());
            entry.resource = Some("home".to_string());
            entry.state = SessionState::Bound;
        }

        let bare: BareJid = "alice@example.org".parse().unwrap();
        assert_eq!(state.find_by_bare(&bare, "example.org"), Some(id));

        let other: BareJid = "bob@example.org".parse().unwrap();
        assert_eq!(state.find_by_bare(&other, "example.org"), None);
    }

    #[test]
    fn bound_session_preferred_over_unbound() {
        let mut state = ServerState::new();
        let (old_id, _rx1) = add_session(&mut state);
        let (new_id, _rx2) = add_session(&mut state);
        for (id, st) in [
            (old_id, SessionState::Authenticated),
            (new_id, SessionState::Bound),
        ] {
            let entry = state.get_mut(id).unwrap();
            entry.local = Some("alice".to_string());
            entry.state = st;
            if st == SessionState::Bound {
                entry.resource = Some("home".to_string());
            }
        }

        let bare: BareJid = "alice@example.org".parse().unwrap();
        assert_eq!(state.find_by_bare(&bare, "example.org"), Some(new_id));
    }

    #[test]
    fn send_element_reaches_queue() {
        let mut state = ServerState::new();
        let (id, mut rx) = add_session(&mut state);
        let el = Element::builder("presence", crate::ns::JABBER_CLIENT).build();
        state.get(id).unwrap().send_element(&el);

        match rx.try_recv().unwrap() {
            Outbound::Data(text) => assert!(text.starts_with("<presence")),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn close_with_cancels() {
        let mut state = ServerState::new();
        let (tx, mut rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let id = state.register(tx, cancel.clone());

        state.get(id).unwrap().close_with("</stream:stream>".to_string());
        assert!(cancel.is_cancelled());
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close(_)));
    }
}
