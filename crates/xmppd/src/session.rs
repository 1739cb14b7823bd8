//! Session lifecycle: resource binding, session establishment, session
//! conflicts, and teardown.

use minidom::Element;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::StanzaErrorCondition;
use crate::parser::ns;
use crate::presence;
use crate::registry::{ServerState, SessionId};
use crate::router::send_stanza_error;
use crate::stream::stream_error_text;
use crate::types::SessionState;
use crate::util::generate_id;

/// Handle a resource-binding iq (RFC 6120 §7).
///
/// Binding is accepted directly after SASL or after the post-SASL
/// stream restart, since clients may or may not restart before binding.
/// A bind whose bare JID collides with an already-bound session
/// terminates the older session with a `conflict` stream error.
pub fn handle_bind(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    if !matches!(
        entry.state,
        SessionState::Authenticated | SessionState::StreamOpened
    ) {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
        return;
    }

    let resource = stanza
        .get_child("bind", ns::BIND)
        .and_then(|bind| bind.get_child("resource", ns::BIND))
        .map(|r| r.text())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| generate_id(8));

    let Some(bare) = entry.bare_jid(&config.domain) else {
        return;
    };
    if let Some(existing) = state.find_by_bare(&bare, &config.domain) {
        if existing != sid {
            info!(jid = %bare, "Session conflict, terminating older session");
            terminate_with_conflict(config, state, existing);
        }
    }

    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    entry.resource = Some(resource);
    entry.state = SessionState::Bound;
    let Some(full) = entry.full_jid(&config.domain) else {
        return;
    };

    let jid_el = Element::builder("jid", ns::BIND)
        .append(full.to_string())
        .build();
    let bind_el = Element::builder("bind", ns::BIND).append(jid_el).build();
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT).attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    entry.send_element(&builder.append(bind_el).build());

    info!(jid = %full, "Resource bound");
}

/// Handle a session-establishment iq (RFC 3921 §3).
///
/// A no-op in RFC 6120, kept because older clients still send it.
pub fn handle_session_iq(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    entry.state = SessionState::SessionActive;

    let mut builder = Element::builder("iq", ns::JABBER_CLIENT).attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    entry.send_element(&builder.build());

    if let Some(full) = entry.full_jid(&config.domain) {
        info!(jid = %full, "Session established");
    }
}

/// Terminate a session with a `conflict` stream error.
///
/// Runs synchronously under the state lock so the colliding bind never
/// observes two bound sessions for one bare JID.
fn terminate_with_conflict(config: &Config, state: &mut ServerState, victim: SessionId) {
    if let Some(mut entry) = state.remove(victim) {
        entry.close_with(stream_error_text(crate::stream_errors::CONFLICT));
        presence::broadcast_unavailable_for_removed(config, state, &mut entry);
    }
}

/// Tear a session down: broadcast final unavailable presence if it ever
/// published availability, then drop the entry.
///
/// Idempotent; a task that finds its entry already removed does
/// nothing.
pub fn teardown(config: &Config, state: &mut ServerState, sid: SessionId) {
    let Some(mut entry) = state.remove(sid) else {
        return;
    };
    debug!(
        user = entry.local.as_deref().unwrap_or("(none)"),
        "Tearing down session"
    );
    presence::broadcast_unavailable_for_removed(config, state, &mut entry);
    entry.state = SessionState::Disconnected;
    entry.cancel();
}
