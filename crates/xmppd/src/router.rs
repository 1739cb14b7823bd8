//! Stanza routing.
//!
//! A completed stanza is dispatched on its element name and, for iqs,
//! the type attribute and first child's namespace, gated on the
//! session's lifecycle state. Before authentication only SASL `<auth/>`
//! and in-band registration iqs are admitted.

use minidom::Element;
use tracing::debug;

use crate::auth;
use crate::config::Config;
use crate::disco;
use crate::error::StanzaErrorCondition;
use crate::message;
use crate::parser::ns;
use crate::presence;
use crate::register;
use crate::registry::{ServerState, SessionId};
use crate::roster;
use crate::session;
use crate::stream;
use crate::stream_errors;
use crate::types::SessionState;

/// Dispatch one complete stanza from a session.
pub fn route_stanza(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    let session_state = entry.state;
    let authenticated = entry.authenticated;
    let name = stanza.name().to_string();

    debug!(
        stanza = %name,
        ns = %stanza.ns(),
        state = ?session_state,
        "Routing stanza"
    );

    // Pre-auth: SASL and registration only.
    if session_state == SessionState::StreamOpened && !authenticated {
        if name == "auth" && stanza.ns() == ns::SASL {
            auth::handle_sasl(config, state, sid, stanza);
        } else if name == "iq" {
            if first_child_ns(stanza) == ns::REGISTER {
                register::handle_register_iq(config, state, sid, stanza);
            } else {
                send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
            }
        } else {
            stream::send_stream_error(state, sid, stream_errors::NOT_AUTHORIZED);
        }
        return;
    }

    match name.as_str() {
        "iq" => handle_iq(config, state, sid, stanza),
        "message" => {
            if !session_state.is_active() {
                stream::send_stream_error(state, sid, stream_errors::NOT_AUTHORIZED);
                return;
            }
            message::handle_message(config, state, sid, stanza);
        }
        "presence" => {
            if !session_state.is_active() {
                stream::send_stream_error(state, sid, stream_errors::NOT_AUTHORIZED);
                return;
            }
            presence::handle_presence(config, state, sid, stanza);
        }
        _ => stream::send_stream_error(state, sid, stream_errors::UNSUPPORTED_STANZA_TYPE),
    }
}

/// Dispatch an iq by type and first-child namespace.
fn handle_iq(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let itype = stanza.attr("type").unwrap_or("");
    let to = stanza.attr("to").unwrap_or("").to_string();

    // result/error: relay to a local user if online, else drop.
    if itype == "result" || itype == "error" {
        if !to.is_empty() && !is_server_jid(config, &to) {
            relay_to_local(config, state, sid, stanza, &to);
        }
        return;
    }

    let session_state = match state.get(sid) {
        Some(e) => e.state,
        None => return,
    };
    let active = session_state.is_active();

    match first_child_ns(stanza).as_str() {
        ns::BIND => session::handle_bind(config, state, sid, stanza),
        ns::SESSION => session::handle_session_iq(config, state, sid, stanza),
        ns::ROSTER => {
            if !active {
                send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
            } else {
                roster::handle_roster_iq(config, state, sid, stanza);
            }
        }
        ns::DISCO_INFO => {
            if !active {
                send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
            } else {
                disco::handle_disco_info(config, state, sid, stanza);
            }
        }
        ns::DISCO_ITEMS => {
            if !active {
                send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
            } else {
                disco::handle_disco_items(config, state, sid, stanza);
            }
        }
        ns::REGISTER => register::handle_register_iq(config, state, sid, stanza),
        _ => {
            // Unknown namespace: opaque relay to an online local user,
            // otherwise service-unavailable.
            if !to.is_empty() && !is_server_jid(config, &to) && active {
                if !relay_to_local(config, state, sid, stanza, &to) {
                    send_stanza_error(
                        config,
                        state,
                        sid,
                        stanza,
                        StanzaErrorCondition::ServiceUnavailable,
                    );
                }
            } else {
                send_stanza_error(
                    config,
                    state,
                    sid,
                    stanza,
                    StanzaErrorCondition::ServiceUnavailable,
                );
            }
        }
    }
}

/// Whether an address names the server itself.
fn is_server_jid(config: &Config, to: &str) -> bool {
    to.is_empty() || to == config.domain
}

/// First child element's namespace, or empty.
fn first_child_ns(stanza: &Element) -> String {
    stanza
        .children()
        .next()
        .map(|c| c.ns())
        .unwrap_or_default()
}

/// Relay a stanza to a local user's session with the `from` rewritten
/// to the sender's full JID. Returns whether delivery happened.
fn relay_to_local(
    config: &Config,
    state: &mut ServerState,
    sid: SessionId,
    stanza: &Element,
    to: &str,
) -> bool {
    let Ok(bare) = to.parse::<jid::Jid>().map(|j| j.to_bare()) else {
        return false;
    };
    let Some(tid) = state.find_by_bare(&bare, &config.domain) else {
        return false;
    };
    let Some(from) = state.get(sid).and_then(|e| e.full_jid(&config.domain)) else {
        return false;
    };
    let mut relay = stanza.clone();
    relay.set_attr("from", from.to_string());
    if let Some(target) = state.get(tid) {
        target.send_element(&relay);
        return true;
    }
    false
}

/// Return a stanza error for `original`: same element name, copied id,
/// `from` = server domain, `to` = the sender's full JID, and an
/// `<error/>` child carrying the condition.
pub fn send_stanza_error(
    config: &Config,
    state: &ServerState,
    sid: SessionId,
    original: &Element,
    condition: StanzaErrorCondition,
) {
    let Some(entry) = state.get(sid) else {
        return;
    };

    let error_el = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", condition.default_type().as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build();

    let mut builder = Element::builder(original.name(), ns::JABBER_CLIENT)
        .attr("type", "error")
        .attr("from", config.domain.as_str());
    if let Some(id) = original.attr("id") {
        builder = builder.attr("id", id);
    }
    if let Some(full) = entry.full_jid(&config.domain) {
        builder = builder.attr("to", full.to_string());
    }
    entry.send_element(&builder.append(error_el).build());
}
