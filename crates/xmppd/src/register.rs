//! In-band registration (XEP-0077, `jabber:iq:register`).
//!
//! Pre-auth `set` creates an account; post-auth `set` changes the
//! authenticated user's password; `<remove/>` deletes the account and
//! tears the session down after acknowledging. `get` returns the
//! registration form in either phase.

use minidom::Element;
use tracing::info;

use crate::config::Config;
use crate::error::StanzaErrorCondition;
use crate::parser::ns;
use crate::registry::{ServerState, SessionId};
use crate::router::send_stanza_error;
use crate::user::{self, CreateUserError};

/// Handle an iq in the registration namespace, pre- or post-auth.
pub fn handle_register_iq(
    config: &Config,
    state: &mut ServerState,
    sid: SessionId,
    stanza: &Element,
) {
    let itype = stanza.attr("type").unwrap_or("");
    match itype {
        "get" => send_form(config, state, sid, stanza),
        "set" => handle_set(config, state, sid, stanza),
        _ => send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::BadRequest),
    }
}

/// Reply with the registration form.
fn send_form(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    let query = Element::builder("query", ns::REGISTER)
        .append(
            Element::builder("instructions", ns::REGISTER)
                .append("Choose a username and password.")
                .build(),
        )
        .append(Element::builder("username", ns::REGISTER).build())
        .append(Element::builder("password", ns::REGISTER).build())
        .build();

    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("from", config.domain.as_str());
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    if entry.authenticated {
        if let Some(full) = entry.full_jid(&config.domain) {
            builder = builder.attr("to", full.to_string());
        }
    }
    entry.send_element(&builder.append(query).build());
}

fn handle_set(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let Some(query) = stanza.children().next() else {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::BadRequest);
        return;
    };

    if query.children().any(|c| c.name() == "remove") {
        handle_remove(config, state, sid, stanza);
        return;
    }

    let username = query
        .children()
        .find(|c| c.name() == "username")
        .map(|c| c.text())
        .unwrap_or_default();
    let password = query
        .children()
        .find(|c| c.name() == "password")
        .map(|c| c.text())
        .unwrap_or_default();

    if username.is_empty() || password.is_empty() {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::BadRequest);
        return;
    }

    let authenticated = state.get(sid).map(|e| e.authenticated).unwrap_or(false);
    if !authenticated {
        create_account(config, state, sid, stanza, &username, &password);
    } else {
        change_own_password(config, state, sid, stanza, &username, &password);
    }
}

/// Pre-auth account creation.
fn create_account(
    config: &Config,
    state: &mut ServerState,
    sid: SessionId,
    stanza: &Element,
    username: &str,
    password: &str,
) {
    match user::create_user(&config.datadir, username, password) {
        Ok(()) => {
            info!(username, "New account registered");
            send_result(config, state, sid, stanza, false);
        }
        Err(CreateUserError::Conflict) => {
            send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::Conflict);
        }
        Err(CreateUserError::InvalidUsername) => {
            send_stanza_error(
                config,
                state,
                sid,
                stanza,
                StanzaErrorCondition::NotAcceptable,
            );
        }
        Err(CreateUserError::Io) => {
            send_stanza_error(
                config,
                state,
                sid,
                stanza,
                StanzaErrorCondition::InternalServerError,
            );
        }
    }
}

/// Post-auth password change; the submitted username must match the
/// authenticated local-part.
fn change_own_password(
    config: &Config,
    state: &mut ServerState,
    sid: SessionId,
    stanza: &Element,
    username: &str,
    password: &str,
) {
    let own = state.get(sid).and_then(|e| e.local.clone());
    if own.as_deref() != Some(username) {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
        return;
    }
    match user::change_password(&config.datadir, username, password) {
        Ok(()) => {
            info!(username, "Password changed");
            send_result(config, state, sid, stanza, true);
        }
        Err(_) => send_stanza_error(
            config,
            state,
            sid,
            stanza,
            StanzaErrorCondition::InternalServerError,
        ),
    }
}

/// Account removal: acknowledge, delete the account, tear the session
/// down. Other users' rosters are left untouched.
fn handle_remove(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let authenticated = state.get(sid).map(|e| e.authenticated).unwrap_or(false);
    if !authenticated {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::NotAllowed);
        return;
    }
    send_result(config, state, sid, stanza, true);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    if let Some(local) = entry.local.clone() {
        entry.teardown_pending = true;
        info!(username = %local, "Account removal requested");
        let _ = user::delete_user(&config.datadir, &local);
    }
}

fn send_result(
    config: &Config,
    state: &ServerState,
    sid: SessionId,
    stanza: &Element,
    include_to: bool,
) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("from", config.domain.as_str());
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    if include_to {
        if let Some(full) = entry.full_jid(&config.domain) {
            builder = builder.attr("to", full.to_string());
        }
    }
    entry.send_element(&builder.build());
}
