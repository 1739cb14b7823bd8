//! SASL PLAIN authentication (RFC 6120 §6, RFC 4616).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use minidom::Element;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::parser::ns;
use crate::registry::{ServerState, SessionId};
use crate::types::SessionState;
use crate::user;

/// Handle a `<auth/>` element from a pre-auth session.
pub fn handle_sasl(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let Some(entry) = state.get_mut(sid) else {
        return;
    };

    let mechanism = stanza.attr("mechanism").unwrap_or("");
    if mechanism != "PLAIN" {
        warn!(mechanism, "Unsupported SASL mechanism");
        entry.send_raw(&sasl_failure("invalid-mechanism"));
        return;
    }

    let payload = stanza.text();
    let payload = payload.trim();
    if payload.is_empty() {
        warn!("Empty SASL PLAIN payload");
        entry.send_raw(&sasl_failure("not-authorized"));
        return;
    }

    let Ok(decoded) = BASE64_STANDARD.decode(payload) else {
        warn!("Invalid base64 in SASL PLAIN payload");
        entry.send_raw(&sasl_failure("not-authorized"));
        return;
    };

    // [authzid] \0 authcid \0 passwd — the authzid is ignored.
    let Some((authcid, password)) = split_plain(&decoded) else {
        warn!("Malformed SASL PLAIN payload");
        entry.send_raw(&sasl_failure("not-authorized"));
        return;
    };

    debug!(user = %authcid, "SASL PLAIN auth attempt");

    if !user::check_password(&config.datadir, &authcid, &password) {
        info!(user = %authcid, "Authentication failed");
        entry.send_raw(&sasl_failure("not-authorized"));
        return;
    }

    info!(user = %authcid, "Authenticated");
    entry.local = Some(authcid);
    entry.authenticated = true;
    entry.state = SessionState::Authenticated;
    entry.send_raw(&format!("<success xmlns='{}'/>", ns::SASL));

    // The client restarts its stream next; the framer that delivered
    // this element is recreated by the read loop, not here.
    entry.parser_reset_pending = true;
}

/// Split a decoded PLAIN payload into (authcid, password).
fn split_plain(decoded: &[u8]) -> Option<(String, String)> {
    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    let (authcid, password) = match parts.len() {
        3 => (parts[1], parts[2]),
        2 => (parts[0], parts[1]),
        _ => return None,
    };
    if authcid.is_empty() {
        return None;
    }
    Some((
        String::from_utf8_lossy(authcid).into_owned(),
        String::from_utf8_lossy(password).into_owned(),
    ))
}

fn sasl_failure(condition: &str) -> String {
    format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, condition)
}
