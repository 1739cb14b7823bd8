//! Stream-level handshake: open/close, feature advertisement, stream
//! errors.
//!
//! The response header and feature sets are written as literal protocol
//! text; everything inside the stream goes through the element builders.

use tracing::{debug, warn};

use crate::config::Config;
use crate::parser::{ns, StreamHeader};
use crate::registry::{ServerState, SessionId};
use crate::types::SessionState;

/// Serialized stream error followed by the closing root tag.
pub fn stream_error_text(condition: &str) -> String {
    format!(
        "<stream:error><{} xmlns='{}'/></stream:error></stream:stream>",
        condition,
        ns::STREAMS
    )
}

/// Queue a stream error on a session and mark it for teardown.
///
/// A stream error always terminates the session; the read loop consumes
/// the teardown flag once the current parser event has been handled.
pub fn send_stream_error(state: &mut ServerState, sid: SessionId, condition: &str) {
    if let Some(entry) = state.get_mut(sid) {
        entry.send_raw(&stream_error_text(condition));
        entry.teardown_pending = true;
    }
}

/// Handle the client's stream header: validate the addressed domain,
/// answer with our header, and advertise features for the current
/// authentication phase.
pub fn handle_stream_open(
    config: &Config,
    state: &mut ServerState,
    sid: SessionId,
    header: &StreamHeader,
) {
    if let Err(e) = header.validate() {
        warn!(error = %e, "Stream header failed validation");
    }
    let to = header.to.as_deref().unwrap_or("");
    if to != config.domain {
        warn!(to, expected = %config.domain, "Host unknown in stream header");
        send_stream_error(state, sid, crate::stream_errors::HOST_UNKNOWN);
        return;
    }

    let Some(entry) = state.get_mut(sid) else {
        return;
    };

    let stream_id = uuid::Uuid::new_v4().to_string();
    let response = format!(
        "<?xml version='1.0'?>\
         <stream:stream from='{}' id='{}' \
         xmlns='jabber:client' \
         xmlns:stream='{}' \
         version='1.0'>",
        config.domain,
        stream_id,
        ns::STREAM
    );
    entry.send_raw(&response);

    if entry.authenticated {
        entry.send_raw(&format!(
            "<stream:features>\
             <bind xmlns='{}'/>\
             <session xmlns='{}'><optional/></session>\
             </stream:features>",
            ns::BIND,
            ns::SESSION
        ));
    } else {
        entry.send_raw(&format!(
            "<stream:features>\
             <mechanisms xmlns='{}'><mechanism>PLAIN</mechanism></mechanisms>\
             <register xmlns='{}'/>\
             </stream:features>",
            ns::SASL,
            ns::REGISTER_FEATURE
        ));
    }

    entry.state = SessionState::StreamOpened;
    debug!(stream_id = %stream_id, authenticated = entry.authenticated, "Stream opened");
}

/// Handle the client closing its stream: mirror the close and tear the
/// session down.
pub fn handle_stream_close(state: &mut ServerState, sid: SessionId) {
    if let Some(entry) = state.get_mut(sid) {
        debug!("Stream closed by client");
        entry.send_raw("</stream:stream>");
        entry.teardown_pending = true;
    }
}
