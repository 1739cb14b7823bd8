//! Service discovery (XEP-0030).
//!
//! The server answers info queries with a fixed identity and feature
//! set; items queries return an empty list.

use minidom::Element;

use crate::config::Config;
use crate::parser::ns;
use crate::registry::{ServerState, SessionId};

/// Identity advertised for this server.
pub const IDENTITY_CATEGORY: &str = "server";
pub const IDENTITY_TYPE: &str = "im";
pub const IDENTITY_NAME: &str = "xmppd";

/// Features advertised in disco#info responses.
pub const FEATURES: &[&str] = &[ns::DISCO_INFO, ns::DISCO_ITEMS, ns::ROSTER, ns::DELAY];

/// Answer a disco#info query.
pub fn handle_disco_info(config: &Config, state: &ServerState, sid: SessionId, stanza: &Element) {
    let mut query = Element::builder("query", ns::DISCO_INFO).append(
        Element::builder("identity", ns::DISCO_INFO)
            .attr("category", IDENTITY_CATEGORY)
            .attr("type", IDENTITY_TYPE)
            .attr("name", IDENTITY_NAME)
            .build(),
    );
    for feature in FEATURES {
        query = query.append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", *feature)
                .build(),
        );
    }
    send_disco_result(config, state, sid, stanza, query.build());
}

/// Answer a disco#items query with an empty list.
pub fn handle_disco_items(config: &Config, state: &ServerState, sid: SessionId, stanza: &Element) {
    let query = Element::builder("query", ns::DISCO_ITEMS).build();
    send_disco_result(config, state, sid, stanza, query);
}

fn send_disco_result(
    config: &Config,
    state: &ServerState,
    sid: SessionId,
    stanza: &Element,
    query: Element,
) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("from", config.domain.as_str());
    if let Some(full) = entry.full_jid(&config.domain) {
        builder = builder.attr("to", full.to_string());
    }
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    entry.send_element(&builder.append(query).build());
}
