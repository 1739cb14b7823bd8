//! Message routing and the on-disk offline queue.
//!
//! A message to an available local session is delivered immediately.
//! Otherwise (unless it is an error message) it is stamped with a
//! XEP-0203 `<delay/>` element recording the server's receipt time in
//! UTC and appended to the recipient's offline directory as a
//! zero-padded sequence-numbered file. The queue drains in file-name
//! order after the recipient's initial available presence.

use std::path::Path;

use minidom::Element;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::StanzaErrorCondition;
use crate::parser::ns;
use crate::registry::{ServerState, SessionId};
use crate::router::send_stanza_error;
use crate::user;

/// Handle an inbound message stanza.
pub fn handle_message(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let to = stanza.attr("to").unwrap_or("");
    let mtype = stanza.attr("type").unwrap_or("normal");

    let Ok(to_jid) = to.parse::<jid::Jid>() else {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::JidMalformed);
        return;
    };
    let Some(local) = to_jid.node().map(|n| n.to_string()) else {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::JidMalformed);
        return;
    };
    if to_jid.domain().to_string() != config.domain {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::ItemNotFound);
        return;
    }
    if !user::user_exists(&config.datadir, &local) {
        send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::ItemNotFound);
        return;
    }

    let Some(from) = state
        .get(sid)
        .and_then(|e| e.full_jid(&config.domain))
    else {
        return;
    };
    let mut message = stanza.clone();
    message.set_attr("from", from.to_string());

    let target_bare = to_jid.to_bare();
    let target = state
        .find_by_bare(&target_bare, &config.domain)
        .and_then(|tid| state.get(tid))
        .filter(|t| t.available);

    if let Some(target) = target {
        target.send_element(&message);
    } else if mtype != "error" {
        store_offline(&config.datadir, &local, &config.domain, message);
    }
}

/// Stamp a message with a delay element and append it to the user's
/// offline queue.
pub fn store_offline(datadir: &Path, username: &str, domain: &str, mut message: Element) {
    let dir = user::offline_dir(datadir, username);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(username, error = %e, "Cannot create offline directory");
        return;
    }

    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let delay = Element::builder("delay", ns::DELAY)
        .attr("from", domain)
        .attr("stamp", stamp)
        .build();
    message.append_child(delay);

    let seq = next_sequence(&dir);
    let path = dir.join(format!("{:04}.xml", seq));
    let mut out = Vec::new();
    if let Err(e) = message.write_to(&mut out) {
        warn!(username, error = %e, "Cannot serialize offline message");
        return;
    }
    match std::fs::write(&path, out) {
        Ok(()) => debug!(username, path = %path.display(), "Stored offline message"),
        Err(e) => warn!(username, error = %e, "Cannot write offline message"),
    }
}

/// Next sequence number: one past the highest existing file name.
fn next_sequence(dir: &Path) -> u32 {
    let mut max = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stem = name.strip_suffix(".xml").unwrap_or(&name);
            if let Ok(seq) = stem.parse::<u32>() {
                max = max.max(seq);
            }
        }
    }
    max + 1
}

/// Deliver and unlink every queued offline message, in file-name order.
pub fn deliver_offline(config: &Config, state: &mut ServerState, sid: SessionId) {
    let Some(local) = state.get(sid).and_then(|e| e.local.clone()) else {
        return;
    };
    let dir = user::offline_dir(&config.datadir, &local);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            (!name.starts_with('.') && name.ends_with(".xml")).then_some(name)
        })
        .collect();
    names.sort();

    for name in names {
        let path = dir.join(&name);
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| text.parse::<Element>().map_err(|e| e.to_string()));
        match parsed {
            Ok(message) => {
                if let Some(entry) = state.get(sid) {
                    entry.send_element(&message);
                }
                debug!(user = %local, file = %name, "Delivered offline message");
            }
            Err(e) => {
                warn!(user = %local, file = %name, error = %e, "Dropping unreadable offline message");
            }
        }
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(user = %local, file = %name, error = %e, "Cannot unlink offline message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> Element {
        let body_el = Element::builder("body", ns::JABBER_CLIENT)
            .append(body)
            .build();
        Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", "chat")
            .attr("to", "bob@example.org")
            .append(body_el)
            .build()
    }

    #[test]
    fn offline_files_are_sequenced() {
        let dir = tempfile::tempdir().unwrap();
        crate::user::create_user(dir.path(), "bob", "pw").unwrap();

        store_offline(dir.path(), "bob", "example.org", message("one"));
        store_offline(dir.path(), "bob", "example.org", message("two"));
        store_offline(dir.path(), "bob", "example.org", message("three"));

        let offline = crate::user::offline_dir(dir.path(), "bob");
        let mut names: Vec<String> = std::fs::read_dir(&offline)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["0001.xml", "0002.xml", "0003.xml"]);
    }

    #[test]
    fn stored_message_carries_delay_stamp() {
        let dir = tempfile::tempdir().unwrap();
        crate::user::create_user(dir.path(), "bob", "pw").unwrap();
        store_offline(dir.path(), "bob", "example.org", message("hi"));

        let path = crate::user::offline_dir(dir.path(), "bob").join("0001.xml");
        let stored: Element = std::fs::read_to_string(path).unwrap().parse().unwrap();
        let delay = stored.get_child("delay", ns::DELAY).expect("delay element");
        assert_eq!(delay.attr("from"), Some("example.org"));
        let stamp = delay.attr("stamp").expect("stamp");
        assert!(stamp.ends_with('Z'), "UTC stamp, got {}", stamp);
    }

    #[test]
    fn sequence_continues_after_gap() {
        let dir = tempfile::tempdir().unwrap();
        crate::user::create_user(dir.path(), "bob", "pw").unwrap();
        let offline = crate::user::offline_dir(dir.path(), "bob");
        std::fs::write(offline.join("0007.xml"), b"<x xmlns='jabber:client'/>").unwrap();

        store_offline(dir.path(), "bob", "example.org", message("late"));
        assert!(offline.join("0008.xml").is_file());
    }
}
