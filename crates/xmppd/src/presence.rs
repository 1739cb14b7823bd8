//! Presence and the subscription state machine (RFC 6121 §3-§4).
//!
//! Subscription stanzas mutate *both* sides of the relationship: the
//! sender's roster item for the target and the target's roster item for
//! the sender, persisted even when the target is offline. For an online
//! peer with a loaded roster the in-memory copy is mutated and saved;
//! otherwise the peer's roster is load-modified-saved on disk. The two
//! paths never mix for one peer, so memory and disk cannot diverge.
//!
//! Availability is broadcast to contacts holding a `from`/`both`
//! subscription; the presences of `to`/`both` contacts are mirrored
//! back. The first available presence of a session additionally drains
//! the offline-message queue and re-delivers pending subscription
//! requests.

use jid::{BareJid, FullJid};
use minidom::Element;
use tracing::{debug, warn};

use crate::config::Config;
use crate::message;
use crate::parser::ns;
use crate::registry::{ServerState, SessionId};
use crate::roster::{build_roster_push, Roster, RosterItem, Subscription};

/// RFC 6121 §3 subscription state transitions.
///
/// "Sender" is the session the stanza arrived on; "target" is the peer
/// it addresses. Each transition is applied to one side's roster item.
pub struct SubscriptionStateMachine;

impl SubscriptionStateMachine {
    /// Outbound `subscribe`: the sender's item gains a pending ask.
    pub fn apply_outbound_subscribe(item: &mut RosterItem) {
        item.ask_subscribe = true;
    }

    /// `subscribed`, on the approving sender's item:
    /// none → from, to → both.
    pub fn apply_approval_on_sender(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::None => Subscription::From,
            Subscription::To => Subscription::Both,
            other => other,
        };
    }

    /// `subscribed`, on the requesting target's item:
    /// none → to, from → both, pending ask cleared.
    pub fn apply_approval_on_target(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::None => Subscription::To,
            Subscription::From => Subscription::Both,
            other => other,
        };
        item.ask_subscribe = false;
    }

    /// `unsubscribe`, on the sender's item:
    /// to → none, both → from, pending ask cleared.
    pub fn apply_unsubscribe_on_sender(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::To => Subscription::None,
            Subscription::Both => Subscription::From,
            other => other,
        };
        item.ask_subscribe = false;
    }

    /// `unsubscribe`, on the target's item: from → none, both → to.
    pub fn apply_unsubscribe_on_target(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::From => Subscription::None,
            Subscription::Both => Subscription::To,
            other => other,
        };
    }

    /// `unsubscribed`, on the revoking sender's item:
    /// from → none, both → to.
    pub fn apply_revocation_on_sender(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::From => Subscription::None,
            Subscription::Both => Subscription::To,
            other => other,
        };
    }

    /// `unsubscribed`, on the denied target's item:
    /// to → none, both → from, pending ask cleared.
    pub fn apply_revocation_on_target(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::To => Subscription::None,
            Subscription::Both => Subscription::From,
            other => other,
        };
        item.ask_subscribe = false;
    }

    /// Whether the user sends presence to a contact with this state.
    pub fn should_send_presence(sub: Subscription) -> bool {
        matches!(sub, Subscription::From | Subscription::Both)
    }

    /// Whether the user receives a contact's presence with this state.
    pub fn should_receive_presence(sub: Subscription) -> bool {
        matches!(sub, Subscription::To | Subscription::Both)
    }
}

/// Build a presence stanza with optional type and `to`.
pub fn build_presence(ptype: Option<&str>, from: &str, to: Option<&str>) -> Element {
    let mut builder = Element::builder("presence", ns::JABBER_CLIENT).attr("from", from);
    if let Some(t) = ptype {
        builder = builder.attr("type", t);
    }
    if let Some(t) = to {
        builder = builder.attr("to", t);
    }
    builder.build()
}

/// Main presence dispatcher, by the `type` attribute.
pub fn handle_presence(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    let ptype = stanza.attr("type").unwrap_or("");
    let to = stanza.attr("to").unwrap_or("").to_string();

    match ptype {
        "" => handle_available(config, state, sid, stanza),
        "unavailable" => handle_unavailable(config, state, sid),
        "subscribe" => handle_subscribe(config, state, sid, &to),
        "subscribed" => handle_subscribed(config, state, sid, &to),
        "unsubscribe" => handle_unsubscribe(config, state, sid, &to),
        "unsubscribed" => handle_unsubscribed(config, state, sid, &to),
        other => {
            warn!(ptype = other, "Unknown presence type");
        }
    }
}

/// Ensure a session's roster cache is loaded.
fn ensure_roster_loaded(config: &Config, state: &mut ServerState, sid: SessionId) {
    if let Some(entry) = state.get_mut(sid) {
        if !entry.roster.loaded {
            if let Some(local) = entry.local.clone() {
                entry.roster = Roster::load(&config.datadir, &local);
            }
        }
    }
}

/// Send a roster push for one item to the session's own full JID.
fn push_item(config: &Config, state: &ServerState, sid: SessionId, item: &RosterItem) {
    if let Some(entry) = state.get(sid) {
        if let Some(full) = entry.full_jid(&config.domain) {
            entry.send_element(&build_roster_push(&full, item));
        }
    }
}

/// Available presence: store, broadcast, mirror, and on the first one
/// drain offline messages and pending subscribes.
fn handle_available(config: &Config, state: &mut ServerState, sid: SessionId, stanza: &Element) {
    ensure_roster_loaded(config, state, sid);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    let Some(full) = entry.full_jid(&config.domain) else {
        return;
    };

    let is_initial = !entry.available;
    entry.available = true;

    let mut stored = stanza.clone();
    stored.set_attr("from", full.to_string());
    entry.presence = Some(stored.clone());

    let items: Vec<(BareJid, Subscription)> = entry
        .roster
        .items()
        .iter()
        .map(|i| (i.jid.clone(), i.subscription))
        .collect();

    // Our presence goes to everyone subscribed to us.
    for (jid, sub) in &items {
        if !SubscriptionStateMachine::should_send_presence(*sub) {
            continue;
        }
        if let Some(tid) = state.find_by_bare(jid, &config.domain) {
            if let Some(contact) = state.get(tid) {
                contact.send_element(&stored);
            }
        }
    }

    // Presences of everyone we are subscribed to come back to us.
    for (jid, sub) in &items {
        if !SubscriptionStateMachine::should_receive_presence(*sub) {
            continue;
        }
        let Some(tid) = state.find_by_bare(jid, &config.domain) else {
            continue;
        };
        let contact_presence = state
            .get(tid)
            .filter(|c| c.available)
            .and_then(|c| c.presence.clone());
        if let Some(pres) = contact_presence {
            if let Some(entry) = state.get(sid) {
                entry.send_element(&pres);
            }
        }
    }

    if is_initial {
        if let Some(entry) = state.get_mut(sid) {
            entry.initial_presence_sent = true;
        }
        message::deliver_offline(config, state, sid);
        redeliver_pending_subscribes(config, state, sid);
    }
}

/// Explicit unavailable presence.
fn handle_unavailable(config: &Config, state: &mut ServerState, sid: SessionId) {
    broadcast_unavailable(config, state, sid);
}

/// Broadcast unavailable presence to all online `from`/`both` contacts
/// and clear the availability flag.
///
/// A session that never published available presence broadcasts
/// nothing.
pub fn broadcast_unavailable(config: &Config, state: &mut ServerState, sid: SessionId) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    if !entry.available && !entry.initial_presence_sent {
        return;
    }
    ensure_roster_loaded(config, state, sid);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    let Some(full) = entry.full_jid(&config.domain) else {
        entry.available = false;
        return;
    };
    let items: Vec<RosterItem> = entry.roster.items().to_vec();
    entry.available = false;

    send_unavailable_to_subscribers(config, state, Some(sid), &full, &items);
}

/// Teardown variant of [`broadcast_unavailable`] for an entry already
/// removed from the table.
pub fn broadcast_unavailable_for_removed(
    config: &Config,
    state: &mut ServerState,
    entry: &mut crate::registry::SessionEntry,
) {
    if !entry.available && !entry.initial_presence_sent {
        return;
    }
    if !entry.roster.loaded {
        if let Some(local) = entry.local.clone() {
            entry.roster = Roster::load(&config.datadir, &local);
        }
    }
    let Some(full) = entry.full_jid(&config.domain) else {
        return;
    };
    let items: Vec<RosterItem> = entry.roster.items().to_vec();
    entry.available = false;
    send_unavailable_to_subscribers(config, state, None, &full, &items);
}

fn send_unavailable_to_subscribers(
    config: &Config,
    state: &ServerState,
    exclude: Option<SessionId>,
    full: &FullJid,
    items: &[RosterItem],
) {
    let pres = build_presence(Some("unavailable"), &full.to_string(), None);
    for item in items {
        if !SubscriptionStateMachine::should_send_presence(item.subscription) {
            continue;
        }
        let Some(tid) = state.find_by_bare(&item.jid, &config.domain) else {
            continue;
        };
        if Some(tid) == exclude {
            continue;
        }
        if let Some(contact) = state.get(tid) {
            contact.send_element(&pres);
        }
    }
}

/// `subscribe`: record the pending ask on the sender's roster and
/// deliver the request to the target if online.
fn handle_subscribe(config: &Config, state: &mut ServerState, sid: SessionId, to: &str) {
    let Ok(target_bare) = to.parse::<jid::Jid>().map(|j| j.to_bare()) else {
        warn!(to, "Unparsable subscribe target");
        return;
    };
    ensure_roster_loaded(config, state, sid);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    let Some(sender_bare) = entry.bare_jid(&config.domain) else {
        return;
    };
    let local = entry.local.clone().unwrap_or_default();

    if let Some(item) = entry.roster.find_mut(&target_bare) {
        SubscriptionStateMachine::apply_outbound_subscribe(item);
    } else if let Err(e) =
        entry
            .roster
            .upsert(target_bare.clone(), None, Subscription::None, true)
    {
        warn!(error = %e, "Cannot record subscription request");
        return;
    }
    entry.roster.save_logged(&config.datadir, &local);
    let item = entry.roster.find(&target_bare).cloned();
    if let Some(ref item) = item {
        push_item(config, state, sid, item);
    }

    if let Some(tid) = state.find_by_bare(&target_bare, &config.domain) {
        let pres = build_presence(
            Some("subscribe"),
            &sender_bare.to_string(),
            Some(&target_bare.to_string()),
        );
        if let Some(target) = state.get(tid) {
            target.send_element(&pres);
        }
    }
}

/// `subscribed`: the sender approves the target's pending request.
/// Sender side none→from / to→both; target side none→to / from→both
/// with the ask cleared; the sender's current presence and the approval
/// itself go to the target if online.
fn handle_subscribed(config: &Config, state: &mut ServerState, sid: SessionId, to: &str) {
    let Ok(target_bare) = to.parse::<jid::Jid>().map(|j| j.to_bare()) else {
        warn!(to, "Unparsable subscribed target");
        return;
    };
    ensure_roster_loaded(config, state, sid);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    let Some(sender_bare) = entry.bare_jid(&config.domain) else {
        return;
    };
    let local = entry.local.clone().unwrap_or_default();

    // Sender side.
    if entry.roster.find(&target_bare).is_none() {
        let _ = entry
            .roster
            .upsert(target_bare.clone(), None, Subscription::From, false);
    } else if let Some(item) = entry.roster.find_mut(&target_bare) {
        SubscriptionStateMachine::apply_approval_on_sender(item);
    }
    entry.roster.save_logged(&config.datadir, &local);
    if let Some(item) = entry.roster.find(&target_bare).cloned() {
        push_item(config, state, sid, &item);
    }

    // Target side: in-memory when online with a loaded roster,
    // otherwise directly on disk.
    let target_local = target_bare.node().map(|n| n.to_string()).unwrap_or_default();
    let tid = state.find_by_bare(&target_bare, &config.domain);
    apply_peer_side(
        config,
        state,
        tid,
        &target_local,
        &sender_bare,
        SubscriptionStateMachine::apply_approval_on_target,
    );

    if let Some(tid) = tid {
        let sender_presence = state
            .get(sid)
            .filter(|e| e.available)
            .and_then(|e| e.presence.clone());
        if let Some(target) = state.get(tid) {
            if let Some(pres) = sender_presence {
                target.send_element(&pres);
            }
            let notif = build_presence(
                Some("subscribed"),
                &sender_bare.to_string(),
                Some(&target_bare.to_string()),
            );
            target.send_element(&notif);
        }
    }
}

/// `unsubscribe`: the sender stops receiving the target's presence.
fn handle_unsubscribe(config: &Config, state: &mut ServerState, sid: SessionId, to: &str) {
    let Ok(target_bare) = to.parse::<jid::Jid>().map(|j| j.to_bare()) else {
        warn!(to, "Unparsable unsubscribe target");
        return;
    };
    ensure_roster_loaded(config, state, sid);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    let Some(sender_bare) = entry.bare_jid(&config.domain) else {
        return;
    };
    let local = entry.local.clone().unwrap_or_default();
    let sender_available = entry.available;
    let sender_full = entry.full_jid(&config.domain);

    if let Some(item) = entry.roster.find_mut(&target_bare) {
        SubscriptionStateMachine::apply_unsubscribe_on_sender(item);
        let item = item.clone();
        entry.roster.save_logged(&config.datadir, &local);
        push_item(config, state, sid, &item);
    }

    let target_local = target_bare.node().map(|n| n.to_string()).unwrap_or_default();
    let tid = state.find_by_bare(&target_bare, &config.domain);
    let applied_in_memory = apply_peer_side(
        config,
        state,
        tid,
        &target_local,
        &sender_bare,
        SubscriptionStateMachine::apply_unsubscribe_on_target,
    );

    if let (Some(tid), true) = (tid, applied_in_memory) {
        if let Some(target) = state.get(tid) {
            let notif = build_presence(
                Some("unsubscribe"),
                &sender_bare.to_string(),
                Some(&target_bare.to_string()),
            );
            target.send_element(&notif);
            if sender_available {
                if let Some(full) = sender_full {
                    target.send_element(&build_presence(
                        Some("unavailable"),
                        &full.to_string(),
                        None,
                    ));
                }
            }
        }
    }
}

/// `unsubscribed`: the sender denies or revokes the target's
/// subscription to the sender's presence.
fn handle_unsubscribed(config: &Config, state: &mut ServerState, sid: SessionId, to: &str) {
    let Ok(target_bare) = to.parse::<jid::Jid>().map(|j| j.to_bare()) else {
        warn!(to, "Unparsable unsubscribed target");
        return;
    };
    ensure_roster_loaded(config, state, sid);
    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    let Some(sender_bare) = entry.bare_jid(&config.domain) else {
        return;
    };
    let local = entry.local.clone().unwrap_or_default();
    let sender_available = entry.available;
    let sender_full = entry.full_jid(&config.domain);

    if let Some(item) = entry.roster.find_mut(&target_bare) {
        SubscriptionStateMachine::apply_revocation_on_sender(item);
        let item = item.clone();
        entry.roster.save_logged(&config.datadir, &local);
        push_item(config, state, sid, &item);
    }

    let target_local = target_bare.node().map(|n| n.to_string()).unwrap_or_default();
    let tid = state.find_by_bare(&target_bare, &config.domain);
    let applied_in_memory = apply_peer_side(
        config,
        state,
        tid,
        &target_local,
        &sender_bare,
        SubscriptionStateMachine::apply_revocation_on_target,
    );

    if let (Some(tid), true) = (tid, applied_in_memory) {
        if let Some(target) = state.get(tid) {
            let notif = build_presence(
                Some("unsubscribed"),
                &sender_bare.to_string(),
                Some(&target_bare.to_string()),
            );
            target.send_element(&notif);
            if sender_available {
                if let Some(full) = sender_full {
                    target.send_element(&build_presence(
                        Some("unavailable"),
                        &full.to_string(),
                        None,
                    ));
                }
            }
        }
    }
}

/// Apply a transition to the peer's roster item for `sender_bare`.
///
/// Chooses the in-memory path (peer online with a loaded roster) or the
/// on-disk load-modify-save path. Returns whether the in-memory path
/// was taken.
fn apply_peer_side(
    config: &Config,
    state: &mut ServerState,
    tid: Option<SessionId>,
    peer_local: &str,
    sender_bare: &BareJid,
    transition: fn(&mut RosterItem),
) -> bool {
    if let Some(tid) = tid {
        let in_memory = state
            .get(tid)
            .map(|t| t.roster.loaded)
            .unwrap_or(false);
        if in_memory {
            let mut changed = None;
            if let Some(target) = state.get_mut(tid) {
                if let Some(item) = target.roster.find_mut(sender_bare) {
                    transition(item);
                    changed = Some(item.clone());
                }
                target.roster.save_logged(&config.datadir, peer_local);
            }
            if let Some(item) = changed {
                push_item(config, state, tid, &item);
            }
            return true;
        }
    }
    let mut roster = Roster::load(&config.datadir, peer_local);
    if let Some(item) = roster.find_mut(sender_bare) {
        transition(item);
    }
    roster.save_logged(&config.datadir, peer_local);
    false
}

/// Re-deliver pending subscription requests to a newly available user.
///
/// The `ask='subscribe'` flag on each online initiator's roster is the
/// only record of an undelivered request, so the scan covers every
/// online session's loaded roster; requests from offline initiators
/// surface once both sides are online.
pub fn redeliver_pending_subscribes(config: &Config, state: &mut ServerState, sid: SessionId) {
    let Some(entry) = state.get(sid) else {
        return;
    };
    let Some(our_bare) = entry.bare_jid(&config.domain) else {
        return;
    };

    let mut pending: Vec<BareJid> = Vec::new();
    for (oid, other) in &state.sessions {
        if *oid == sid || other.local.is_none() || !other.roster.loaded {
            continue;
        }
        let Some(other_bare) = other.bare_jid(&config.domain) else {
            continue;
        };
        for item in other.roster.items() {
            if item.ask_subscribe && item.jid == our_bare {
                pending.push(other_bare.clone());
            }
        }
    }

    if pending.is_empty() {
        return;
    }
    debug!(count = pending.len(), user = %our_bare, "Re-delivering pending subscribes");
    let Some(entry) = state.get(sid) else {
        return;
    };
    for from in pending {
        let pres = build_presence(
            Some("subscribe"),
            &from.to_string(),
            Some(&our_bare.to_string()),
        );
        entry.send_element(&pres);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(sub: Subscription, ask: bool) -> RosterItem {
        let mut i = RosterItem::new("contact@example.org".parse().unwrap());
        i.subscription = sub;
        i.ask_subscribe = ask;
        i
    }

    #[test]
    fn outbound_subscribe_sets_ask() {
        let mut i = item(Subscription::None, false);
        SubscriptionStateMachine::apply_outbound_subscribe(&mut i);
        assert!(i.ask_subscribe);
        assert_eq!(i.subscription, Subscription::None);
    }

    #[test]
    fn approval_on_sender() {
        let mut i = item(Subscription::None, false);
        SubscriptionStateMachine::apply_approval_on_sender(&mut i);
        assert_eq!(i.subscription, Subscription::From);

        let mut i = item(Subscription::To, false);
        SubscriptionStateMachine::apply_approval_on_sender(&mut i);
        assert_eq!(i.subscription, Subscription::Both);
    }

    #[test]
    fn approval_on_target_clears_ask() {
        let mut i = item(Subscription::None, true);
        SubscriptionStateMachine::apply_approval_on_target(&mut i);
        assert_eq!(i.subscription, Subscription::To);
        assert!(!i.ask_subscribe);

        let mut i = item(Subscription::From, true);
        SubscriptionStateMachine::apply_approval_on_target(&mut i);
        assert_eq!(i.subscription, Subscription::Both);
        assert!(!i.ask_subscribe);
    }

    #[test]
    fn unsubscribe_transitions() {
        let mut i = item(Subscription::To, true);
        SubscriptionStateMachine::apply_unsubscribe_on_sender(&mut i);
        assert_eq!(i.subscription, Subscription::None);
        assert!(!i.ask_subscribe);

        let mut i = item(Subscription::Both, false);
        SubscriptionStateMachine::apply_unsubscribe_on_sender(&mut i);
        assert_eq!(i.subscription, Subscription::From);

        let mut i = item(Subscription::From, false);
        SubscriptionStateMachine::apply_unsubscribe_on_target(&mut i);
        assert_eq!(i.subscription, Subscription::None);

        let mut i = item(Subscription::Both, false);
        SubscriptionStateMachine::apply_unsubscribe_on_target(&mut i);
        assert_eq!(i.subscription, Subscription::To);
    }

    #[test]
    fn revocation_transitions() {
        let mut i = item(Subscription::From, false);
        SubscriptionStateMachine::apply_revocation_on_sender(&mut i);
        assert_eq!(i.subscription, Subscription::None);

        let mut i = item(Subscription::Both, false);
        SubscriptionStateMachine::apply_revocation_on_sender(&mut i);
        assert_eq!(i.subscription, Subscription::To);

        let mut i = item(Subscription::To, true);
        SubscriptionStateMachine::apply_revocation_on_target(&mut i);
        assert_eq!(i.subscription, Subscription::None);
        assert!(!i.ask_subscribe);

        let mut i = item(Subscription::Both, true);
        SubscriptionStateMachine::apply_revocation_on_target(&mut i);
        assert_eq!(i.subscription, Subscription::From);
        assert!(!i.ask_subscribe);
    }

    #[test]
    fn sides_stay_mirrored_through_full_handshake() {
        // A subscribes, B approves, B subscribes back, A approves.
        let mut a_side = item(Subscription::None, false);
        let mut b_side = item(Subscription::None, false);

        SubscriptionStateMachine::apply_outbound_subscribe(&mut a_side);
        SubscriptionStateMachine::apply_approval_on_sender(&mut b_side);
        SubscriptionStateMachine::apply_approval_on_target(&mut a_side);
        assert_eq!(a_side.subscription, Subscription::To);
        assert_eq!(b_side.subscription, Subscription::From);

        SubscriptionStateMachine::apply_outbound_subscribe(&mut b_side);
        SubscriptionStateMachine::apply_approval_on_sender(&mut a_side);
        SubscriptionStateMachine::apply_approval_on_target(&mut b_side);
        assert_eq!(a_side.subscription, Subscription::Both);
        assert_eq!(b_side.subscription, Subscription::Both);
    }

    #[test]
    fn directional_presence_predicates() {
        assert!(SubscriptionStateMachine::should_send_presence(
            Subscription::From
        ));
        assert!(SubscriptionStateMachine::should_send_presence(
            Subscription::Both
        ));
        assert!(!SubscriptionStateMachine::should_send_presence(
            Subscription::To
        ));
        assert!(SubscriptionStateMachine::should_receive_presence(
            Subscription::To
        ));
        assert!(!SubscriptionStateMachine::should_receive_presence(
            Subscription::From
        ));
    }

    #[test]
    fn presence_builder() {
        let pres = build_presence(Some("subscribe"), "a@x", Some("b@x"));
        assert_eq!(pres.attr("type"), Some("subscribe"));
        assert_eq!(pres.attr("from"), Some("a@x"));
        assert_eq!(pres.attr("to"), Some("b@x"));

        let avail = build_presence(None, "a@x/r", None);
        assert_eq!(avail.attr("type"), None);
        assert_eq!(avail.attr("to"), None);
    }
}
