//! Roster management (RFC 6121 §2).
//!
//! The roster is a bounded ordered list of contacts with per-contact
//! subscription state, persisted as `roster.xml` in the user's data
//! directory. The server answers roster get/set IQs, and sends a
//! "roster push" (an unsolicited `iq type='set'` with a single item,
//! addressed to the user themselves) after every change.
//!
//! Roster set semantics follow RFC 6121 §2.1.2: the `subscription` and
//! `ask` fields are server-controlled and cannot be edited by the
//! client; the only client-writable subscription value is the `remove`
//! sentinel, which deletes the item. The sentinel is never persisted.

use std::fmt;
use std::path::Path;

use jid::{BareJid, FullJid};
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::parser::ns;
use crate::util::generate_id;
use crate::XmppError;

/// Maximum number of contacts per roster.
pub const MAX_ROSTER_ITEMS: usize = 128;

/// Subscription state for a roster item.
///
/// - `none`: no subscription in either direction
/// - `to`: the user receives the contact's presence
/// - `from`: the contact receives the user's presence
/// - `both`: mutual
/// - `remove`: transient sentinel in roster sets and removal pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    /// XML attribute value for this subscription state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    /// Parse an attribute value; unknown values load as `none`.
    pub fn parse(s: &str) -> Self {
        match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A contact in the user's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    /// The contact's bare JID.
    pub jid: BareJid,
    /// Optional display name.
    pub name: Option<String>,
    /// Current subscription state.
    pub subscription: Subscription,
    /// Outbound subscription request pending approval.
    pub ask_subscribe: bool,
}

impl RosterItem {
    /// Create a new item with no name, `none` subscription, no pending
    /// ask.
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            subscription: Subscription::None,
            ask_subscribe: false,
        }
    }

    /// Parse an item from a roster `<item/>` element. Returns `None`
    /// when the jid attribute is missing or unparsable.
    pub fn from_element(elem: &Element) -> Option<Self> {
        let jid: BareJid = elem.attr("jid")?.parse().ok()?;
        Some(Self {
            jid,
            name: elem.attr("name").map(|s| s.to_string()),
            subscription: elem
                .attr("subscription")
                .map(Subscription::parse)
                .unwrap_or_default(),
            ask_subscribe: elem.attr("ask") == Some("subscribe"),
        })
    }

    /// Render this item as a roster `<item/>` element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());
        if let Some(ref name) = self.name {
            builder = builder.attr("name", name.as_str());
        }
        if self.ask_subscribe {
            builder = builder.attr("ask", "subscribe");
        }
        builder.build()
    }
}

/// An in-memory roster with a `loaded` flag distinguishing "never read
/// from disk" from "empty".
#[derive(Debug, Clone, Default)]
pub struct Roster {
    items: Vec<RosterItem>,
    /// Whether this roster reflects the on-disk document.
    pub loaded: bool,
}

impl Roster {
    /// All items, in insertion order.
    pub fn items(&self) -> &[RosterItem] {
        &self.items
    }

    /// Find an item by bare JID.
    pub fn find(&self, jid: &BareJid) -> Option<&RosterItem> {
        self.items.iter().find(|i| &i.jid == jid)
    }

    /// Find an item mutably by bare JID.
    pub fn find_mut(&mut self, jid: &BareJid) -> Option<&mut RosterItem> {
        self.items.iter_mut().find(|i| &i.jid == jid)
    }

    /// Add an item, or update an existing item's fields.
    ///
    /// Fails when a new item would exceed [`MAX_ROSTER_ITEMS`].
    pub fn upsert(
        &mut self,
        jid: BareJid,
        name: Option<String>,
        subscription: Subscription,
        ask_subscribe: bool,
    ) -> Result<(), XmppError> {
        if let Some(existing) = self.find_mut(&jid) {
            if name.is_some() {
                existing.name = name;
            }
            existing.subscription = subscription;
            existing.ask_subscribe = ask_subscribe;
            return Ok(());
        }
        if self.items.len() >= MAX_ROSTER_ITEMS {
            return Err(XmppError::internal("roster full"));
        }
        self.items.push(RosterItem {
            jid,
            name,
            subscription,
            ask_subscribe,
        });
        Ok(())
    }

    /// Remove an item by bare JID. Returns whether it existed.
    pub fn remove(&mut self, jid: &BareJid) -> bool {
        let before = self.items.len();
        self.items.retain(|i| &i.jid != jid);
        self.items.len() < before
    }

    /// Load a user's roster from disk.
    ///
    /// A missing or unparsable file yields an empty roster marked
    /// loaded, so a fresh account starts clean.
    pub fn load(datadir: &Path, username: &str) -> Roster {
        let path = crate::user::roster_path(datadir, username);
        let mut roster = Roster {
            items: Vec::new(),
            loaded: true,
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                debug!(username, error = %e, "No roster file");
                return roster;
            }
        };
        let root: Element = match contents.parse() {
            Ok(el) => el,
            Err(e) => {
                warn!(username, error = %e, "Unparsable roster file");
                return roster;
            }
        };
        if root.name() != "roster" {
            return roster;
        }
        for item_el in root.children().filter(|c| c.name() == "item") {
            if roster.items.len() >= MAX_ROSTER_ITEMS {
                break;
            }
            if let Some(item) = RosterItem::from_element(item_el) {
                roster.items.push(item);
            }
        }
        roster
    }

    /// Persist a user's roster to disk.
    ///
    /// Failures are logged by the caller; the in-memory change stands
    /// either way.
    pub fn save(&self, datadir: &Path, username: &str) -> Result<(), XmppError> {
        let mut builder = Element::builder("roster", ns::ROSTER);
        for item in &self.items {
            builder = builder.append(item.to_element());
        }
        let root = builder.build();
        let mut out = Vec::from(&b"<?xml version=\"1.0\"?>\n"[..]);
        root.write_to(&mut out)
            .map_err(|e| XmppError::xml_parse(format!("roster serialization: {}", e)))?;
        std::fs::write(crate::user::roster_path(datadir, username), out)?;
        Ok(())
    }

    /// Persist, logging on failure instead of propagating it.
    pub fn save_logged(&self, datadir: &Path, username: &str) {
        if let Err(e) = self.save(datadir, username) {
            warn!(username, error = %e, "Failed to save roster");
        }
    }
}

/// Handle a roster iq (`jabber:iq:roster`).
///
/// `get` returns the full roster. `set` adds, renames, or (with the
/// `remove` sentinel) deletes exactly one item; subscription and ask
/// are preserved across add/rename because they belong to the
/// subscription engine, not the client.
pub fn handle_roster_iq(
    config: &crate::config::Config,
    state: &mut crate::registry::ServerState,
    sid: crate::registry::SessionId,
    stanza: &Element,
) {
    use crate::error::StanzaErrorCondition;
    use crate::router::send_stanza_error;

    let Some(entry) = state.get_mut(sid) else {
        return;
    };
    if !entry.roster.loaded {
        if let Some(local) = entry.local.clone() {
            entry.roster = Roster::load(&config.datadir, &local);
        }
    }
    let local = entry.local.clone().unwrap_or_default();

    match stanza.attr("type").unwrap_or("") {
        "get" => {
            let mut query = Element::builder("query", ns::ROSTER);
            for item in entry.roster.items() {
                query = query.append(item.to_element());
            }
            let mut builder = Element::builder("iq", ns::JABBER_CLIENT).attr("type", "result");
            if let Some(id) = stanza.attr("id") {
                builder = builder.attr("id", id);
            }
            if let Some(full) = entry.full_jid(&config.domain) {
                builder = builder.attr("to", full.to_string());
            }
            entry.send_element(&builder.append(query.build()).build());
        }
        "set" => {
            let item_el = stanza
                .get_child("query", ns::ROSTER)
                .and_then(|q| q.children().find(|c| c.name() == "item"));
            let Some(item_el) = item_el else {
                send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::BadRequest);
                return;
            };
            let Some(jid) = item_el.attr("jid").and_then(|j| j.parse::<BareJid>().ok())
            else {
                send_stanza_error(config, state, sid, stanza, StanzaErrorCondition::BadRequest);
                return;
            };
            let name = item_el.attr("name").map(|s| s.to_string());

            if item_el.attr("subscription") == Some("remove") {
                entry.roster.remove(&jid);
                entry.roster.save_logged(&config.datadir, &local);
                send_set_result(entry, stanza);
                let mut removed = RosterItem::new(jid);
                removed.subscription = Subscription::Remove;
                if let Some(full) = entry.full_jid(&config.domain) {
                    entry.send_element(&build_roster_push(&full, &removed));
                }
            } else {
                let (subscription, ask) = entry
                    .roster
                    .find(&jid)
                    .map(|i| (i.subscription, i.ask_subscribe))
                    .unwrap_or((Subscription::None, false));
                if entry.roster.upsert(jid.clone(), name, subscription, ask).is_err() {
                    send_stanza_error(
                        config,
                        state,
                        sid,
                        stanza,
                        StanzaErrorCondition::InternalServerError,
                    );
                    return;
                }
                entry.roster.save_logged(&config.datadir, &local);
                send_set_result(entry, stanza);
                let item = entry.roster.find(&jid).cloned();
                if let (Some(item), Some(full)) = (item, entry.full_jid(&config.domain)) {
                    entry.send_element(&build_roster_push(&full, &item));
                }
            }
        }
        _ => {
            send_stanza_error(
                config,
                state,
                sid,
                stanza,
                StanzaErrorCondition::FeatureNotImplemented,
            );
        }
    }
}

/// Acknowledge a roster set with an empty result.
fn send_set_result(entry: &crate::registry::SessionEntry, stanza: &Element) {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT).attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    entry.send_element(&builder.build());
}

/// Build a roster push: an unsolicited `iq type='set'` addressed to the
/// user's own full JID, carrying exactly one item.
pub fn build_roster_push(to: &FullJid, item: &RosterItem) -> Element {
    let query = Element::builder("query", ns::ROSTER)
        .append(item.to_element())
        .build();
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", generate_id(8))
        .attr("to", to.to_string())
        .append(query)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[test]
    fn item_element_round_trip() {
        let item = RosterItem {
            jid: bare("bob@example.org"),
            name: Some("Bob".to_string()),
            subscription: Subscription::Both,
            ask_subscribe: true,
        };
        let el = item.to_element();
        assert_eq!(el.name(), "item");
        assert_eq!(el.ns(), ns::ROSTER);
        assert_eq!(el.attr("subscription"), Some("both"));
        assert_eq!(el.attr("ask"), Some("subscribe"));

        let back = RosterItem::from_element(&el).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn item_without_jid_is_skipped() {
        let el = Element::builder("item", ns::ROSTER)
            .attr("name", "nobody")
            .build();
        assert!(RosterItem::from_element(&el).is_none());
    }

    #[test]
    fn unknown_subscription_loads_as_none() {
        assert_eq!(Subscription::parse("bogus"), Subscription::None);
        assert_eq!(Subscription::parse("both"), Subscription::Both);
    }

    #[test]
    fn upsert_preserves_and_updates() {
        let mut roster = Roster::default();
        roster
            .upsert(bare("bob@example.org"), None, Subscription::None, true)
            .unwrap();
        roster
            .upsert(
                bare("bob@example.org"),
                Some("Bobby".to_string()),
                Subscription::From,
                false,
            )
            .unwrap();
        assert_eq!(roster.items().len(), 1);
        let item = roster.find(&bare("bob@example.org")).unwrap();
        assert_eq!(item.name.as_deref(), Some("Bobby"));
        assert_eq!(item.subscription, Subscription::From);
        assert!(!item.ask_subscribe);
    }

    #[test]
    fn roster_capacity_is_bounded() {
        let mut roster = Roster::default();
        for i in 0..MAX_ROSTER_ITEMS {
            roster
                .upsert(
                    bare(&format!("c{}@example.org", i)),
                    None,
                    Subscription::None,
                    false,
                )
                .unwrap();
        }
        assert!(roster
            .upsert(bare("extra@example.org"), None, Subscription::None, false)
            .is_err());
    }

    #[test]
    fn load_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        crate::user::create_user(dir.path(), "alice", "pw").unwrap();

        let mut roster = Roster::load(dir.path(), "alice");
        assert!(roster.loaded);
        assert!(roster.items().is_empty());

        roster
            .upsert(
                bare("bob@example.org"),
                Some("Bob".to_string()),
                Subscription::To,
                false,
            )
            .unwrap();
        roster
            .upsert(bare("carol@example.org"), None, Subscription::None, true)
            .unwrap();
        roster.save(dir.path(), "alice").unwrap();

        let reloaded = Roster::load(dir.path(), "alice");
        assert_eq!(reloaded.items(), roster.items());
    }

    #[test]
    fn load_missing_file_is_empty_but_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let roster = Roster::load(dir.path(), "ghost");
        assert!(roster.loaded);
        assert!(roster.items().is_empty());
    }

    #[test]
    fn remove_sentinel_in_push_only() {
        let full: FullJid = "alice@example.org/home".parse().unwrap();
        let mut removed = RosterItem::new(bare("bob@example.org"));
        removed.subscription = Subscription::Remove;
        let push = build_roster_push(&full, &removed);

        assert_eq!(push.name(), "iq");
        assert_eq!(push.attr("type"), Some("set"));
        assert_eq!(push.attr("to"), Some("alice@example.org/home"));
        let query = push.get_child("query", ns::ROSTER).unwrap();
        let item = query.children().next().unwrap();
        assert_eq!(item.attr("subscription"), Some("remove"));
    }
}
