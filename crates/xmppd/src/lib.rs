//! # xmppd
//!
//! A single-domain XMPP instant-messaging server implementing the
//! client-to-server subset of RFC 6120/6121 for a small user population.
//!
//! ## Architecture
//!
//! - **Server**: plain-TCP listener on port 5222 (C2S only, no federation)
//! - **Connections**: one tokio task per client owning the stream framer,
//!   plus a writer task draining that session's outbound queue
//! - **State**: all live-session bookkeeping (rosters, presence, routing)
//!   behind a single [`registry::ServerState`] lock, so stanza handlers
//!   run atomically with respect to each other
//! - **Storage**: flat per-user directories (`user.conf`, `roster.xml`,
//!   `offline/`)
//!
//! ## Protocol support
//!
//! - RFC 6120 streams, SASL PLAIN, resource binding
//! - RFC 6121 rosters, presence subscriptions, message delivery
//! - XEP-0030 service discovery (static identity/features)
//! - XEP-0077 in-band registration
//! - XEP-0203 delayed delivery stamps on offline messages

pub mod auth;
pub mod config;
pub mod connection;
pub mod disco;
pub mod message;
pub mod parser;
pub mod presence;
pub mod register;
pub mod registry;
pub mod roster;
pub mod router;
pub mod server;
pub mod session;
pub mod stream;
pub mod user;
pub mod util;

mod error;
mod types;

pub use config::Config;
pub use error::{stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError};
pub use parser::{ns, StreamHeader};
pub use server::Server;
pub use types::SessionState;
