//! Core stanza-processing engine for a small XMPP (RFC 3920/3921) server.
//!
//! The crate is organized around the four subsystems described in the
//! design: the streaming parser ([`parser`]), the phase/handler pipeline
//! ([`phases`], [`message`], [`dispatch`], [`handlers`]), the
//! subscription automaton ([`subscription`], [`roster`]), and the router
//! ([`routing`]). [`connection`] and [`server`] wire these together over
//! real sockets.

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod jid_store;
pub mod message;
pub mod parser;
pub mod phases;
pub mod registry;
pub mod roster;
pub mod routing;
pub mod server;
pub mod subscription;
pub mod types;
pub mod worker_pool;

pub use error::XmppError;
pub use parser::{ns, StreamHeader, StreamParser};
pub use routing::{RouteDescriptor, RouteTarget, Router};
pub use server::{XmppServer, XmppServerConfig};
pub use types::{ConnectionKind, ConnectionState};
