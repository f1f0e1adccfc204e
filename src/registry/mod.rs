//! Global, process-wide lookup tables (component G support), grounded in
//! the reference source's `server.data['resources']` and `s2sConns` dicts.

mod connection_registry;
mod s2s_registry;

pub use connection_registry::{ConnectionRegistry, SendResult};
pub use s2s_registry::S2sRegistry;
