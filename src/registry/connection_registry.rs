//! Maps every bound full JID to its connection's outbound channel, plus a
//! small presence cache (component G support) used to answer S2S probes and
//! to fan presence out only to the resources that asked for it.
//!
//! Adapted from the connection-registry pattern: a `DashMap` keyed by
//! [`FullJid`] instead of a raw connection id, since routing (component J)
//! always resolves to a specific resource (or fans out across every
//! resource of a bare JID) rather than to a raw connection.

use dashmap::DashMap;
use jid::{BareJid, FullJid};
use minidom::Element;
use tracing::instrument;

use crate::connection::{OutboundPayload, OutboundStanza};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    NotConnected,
    ChannelFull,
    ChannelClosed,
}

/// One locally-bound resource's outbound channel plus the presence state
/// needed to answer a probe without round-tripping to the connection's own
/// task (`user.active`/`user.last-presence`, mirrored here for cross-task
/// reads).
struct Entry {
    sender: tokio::sync::mpsc::Sender<OutboundStanza>,
    active: bool,
    last_presence: Option<Element>,
}

/// Process-wide table of locally-connected, bound resources.
pub struct ConnectionRegistry {
    connections: DashMap<FullJid, Entry>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry { connections: DashMap::new() }
    }

    #[instrument(skip(self, sender))]
    pub fn register(&self, jid: FullJid, sender: tokio::sync::mpsc::Sender<OutboundStanza>) {
        self.connections.insert(jid, Entry { sender, active: false, last_presence: None });
    }

    pub fn unregister(&self, jid: &FullJid) {
        self.connections.remove(jid);
    }

    pub fn is_connected(&self, jid: &FullJid) -> bool {
        self.connections.contains_key(jid)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Every bound resource sharing `bare`'s node+domain, for broadcast
    /// fan-out and roster-push.
    pub fn resources_of(&self, bare: &BareJid) -> Vec<FullJid> {
        self.connections
            .iter()
            .map(|e| e.key().clone())
            .filter(|full| &full.clone().into_bare() == bare)
            .collect()
    }

    /// Like [`Self::resources_of`], narrowed to resources that have sent
    /// initial presence (RFC 6121 §4.2) — the set an incoming S2S probe or
    /// presence broadcast should actually reach.
    pub fn active_resources_of(&self, bare: &BareJid) -> Vec<FullJid> {
        self.connections
            .iter()
            .filter(|e| e.value().active && &e.key().clone().into_bare() == bare)
            .map(|e| e.key().clone())
            .collect()
    }

    pub async fn send_to(&self, jid: &FullJid, payload: OutboundPayload) -> SendResult {
        let Some(sender) = self.connections.get(jid).map(|e| e.sender.clone()) else {
            return SendResult::NotConnected;
        };
        match sender.try_send(OutboundStanza { payload }) {
            Ok(()) => SendResult::Sent,
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => SendResult::ChannelFull,
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                self.connections.remove(jid);
                SendResult::ChannelClosed
            }
        }
    }

    pub async fn send_to_many(&self, jids: &[FullJid], payload: OutboundPayload) -> Vec<(FullJid, SendResult)> {
        let mut results = Vec::with_capacity(jids.len());
        for jid in jids {
            results.push((jid.clone(), self.send_to(jid, payload.clone()).await));
        }
        results
    }

    pub fn list_connections(&self) -> Vec<FullJid> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn cleanup_stale(&self) {
        self.connections.retain(|_, entry| !entry.sender.is_closed());
    }

    /// Marks a resource active/inactive, tracking whether it has sent
    /// initial presence. A no-op if the resource isn't registered.
    pub fn set_active(&self, jid: &FullJid, active: bool) {
        if let Some(mut entry) = self.connections.get_mut(jid) {
            entry.active = active;
        }
    }

    pub fn is_active(&self, jid: &FullJid) -> bool {
        self.connections.get(jid).is_some_and(|e| e.active)
    }

    /// Caches the last `<presence>` a resource broadcast, so a later S2S
    /// probe can be answered without asking the connection's own task.
    pub fn set_presence(&self, jid: &FullJid, presence: Element) {
        if let Some(mut entry) = self.connections.get_mut(jid) {
            entry.last_presence = Some(presence);
        }
    }

    pub fn presence_for(&self, jid: &FullJid) -> Option<Element> {
        self.connections.get(jid).and_then(|e| e.last_presence.clone())
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").field("count", &self.connections.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn jid(s: &str) -> FullJid {
        FullJid::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn register_then_send_succeeds() {
        let reg = ConnectionRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        reg.register(jid("a@x/r1"), tx);
        assert!(reg.is_connected(&jid("a@x/r1")));
        let result = reg.send_to(&jid("a@x/r1"), OutboundPayload::Raw("hi".into())).await;
        assert_eq!(result, SendResult::Sent);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_to_unregistered_jid_is_not_connected() {
        let reg = ConnectionRegistry::new();
        let result = reg.send_to(&jid("nobody@x/r"), OutboundPayload::Raw("hi".into())).await;
        assert_eq!(result, SendResult::NotConnected);
    }

    #[tokio::test]
    async fn send_to_closed_channel_removes_entry() {
        let reg = ConnectionRegistry::new();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        drop(rx);
        reg.register(jid("a@x/r1"), tx);
        let result = reg.send_to(&jid("a@x/r1"), OutboundPayload::Raw("hi".into())).await;
        assert_eq!(result, SendResult::ChannelClosed);
        assert!(!reg.is_connected(&jid("a@x/r1")));
    }

    #[tokio::test]
    async fn resources_of_bare_jid_returns_all_full_jids() {
        let reg = ConnectionRegistry::new();
        let (tx1, _r1) = tokio::sync::mpsc::channel(4);
        let (tx2, _r2) = tokio::sync::mpsc::channel(4);
        reg.register(jid("a@x/r1"), tx1);
        reg.register(jid("a@x/r2"), tx2);
        let bare = BareJid::from_str("a@x").unwrap();
        let mut found = reg.resources_of(&bare);
        found.sort_by_key(|j| j.resource().to_string());
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn cleanup_stale_removes_closed_channels() {
        let reg = ConnectionRegistry::new();
        let (tx, rx) = tokio::sync::mpsc::channel::<OutboundStanza>(4);
        drop(rx);
        reg.register(jid("a@x/r1"), tx);
        reg.cleanup_stale();
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn active_resources_only_include_resources_with_initial_presence() {
        let reg = ConnectionRegistry::new();
        let (tx1, _r1) = tokio::sync::mpsc::channel(4);
        let (tx2, _r2) = tokio::sync::mpsc::channel(4);
        reg.register(jid("a@x/r1"), tx1);
        reg.register(jid("a@x/r2"), tx2);
        reg.set_active(&jid("a@x/r1"), true);
        let bare = BareJid::from_str("a@x").unwrap();
        let active = reg.active_resources_of(&bare);
        assert_eq!(active, vec![jid("a@x/r1")]);
    }

    #[test]
    fn presence_is_cached_and_retrievable() {
        let reg = ConnectionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        reg.register(jid("a@x/r1"), tx);
        assert!(reg.presence_for(&jid("a@x/r1")).is_none());
        let presence: Element = "<presence/>".parse().unwrap();
        reg.set_presence(&jid("a@x/r1"), presence);
        assert!(reg.presence_for(&jid("a@x/r1")).is_some());
    }
}
