//! Tracks outbound S2S links by peer domain, grounded in the reference
//! source's `server.s2sConns` dict (`handlers/route.py`'s `ServerRouteHandler`).

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::connection::OutboundStanza;

/// One staged or live outbound server-to-server link.
pub struct S2sLink {
    pub connected: bool,
    /// Stanzas queued before the link finished connecting/authenticating,
    /// drained once `connected` flips true (`new-s2s-conn`'s `queue` field).
    pub queue: Vec<crate::connection::OutboundPayload>,
    pub sender: Option<mpsc::Sender<OutboundStanza>>,
}

/// Keyed by remote domain. The local-loopback case (`to.domain == own
/// hostname`) never creates an entry here — it is short-circuited directly
/// to the C2S/local delivery path by the router.
#[derive(Default)]
pub struct S2sRegistry {
    links: DashMap<String, S2sLink>,
}

impl S2sRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_link(&self, domain: &str) -> bool {
        self.links.contains_key(domain)
    }

    pub fn is_connected(&self, domain: &str) -> bool {
        self.links.get(domain).is_some_and(|l| l.connected)
    }

    /// Stages a pending link for `domain`, queuing `payload` as its first
    /// pending delivery, mirroring `new-s2s-conn = {connected: False, ...,
    /// queue: [data]}`.
    pub fn stage(&self, domain: String, payload: crate::connection::OutboundPayload) {
        self.links
            .entry(domain)
            .or_insert_with(|| S2sLink { connected: false, queue: Vec::new(), sender: None })
            .queue
            .push(payload);
    }

    pub fn enqueue(&self, domain: &str, payload: crate::connection::OutboundPayload) {
        if let Some(mut link) = self.links.get_mut(domain) {
            link.queue.push(payload);
        }
    }

    pub fn mark_connected(&self, domain: &str, sender: mpsc::Sender<OutboundStanza>) -> Vec<crate::connection::OutboundPayload> {
        if let Some(mut link) = self.links.get_mut(domain) {
            link.connected = true;
            link.sender = Some(sender);
            std::mem::take(&mut link.queue)
        } else {
            Vec::new()
        }
    }

    pub fn sender_for(&self, domain: &str) -> Option<mpsc::Sender<OutboundStanza>> {
        self.links.get(domain).and_then(|l| l.sender.clone())
    }

    pub fn remove(&self, domain: &str) {
        self.links.remove(domain);
    }
}
