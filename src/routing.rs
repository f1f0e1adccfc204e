//! Router (component J), grounded in the reference source's
//! `ClientRouteHandler`/`ServerRouteHandler` (`handlers/route.py`): resolves
//! a routing target to either a local connection fan-out or an outbound
//! S2S link, staging a new link (`new-s2s-conn`) when none exists yet.

use jid::Jid;
use minidom::Element;
use tracing::warn;

use crate::connection::OutboundPayload;
use crate::error::XmppError;
use crate::registry::{ConnectionRegistry, S2sRegistry, SendResult};

/// What a [`crate::message::Message`] handler hands to the router: the
/// payload to deliver and where (`to`), mirroring the reference source's
/// `{'data': ..., 'to': ..., 'preprocessFunc': ...}` dict. `preprocessFunc`
/// is not modeled — every caller in this crate routes a finished stanza.
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    pub payload: OutboundPayload,
    pub to: Jid,
}

impl RouteDescriptor {
    pub fn stanza(to: Jid, el: Element) -> Self {
        RouteDescriptor { payload: OutboundPayload::Xml(el), to }
    }
}

/// Outcome of resolving a [`RouteDescriptor`]'s target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// One specific bound resource.
    LocalFull(jid::FullJid),
    /// Every bound resource of a bare JID.
    LocalBare(jid::BareJid),
    /// A remote domain, reached over S2S.
    Remote(String),
}

pub fn resolve_target(to: &Jid, own_domain: &str) -> RouteTarget {
    match to {
        Jid::Full(full) if full.domain().as_str() == own_domain => RouteTarget::LocalFull(full.clone()),
        Jid::Bare(bare) if bare.domain().as_str() == own_domain => RouteTarget::LocalBare(bare.clone()),
        Jid::Full(full) => RouteTarget::Remote(full.domain().as_str().to_string()),
        Jid::Bare(bare) => RouteTarget::Remote(bare.domain().as_str().to_string()),
    }
}

/// Ties the two connection registries to one domain. One instance per
/// [`crate::server::XmppServer`] (design decision: no global server list,
/// see DESIGN.md).
pub struct Router {
    domain: String,
    connections: std::sync::Arc<ConnectionRegistry>,
    s2s: std::sync::Arc<S2sRegistry>,
}

impl Router {
    pub fn new(domain: String, connections: std::sync::Arc<ConnectionRegistry>, s2s: std::sync::Arc<S2sRegistry>) -> Self {
        Router { domain, connections, s2s }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// `ClientRouteHandler`: delivers to every locally-bound resource the
    /// descriptor resolves to. Silently drops delivery to offline resources,
    /// matching the reference source's best-effort fan-out.
    pub async fn route_client(&self, desc: RouteDescriptor) -> Result<(), XmppError> {
        match resolve_target(&desc.to, &self.domain) {
            RouteTarget::LocalFull(full) => {
                let result = self.connections.send_to(&full, desc.payload).await;
                if !matches!(result, SendResult::Sent) {
                    warn!(to = %full, ?result, "local delivery did not reach an online resource");
                }
                Ok(())
            }
            RouteTarget::LocalBare(bare) => {
                let resources = self.connections.resources_of(&bare);
                if resources.is_empty() {
                    warn!(to = %bare, "no online resources for local bare-jid delivery");
                    return Ok(());
                }
                self.connections.send_to_many(&resources, desc.payload).await;
                Ok(())
            }
            RouteTarget::Remote(domain) => {
                Err(XmppError::routing(format!("route_client called with a remote target: {domain}")))
            }
        }
    }

    /// `ServerRouteHandler`: reuses an existing S2S link if one is
    /// connected, otherwise stages `desc` as the first queued payload of a
    /// new link and returns the target domain so the caller can kick off
    /// the `new-s2s-conn` bootstrap (dialing out, or the local-loopback
    /// shortcut when `to.domain == own hostname`).
    pub async fn route_server(&self, desc: RouteDescriptor) -> Result<Option<String>, XmppError> {
        let domain = match resolve_target(&desc.to, &self.domain) {
            RouteTarget::Remote(domain) => domain,
            RouteTarget::LocalFull(full) => return self.route_client(RouteDescriptor { payload: desc.payload, to: full.into() }).await.map(|_| None),
            RouteTarget::LocalBare(bare) => return self.route_client(RouteDescriptor { payload: desc.payload, to: bare.into() }).await.map(|_| None),
        };

        if self.s2s.is_connected(&domain) {
            if let Some(sender) = self.s2s.sender_for(&domain) {
                let _ = sender.send(crate::connection::OutboundStanza { payload: desc.payload }).await;
            }
            return Ok(None);
        }

        let needs_bootstrap = !self.s2s.has_link(&domain);
        self.s2s.stage(domain.clone(), desc.payload);
        Ok(if needs_bootstrap { Some(domain) } else { None })
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn s2s(&self) -> &S2sRegistry {
        &self.s2s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn resolve_local_full_jid() {
        let to = Jid::from_str("alice@localhost/phone").unwrap();
        assert_eq!(resolve_target(&to, "localhost"), RouteTarget::LocalFull(jid::FullJid::from_str("alice@localhost/phone").unwrap()));
    }

    #[test]
    fn resolve_remote_bare_jid() {
        let to = Jid::from_str("bob@remote.example").unwrap();
        assert_eq!(resolve_target(&to, "localhost"), RouteTarget::Remote("remote.example".to_string()));
    }

    #[tokio::test]
    async fn route_server_stages_new_link_and_reports_bootstrap() {
        let router = Router::new("localhost".into(), std::sync::Arc::new(ConnectionRegistry::new()), std::sync::Arc::new(S2sRegistry::new()));
        let desc = RouteDescriptor::stanza(Jid::from_str("bob@remote.example").unwrap(), "<message/>".parse().unwrap());
        let bootstrap = router.route_server(desc).await.unwrap();
        assert_eq!(bootstrap, Some("remote.example".to_string()));
        assert!(router.s2s().has_link("remote.example"));
    }

    #[tokio::test]
    async fn route_server_does_not_rebootstrap_an_already_staged_link() {
        let router = Router::new("localhost".into(), std::sync::Arc::new(ConnectionRegistry::new()), std::sync::Arc::new(S2sRegistry::new()));
        let desc1 = RouteDescriptor::stanza(Jid::from_str("bob@remote.example").unwrap(), "<message/>".parse().unwrap());
        let desc2 = RouteDescriptor::stanza(Jid::from_str("bob@remote.example").unwrap(), "<message/>".parse().unwrap());
        router.route_server(desc1).await.unwrap();
        let second = router.route_server(desc2).await.unwrap();
        assert_eq!(second, None);
    }
}
