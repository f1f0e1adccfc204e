//! Per-connection state (component G), grounded in the reference source's
//! `Connection` class and its `self.data` scratch dict (`stream`, `sasl`,
//! `tls`, `user`). Extended per the design's connection-state record with
//! fields that snapshot was missing (`sasl.in-progress`, `user.active`,
//! `user.last-presence`).

use tokio::sync::mpsc;

use jid::{BareJid, FullJid};
use minidom::Element;

use crate::error::XmppError;
use crate::parser::{StreamHeader, StreamParser};
use crate::types::{ConnectionKind, ConnectionState};

/// SASL negotiation scratch state, one per connection.
#[derive(Debug, Clone, Default)]
pub struct SaslScratch {
    pub mechanism: Option<String>,
    pub in_progress: bool,
    pub complete: bool,
    /// Consecutive failed attempts; reset to 0 and the mechanism abandoned
    /// past the §4.5 overflow threshold.
    pub failures: u32,
    /// The in-progress DIGEST-MD5 exchange, if that's the mechanism in use.
    pub digest: Option<crate::auth::DigestMd5>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsScratch {
    pub enabled: bool,
    pub complete: bool,
}

/// Legacy iq-auth (XEP-0078) scratch state, tracked separately from `sasl`
/// so a client cannot complete SASL after already finishing iq-auth (or
/// vice versa) per §4.5's policy-violation rule.
#[derive(Debug, Clone, Default)]
pub struct IqAuthScratch {
    pub mechanism: Option<&'static str>,
    pub in_progress: bool,
    pub complete: bool,
}

/// Authenticated-user scratch state, populated by bind/session handlers.
#[derive(Debug, Clone, Default)]
pub struct UserScratch {
    /// Set once SASL (or legacy iq-auth) succeeds, cleared once resource
    /// binding promotes it into `jid`. Distinguishes "authenticated, not yet
    /// bound" from "never authenticated" — `jid` alone can't, since it stays
    /// `None` through both.
    pub authenticated: Option<BareJid>,
    pub jid: Option<FullJid>,
    pub in_session: bool,
    pub requested_roster: bool,
    /// True once the client has sent initial presence (RFC 6121 §4.2).
    pub active: bool,
    /// The last `<presence>` the client broadcast, re-sent verbatim to
    /// probes per the design's single-update-point decision (§9).
    pub last_presence: Option<Element>,
    /// True once the outbound probes for this resource's first available
    /// presence (§4.2) have been sent. Keeps later presence updates in the
    /// same session from re-probing the whole TO-side roster.
    pub sent_initial_probes: bool,
}

/// An item queued for delivery to a connection's write half.
#[derive(Debug, Clone)]
pub struct OutboundStanza {
    pub payload: OutboundPayload,
}

#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Xml(Element),
    Raw(String),
}

/// All per-connection mutable state, held by the task that owns the socket
/// and handed to handlers one stanza at a time via [`crate::handlers::HandlerContext`].
pub struct Connection {
    pub id: String,
    pub kind: ConnectionKind,
    pub state: ConnectionState,
    pub parser: StreamParser,
    pub stream_header: Option<StreamHeader>,
    pub peer_domain: Option<String>,
    pub sasl: SaslScratch,
    pub tls: TlsScratch,
    pub iqauth: IqAuthScratch,
    pub user: UserScratch,
    sink: mpsc::Sender<OutboundStanza>,
}

impl Connection {
    pub fn new(id: String, kind: ConnectionKind, sink: mpsc::Sender<OutboundStanza>) -> Self {
        Connection {
            id,
            kind,
            state: ConnectionState::Initial,
            parser: StreamParser::new(),
            stream_header: None,
            peer_domain: None,
            sasl: SaslScratch::default(),
            tls: TlsScratch::default(),
            iqauth: IqAuthScratch::default(),
            user: UserScratch::default(),
            sink,
        }
    }

    pub fn bound_jid(&self) -> Option<&FullJid> {
        self.user.jid.as_ref()
    }

    /// A clone of this connection's outbound sender, for handing to
    /// [`crate::registry::ConnectionRegistry::register`] on resource bind.
    pub fn sink(&self) -> mpsc::Sender<OutboundStanza> {
        self.sink.clone()
    }

    pub async fn send_element(&self, el: Element) -> Result<(), XmppError> {
        self.sink
            .send(OutboundStanza { payload: OutboundPayload::Xml(el) })
            .await
            .map_err(|_| XmppError::internal("connection write channel closed"))
    }

    pub async fn send_raw(&self, raw: String) -> Result<(), XmppError> {
        self.sink
            .send(OutboundStanza { payload: OutboundPayload::Raw(raw) })
            .await
            .map_err(|_| XmppError::internal("connection write channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_connection_starts_unauthenticated() {
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::new("c1".into(), ConnectionKind::ClientIn, tx);
        assert_eq!(conn.state, ConnectionState::Initial);
        assert!(conn.bound_jid().is_none());
        assert!(!conn.sasl.complete);
    }

    #[tokio::test]
    async fn send_element_reaches_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new("c1".into(), ConnectionKind::ClientIn, tx);
        let el: Element = "<iq/>".parse().unwrap();
        conn.send_element(el).await.unwrap();
        let item = rx.recv().await.unwrap();
        assert!(matches!(item.payload, OutboundPayload::Xml(_)));
    }
}
