//! Resource binding, session establishment, and roster management handlers
//! (components C/B), grounded in the reference source's `handlers/bind.py`,
//! `handlers/session.py`, and `handlers/roster.py`.

use jid::{BareJid, FullJid};
use minidom::Element;
use rand::Rng;

use crate::connection::OutboundPayload;
use crate::error::{generate_iq_error, StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message};
use crate::parser::ns;

/// `<iq type='get|set'>` whose payload no phase claims: RFC 6120 §8.4's
/// unknown-namespace fallback.
pub async fn iq_not_implemented(_ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.as_ref().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    Ok(ChainValue::Stanza(generate_iq_error(
        stanza,
        StanzaErrorCondition::ServiceUnavailable,
        StanzaErrorType::Cancel,
    )))
}

/// Binds `bare` to a resource (§4.2's collision-suffix retry), registering
/// the connection's outbound sender under the resulting full JID. Shared by
/// SASL resource binding and legacy iq-auth, which both end in the same
/// connection-registry entry.
pub(super) async fn bind_resource(
    ctx: &mut HandlerContext<'_>,
    bare: BareJid,
    requested: Option<String>,
) -> Result<FullJid, XmppError> {
    let requested = requested.filter(|r| !r.is_empty());
    let mut resource = requested.clone().unwrap_or_else(generate_resource);
    let mut full = bare.clone().with_resource(resource.clone());

    // §4.2: a requested resource already bound elsewhere gets a random
    // suffix appended rather than being rejected outright.
    let mut attempts = 0;
    while ctx.server.connections.is_connected(&full) {
        attempts += 1;
        if attempts > 10 {
            return Err(XmppError::routing("could not allocate a free resource"));
        }
        resource = format!("{resource}-{}", hex::encode(rand::thread_rng().gen::<[u8; 2]>()));
        full = bare.clone().with_resource(resource.clone());
    }

    ctx.server.connections.register(full.clone(), ctx.conn.sink());
    Ok(full)
}

fn generate_resource() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    format!("stanzad-{}", hex::encode(bytes))
}

/// `<iq type='set'><bind xmlns='...xmpp-bind'>...</bind></iq>`: resource
/// binding for a SASL-authenticated connection (§4.2).
pub async fn iq_bind(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    let Some(bare) = ctx.conn.user.authenticated.clone() else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth)));
    };

    let requested = stanza
        .children()
        .find(|c| c.name() == "bind")
        .and_then(|bind| bind.children().find(|c| c.name() == "resource"))
        .map(|e| e.text());

    let full = match bind_resource(ctx, bare, requested).await {
        Ok(full) => full,
        Err(_) => return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::Conflict, StanzaErrorType::Cancel))),
    };

    ctx.conn.user.jid = Some(full.clone());
    ctx.conn.user.authenticated = None;
    ctx.conn.state = crate::types::ConnectionState::Bound;

    let jid_el = Element::builder("jid", ns::BIND).append(full.to_string()).build();
    let bind = Element::builder("bind", ns::BIND).append(jid_el).build();
    let mut iq = Element::builder("iq", "jabber:client").attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        iq = iq.attr("id", id);
    }
    Ok(ChainValue::Stanza(iq.append(bind).build()))
}

/// `<iq type='set'><session xmlns='...xmpp-session'/></iq>`: the RFC 3921
/// session-establishment no-op, kept for clients that still send it.
pub async fn iq_session(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    ctx.conn.user.in_session = true;
    let mut iq = Element::builder("iq", "jabber:client").attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        iq = iq.attr("id", id);
    }
    Ok(ChainValue::Stanza(iq.build()))
}

/// `<iq type='get'><query xmlns='jabber:iq:roster'/></iq>`: full roster
/// retrieval (RFC 6121 §2.1.3).
pub async fn iq_roster_get(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    let Some(full) = ctx.conn.user.jid.clone() else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth)));
    };
    let bare = full.into_bare();
    let items = ctx.server.roster.full_roster(&bare).await.map_err(XmppError::from)?;
    ctx.conn.user.requested_roster = true;

    let mut query = Element::builder("query", ns::IQ_ROSTER);
    for item in &items {
        query = query.append(item.to_element());
    }
    let mut iq = Element::builder("iq", "jabber:client").attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        iq = iq.attr("id", id);
    }
    Ok(ChainValue::Stanza(iq.append(query.build()).build()))
}

/// `<iq type='set'><query xmlns='jabber:iq:roster'><item .../></query></iq>`:
/// a roster-management push from the owner's own client (RFC 6121 §2.1.6,
/// §2.5). The paired `roster-push` handler fans the update out to every
/// other resource of the same bare JID once this step acks it.
pub async fn iq_roster_update(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    let Some(full) = ctx.conn.user.jid.clone() else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth)));
    };
    let bare = full.into_bare();

    let Some(query) = stanza.children().find(|c| c.name() == "query") else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify)));
    };
    let Some(item) = query.children().find(|c| c.name() == "item") else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify)));
    };
    let Some(Ok(contact)) = item.attr("jid").map(|s| s.parse::<BareJid>()) else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify)));
    };

    if item.attr("subscription") == Some("remove") {
        ctx.server.roster.remove_contact(&bare, &contact).await.map_err(XmppError::from)?;
    } else {
        let name = item.attr("name");
        let groups: Vec<String> = item.children().filter(|c| c.name() == "group").map(|g| g.text()).collect();
        ctx.server.roster.upsert_contact(&bare, &contact, name, &groups).await.map_err(XmppError::from)?;
    }

    let mut iq = Element::builder("iq", "jabber:client").attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        iq = iq.attr("id", id);
    }
    Ok(ChainValue::Stanza(iq.build()))
}

/// Error-handler-free follow-on to [`iq_roster_update`]: re-reads the
/// touched contact's current state and pushes it to every other bound
/// resource of the roster owner (RFC 6121 §2.1.6's roster-push requirement),
/// then passes the preceding ack through unchanged.
pub async fn roster_push(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let ack = msg.last_ret_val.clone();
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    let Some(full) = ctx.conn.user.jid.clone() else {
        return Ok(ack);
    };
    let bare = full.clone().into_bare();

    let Some(query) = stanza.children().find(|c| c.name() == "query") else {
        return Ok(ack);
    };
    let Some(item) = query.children().find(|c| c.name() == "item") else {
        return Ok(ack);
    };
    let Some(Ok(contact)) = item.attr("jid").map(|s| s.parse::<BareJid>()) else {
        return Ok(ack);
    };

    let push_item = if item.attr("subscription") == Some("remove") {
        Element::builder("item", ns::IQ_ROSTER).attr("jid", contact.to_string()).attr("subscription", "remove").build()
    } else {
        let sub = ctx.server.roster.subscription_of(&bare, &contact).await.map_err(XmppError::from)?.unwrap_or(crate::subscription::SubState::None);
        let roster_item = crate::roster::RosterItem {
            contact: contact.clone(),
            name: item.attr("name").map(str::to_string),
            subscription: sub,
            groups: item.children().filter(|c| c.name() == "group").map(|g| g.text()).collect(),
        };
        roster_item.to_element()
    };

    let push = Element::builder("iq", "jabber:client")
        .attr("type", "set")
        .attr("id", format!("push-{}", push_id()))
        .append(Element::builder("query", ns::IQ_ROSTER).append(push_item).build())
        .build();

    let targets: Vec<_> = ctx.server.connections.resources_of(&bare).into_iter().filter(|r| r != &full).collect();
    if !targets.is_empty() {
        ctx.server.connections.send_to_many(&targets, OutboundPayload::Xml(push)).await;
    }

    Ok(ack)
}

fn push_id() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::jid_store::JidStore;
    use crate::phases::c2s_stanza_phases;
    use crate::server::SharedServer;
    use crate::types::{ConnectionKind, ConnectionState};
    use std::str::FromStr;
    use tokio::sync::mpsc;

    async fn ctx_fixture() -> (std::sync::Arc<SharedServer>, Connection, mpsc::Receiver<crate::connection::OutboundStanza>) {
        let jids = JidStore::in_memory().await.unwrap();
        let server = SharedServer::for_tests("localhost".to_string(), jids);
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection::new("c1".into(), ConnectionKind::ClientIn, tx);
        (server, conn, rx)
    }

    #[tokio::test]
    async fn bind_without_requested_resource_generates_one() {
        let (server, mut conn, _rx) = ctx_fixture().await;
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let bare = BareJid::from_str("alice@localhost").unwrap();
        let full = bind_resource(&mut ctx, bare.clone(), None).await.unwrap();
        assert_eq!(full.clone().into_bare(), bare);
        assert!(server.connections.is_connected(&full));
    }

    #[tokio::test]
    async fn bind_with_colliding_resource_gets_a_suffix() {
        let (server, mut conn, _rx) = ctx_fixture().await;
        let bare = BareJid::from_str("alice@localhost").unwrap();
        let taken = FullJid::from_str("alice@localhost/phone").unwrap();
        let (tx2, _rx2) = mpsc::channel(8);
        server.connections.register(taken.clone(), tx2);

        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let full = bind_resource(&mut ctx, bare, Some("phone".to_string())).await.unwrap();
        assert_ne!(full, taken);
    }

    #[tokio::test]
    async fn iq_bind_requires_prior_authentication() {
        let (server, mut conn, _rx) = ctx_fixture().await;
        let phase = c2s_stanza_phases().by_name("iq-bind").unwrap();
        let stanza: Element = "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>".parse().unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, Some(stanza));
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let result = iq_bind(&mut ctx, &mut msg).await.unwrap();
        match result {
            ChainValue::Stanza(el) => {
                let err = el.children().find(|c| c.name() == "error").unwrap();
                assert!(err.children().any(|c| c.name() == "not-authorized"));
            }
            _ => panic!("expected stanza"),
        }
    }

    #[tokio::test]
    async fn iq_bind_succeeds_after_authentication() {
        let (server, mut conn, _rx) = ctx_fixture().await;
        conn.user.authenticated = Some(BareJid::from_str("alice@localhost").unwrap());
        conn.state = ConnectionState::Authenticated;
        let phase = c2s_stanza_phases().by_name("iq-bind").unwrap();
        let stanza: Element = "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>home</resource></bind></iq>"
            .parse()
            .unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, Some(stanza));
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let result = iq_bind(&mut ctx, &mut msg).await.unwrap();
        match result {
            ChainValue::Stanza(el) => {
                let bind = el.children().find(|c| c.name() == "bind").unwrap();
                let jid_el = bind.children().find(|c| c.name() == "jid").unwrap();
                assert_eq!(jid_el.text(), "alice@localhost/home");
            }
            _ => panic!("expected stanza"),
        }
        assert_eq!(conn.user.jid, Some(FullJid::from_str("alice@localhost/home").unwrap()));
        assert_eq!(conn.state, ConnectionState::Bound);
    }

    #[tokio::test]
    async fn roster_get_requires_bound_jid() {
        let (server, mut conn, _rx) = ctx_fixture().await;
        let phase = c2s_stanza_phases().by_name("iq-roster-get").unwrap();
        let stanza: Element = "<iq type='get' id='r1'><query xmlns='jabber:iq:roster'/></iq>".parse().unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, Some(stanza));
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let result = iq_roster_get(&mut ctx, &mut msg).await.unwrap();
        assert!(matches!(result, ChainValue::Stanza(_)));
    }

    #[tokio::test]
    async fn roster_update_then_push_reaches_other_resource() {
        let (server, mut conn, _rx) = ctx_fixture().await;
        let full = FullJid::from_str("alice@localhost/home").unwrap();
        conn.user.jid = Some(full.clone());
        let (tx2, mut rx2) = mpsc::channel(8);
        server.connections.register(FullJid::from_str("alice@localhost/phone").unwrap(), tx2);

        let phase = c2s_stanza_phases().by_name("iq-roster-update").unwrap();
        let stanza: Element =
            "<iq type='set' id='u1'><query xmlns='jabber:iq:roster'><item jid='bob@localhost' name='Bob'/></query></iq>"
                .parse()
                .unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, Some(stanza));
        {
            let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
            let ack = iq_roster_update(&mut ctx, &mut msg).await.unwrap();
            msg.set_result(Ok(ack));
        }
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let passthrough = roster_push(&mut ctx, &mut msg).await.unwrap();
        assert!(matches!(passthrough, ChainValue::Stanza(_)));
        assert!(rx2.try_recv().is_ok());
    }
}
