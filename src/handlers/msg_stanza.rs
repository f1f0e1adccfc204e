//! `<message>` delivery (component A), grounded in the reference source's
//! `handlers/message.py`. Delivery itself is the router's job (component
//! J); these handlers only validate the stanza has enough information to
//! route and stamp a `from`.

use jid::Jid;
use minidom::Element;

use crate::error::XmppError;
use crate::handlers::route;
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message};

fn stamp_from(mut el: Element, from: &str) -> Element {
    el.set_attr("from", from.to_string());
    el
}

/// C2S `<message>`: requires a bound sender and a resolvable `to`, then
/// routes (crossing S2S if the destination is remote). Never reaches a
/// trailing `Write` step — the sender gets no direct reply, only whatever
/// the route delivers to the recipient.
pub async fn c2s_message(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing message stanza"))?;
    let Some(full) = ctx.conn.user.jid.clone() else {
        return Err(XmppError::PolicyViolation("message sent before resource binding".into()));
    };
    let Some(to) = stanza.attr("to").and_then(|s| s.parse::<Jid>().ok()) else {
        return Err(XmppError::bad_jid("message stanza has no routable 'to'"));
    };

    let stamped = stamp_from(stanza, &full.to_string());
    route::deliver(ctx, to, stamped).await?;
    Ok(ChainValue::Empty)
}

/// S2S `<message>`: the peer is trusted to have already stamped `from`
/// correctly (dialback/TLS-cert verification is out of scope, §1); this
/// crate only checks that `to` resolves to one of our own local JIDs.
pub async fn s2s_message(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing message stanza"))?;
    let Some(to) = stanza.attr("to").and_then(|s| s.parse::<Jid>().ok()) else {
        return Err(XmppError::bad_jid("message stanza has no routable 'to'"));
    };
    route::deliver_local(ctx, to, stanza.clone()).await?;
    Ok(ChainValue::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::jid_store::JidStore;
    use crate::phases::c2s_stanza_phases;
    use crate::server::SharedServer;
    use crate::types::ConnectionKind;
    use jid::FullJid;
    use std::str::FromStr;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn c2s_message_requires_bound_resource() {
        let jids = JidStore::in_memory().await.unwrap();
        let server = SharedServer::for_tests("localhost".to_string(), jids);
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = Connection::new("c1".into(), ConnectionKind::ClientIn, tx);
        let phase = c2s_stanza_phases().by_name("message").unwrap();
        let stanza: Element = "<message to='bob@localhost'/>".parse().unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, Some(stanza));
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        let result = c2s_message(&mut ctx, &mut msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn c2s_message_stamps_from_and_delivers_locally() {
        let jids = JidStore::in_memory().await.unwrap();
        let server = SharedServer::for_tests("localhost".to_string(), jids);
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = Connection::new("c1".into(), ConnectionKind::ClientIn, tx);
        conn.user.jid = Some(FullJid::from_str("alice@localhost/home").unwrap());

        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        server.connections.register(FullJid::from_str("bob@localhost/phone").unwrap(), bob_tx);

        let phase = c2s_stanza_phases().by_name("message").unwrap();
        let stanza: Element = "<message to='bob@localhost/phone' type='chat'/>".parse().unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, Some(stanza));
        let mut ctx = HandlerContext { conn: &mut conn, server: server.as_ref() };
        c2s_message(&mut ctx, &mut msg).await.unwrap();
        assert!(bob_rx.try_recv().is_ok());
    }
}
