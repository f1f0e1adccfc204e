//! Presence broadcast and the subscription-control stanza handlers
//! (components A/I), grounded in the reference source's `handlers/presence.py`
//! and wired to [`crate::subscription::apply`] for the state machine itself.

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::warn;

use crate::connection::OutboundPayload;
use crate::error::XmppError;
use crate::handlers::route;
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message};
use crate::subscription::{self, Origin, SubEvent, SubState};

fn stamp_from(mut el: Element, from: &str) -> Element {
    el.set_attr("from", from.to_string());
    el
}

fn stamp_to(mut el: Element, to: &str) -> Element {
    el.set_attr("to", to.to_string());
    el
}

fn sub_event_for(type_attr: Option<&str>) -> Option<SubEvent> {
    match type_attr {
        Some("subscribe") => Some(SubEvent::Subscribe),
        Some("subscribed") => Some(SubEvent::Subscribed),
        Some("unsubscribe") => Some(SubEvent::Unsubscribe),
        Some("unsubscribed") => Some(SubEvent::Unsubscribed),
        _ => None,
    }
}

/// C2S `<presence>` with no subscription-control `type` (available or
/// `unavailable`): updates this resource's activity/presence cache and
/// broadcasts to every contact with an interest in it (RFC 6121 §4.2-4.3).
/// Directed presence (an explicit `to`) bypasses the broadcast and goes only
/// to that one address (§4.6).
pub async fn c2s_presence(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing presence stanza"))?;
    let Some(full) = ctx.conn.user.jid.clone() else {
        return Err(XmppError::PolicyViolation("presence sent before resource binding".into()));
    };
    let bare = full.clone().into_bare();
    let stamped = stamp_from(stanza.clone(), &full.to_string());

    if let Some(to) = stanza.attr("to").and_then(|s| s.parse::<Jid>().ok()) {
        route::deliver(ctx, to, stamped).await?;
        return Ok(ChainValue::Empty);
    }

    let was_active = ctx.conn.user.active;
    let unavailable = stanza.attr("type") == Some("unavailable");
    ctx.conn.user.active = !unavailable;
    ctx.server.connections.set_active(&full, !unavailable);
    if !unavailable {
        ctx.conn.user.last_presence = Some(stanza.clone());
        ctx.server.connections.set_presence(&full, stamped.clone());
    }

    let subscribers = ctx.server.roster.presence_subscribers(&bare).await.map_err(XmppError::from)?;
    for contact in subscribers {
        let payload = stamp_to(stamped.clone(), &contact.to_string());
        route::deliver(ctx, Jid::Bare(contact), payload).await?;
    }

    // Rebroadcast to this bare JID's other bound resources (§4.6): siblings
    // care about each other's presence even when nobody else subscribes FROM.
    let siblings: Vec<_> = ctx.server.connections.resources_of(&bare).into_iter().filter(|r| r != &full).collect();
    if !siblings.is_empty() {
        ctx.server.connections.send_to_many(&siblings, OutboundPayload::Xml(stamped.clone())).await;
    }

    // First available presence of the session: probe everyone this user
    // holds a TO-side subscription to (§4.2), once.
    if !unavailable && !was_active && !ctx.conn.user.sent_initial_probes {
        ctx.conn.user.sent_initial_probes = true;
        let targets = ctx.server.roster.subscribed_to(&bare).await.map_err(XmppError::from)?;
        for contact in targets {
            let probe = Element::builder("presence", "jabber:client")
                .attr("type", "probe")
                .attr("from", bare.to_string())
                .attr("to", contact.to_string())
                .build();
            route::deliver(ctx, Jid::Bare(contact), probe).await?;
        }
    }
    Ok(ChainValue::Empty)
}

/// S2S `<presence>` (available or `unavailable`): delivery only, since the
/// subscription state this is gated on already lives on our side of the
/// link. Drops silently (with a warning) if `to` doesn't resolve.
pub async fn s2s_presence(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing presence stanza"))?;
    let Some(to) = stanza.attr("to").and_then(|s| s.parse::<Jid>().ok()) else {
        warn!(conn_id = %ctx.conn.id, "s2s presence with no routable 'to'; dropping");
        return Ok(ChainValue::Empty);
    };
    route::deliver_local(ctx, to, stanza).await?;
    Ok(ChainValue::Empty)
}

/// C2S subscription-control stanza (`subscribe`/`subscribed`/`unsubscribe`/
/// `unsubscribed`): advances the roster item's [`SubState`] and relays the
/// request onward if the automaton says to (RFC 6121 §3).
pub async fn c2s_subscription(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing presence stanza"))?;
    let Some(full) = ctx.conn.user.jid.clone() else {
        return Err(XmppError::PolicyViolation("subscription request sent before resource binding".into()));
    };
    let Some(event) = sub_event_for(stanza.attr("type")) else {
        return Err(XmppError::bad_request("not a subscription-control presence"));
    };
    let Some(Ok(contact)) = stanza.attr("to").map(|s| s.parse::<BareJid>()) else {
        return Err(XmppError::bad_jid("subscription request has no routable 'to'"));
    };

    let owner = full.into_bare();
    let current = ctx.server.roster.subscription_of(&owner, &contact).await.map_err(XmppError::from)?.unwrap_or(SubState::None);
    let transition = subscription::apply(current, event, Origin::Local);
    ctx.server.roster.set_subscription(&owner, &contact, transition.next).await.map_err(XmppError::from)?;

    if transition.relay {
        let payload = stamp_to(stamp_from(stanza, &owner.to_string()), &contact.to_string());
        route::deliver(ctx, Jid::Bare(contact), payload).await?;
    }
    Ok(ChainValue::Empty)
}

/// S2S subscription-control stanza: same automaton, run with [`Origin::Remote`].
/// A `relay` outcome here only arises from re-confirming an already-granted
/// subscription (RFC 6121 §3.1.3); a `deliver` outcome fans the stanza out to
/// every bound resource of the local owner.
pub async fn s2s_subscription(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing presence stanza"))?;
    let Some(event) = sub_event_for(stanza.attr("type")) else {
        return Err(XmppError::bad_request("not a subscription-control presence"));
    };
    let Some(Ok(owner)) = stanza.attr("to").map(|s| s.parse::<BareJid>()) else {
        warn!(conn_id = %ctx.conn.id, "s2s subscription with no routable 'to'; dropping");
        return Ok(ChainValue::Empty);
    };
    let Some(Ok(contact)) = stanza.attr("from").map(|s| s.parse::<BareJid>()) else {
        warn!(conn_id = %ctx.conn.id, "s2s subscription with no 'from'; dropping");
        return Ok(ChainValue::Empty);
    };

    let current = ctx.server.roster.subscription_of(&owner, &contact).await.map_err(XmppError::from)?.unwrap_or(SubState::None);
    let transition = subscription::apply(current, event, Origin::Remote);
    ctx.server.roster.set_subscription(&owner, &contact, transition.next).await.map_err(XmppError::from)?;

    if transition.relay && event == SubEvent::Subscribe {
        let confirm = Element::builder("presence", "jabber:server")
            .attr("type", "subscribed")
            .attr("from", owner.to_string())
            .attr("to", contact.to_string())
            .build();
        route::deliver(ctx, Jid::Bare(contact.clone()), confirm).await?;
    }

    if transition.deliver {
        let targets = ctx.server.connections.resources_of(&owner);
        if targets.is_empty() {
            warn!(to = %owner, "subscription-control stanza has no bound resource to reach");
        } else {
            let payload = stamp_to(stamp_from(stanza, &contact.to_string()), &owner.to_string());
            ctx.server.connections.send_to_many(&targets, OutboundPayload::Xml(payload)).await;
        }
    }
    Ok(ChainValue::Empty)
}

/// S2S presence probe (RFC 6121 §4.3): answers with every active resource's
/// cached presence if the prober is entitled to see it (has a `from`
/// subscription), otherwise stays silent rather than leaking activity.
pub async fn s2s_probe(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing presence stanza"))?;
    let Some(Ok(owner)) = stanza.attr("to").map(|s| s.parse::<BareJid>()) else {
        warn!(conn_id = %ctx.conn.id, "s2s probe with no routable 'to'; dropping");
        return Ok(ChainValue::Empty);
    };
    let Some(Ok(contact)) = stanza.attr("from").map(|s| s.parse::<BareJid>()) else {
        warn!(conn_id = %ctx.conn.id, "s2s probe with no 'from'; dropping");
        return Ok(ChainValue::Empty);
    };

    let sub = ctx.server.roster.subscription_of(&owner, &contact).await.map_err(XmppError::from)?.unwrap_or(SubState::None);
    if !sub.has_from() {
        return Ok(ChainValue::Empty);
    }

    let active = ctx.server.connections.active_resources_of(&owner);
    if active.is_empty() {
        let unavailable = Element::builder("presence", "jabber:server")
            .attr("type", "unavailable")
            .attr("from", owner.to_string())
            .attr("to", contact.to_string())
            .build();
        route::deliver(ctx, Jid::Bare(contact), unavailable).await?;
        return Ok(ChainValue::Empty);
    }

    for full in active {
        let presence = ctx.server.connections.presence_for(&full).unwrap_or_else(|| {
            Element::builder("presence", "jabber:server").attr("from", full.to_string()).build()
        });
        let payload = stamp_to(stamp_from(presence, &full.to_string()), &contact.to_string());
        route::deliver(ctx, Jid::Bare(contact.clone()), payload).await?;
    }
    Ok(ChainValue::Empty)
}
