//! Stream-lifecycle handlers (component C/G support), grounded in the
//! reference source's `handlers/stream.py` (`InStreamInitHandler`,
//! `FeaturesHandler`, `StreamEndHandler`, `CleanUpConnHandler`) plus §6's
//! literal stream-open wire format.
//!
//! Stream-open tags are unbalanced (`<stream:stream ...>` with no matching
//! close until the connection ends) and so cannot round-trip through
//! [`minidom::Element`] like a stanza can; handlers here push them directly
//! onto `msg.output_buffer` as [`OutputItem::Raw`] rather than going through
//! `lastRetVal`/the `Write` handler.

use minidom::Element;

use crate::error::XmppError;
use crate::handlers::write::{escape_attr, escape_text};
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message, OutputItem};
use crate::parser::ns;
use crate::types::ConnectionState;

fn stream_open_text(domain: &str, id: &str, default_ns: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream from='{from}' id='{id}' xmlns='{ns}' xmlns:stream='{stream_ns}' version='1.0'>",
        from = escape_attr(domain),
        id = escape_attr(id),
        ns = escape_attr(default_ns),
        stream_ns = ns::STREAM,
    )
}

/// `<stream:features>` advertising SASL mechanisms and legacy iq-auth,
/// announced before the client has authenticated.
fn auth_features_element() -> Element {
    let mechanisms = Element::builder("mechanisms", ns::SASL)
        .append(Element::builder("mechanism", ns::SASL).append("DIGEST-MD5".to_string()).build())
        .append(Element::builder("mechanism", ns::SASL).append("PLAIN".to_string()).build())
        .build();
    let iq_auth = Element::builder("auth", ns::IQ_AUTH_FEATURE).build();
    Element::builder("features", ns::STREAM).append(mechanisms).append(iq_auth).build()
}

/// `<stream:features>` advertising resource binding and session
/// establishment, announced on the post-SASL stream restart.
fn post_auth_features_element() -> Element {
    let bind = Element::builder("bind", ns::BIND).build();
    let session = Element::builder("session", ns::SESSION).build();
    Element::builder("features", ns::STREAM).append(bind).append(session).build()
}

/// Only reachable via the `test` phase, used by the dispatcher's own unit
/// tests to exercise a minimal handler → write round trip.
pub async fn simple_reply(_ctx: &mut HandlerContext<'_>, _msg: &mut Message) -> Result<ChainValue, XmppError> {
    Ok(ChainValue::Stanza(Element::builder("test-ack", "").build()))
}

/// First depth-1 open on an inbound connection: emits our own stream header
/// and, via the paired `FeaturesInit` handler, the pre-auth feature set.
pub async fn in_stream_init(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let default_ns = ctx.conn.kind.default_ns();
    let raw = stream_open_text(&ctx.server.domain, &ctx.conn.id, default_ns);
    msg.output_buffer.push(OutputItem::Raw(raw));
    ctx.conn.state = ConnectionState::InStream;

    if let Some(header) = ctx.conn.stream_header.clone() {
        if header.validate().is_err() {
            msg.output_buffer.push(OutputItem::Xml(crate::error::stream_errors::invalid_namespace()));
            msg.output_buffer.push(OutputItem::Raw("</stream:stream>".to_string()));
            ctx.conn.state = ConnectionState::Closing;
            msg.stop_chain = true;
        }
    }
    Ok(ChainValue::Empty)
}

/// Pre-auth feature set (`<mechanisms>` + legacy iq-auth), the `FeaturesInit`
/// step of the `in-stream-init` chain.
pub async fn features_init(_ctx: &mut HandlerContext<'_>, _msg: &mut Message) -> Result<ChainValue, XmppError> {
    Ok(ChainValue::Stanza(auth_features_element()))
}

/// Same feature set as [`features_init`], kept as its own `HandlerKind` for
/// phases that want to re-announce mechanisms without re-opening the stream.
pub async fn features_auth(_ctx: &mut HandlerContext<'_>, _msg: &mut Message) -> Result<ChainValue, XmppError> {
    Ok(ChainValue::Stanza(auth_features_element()))
}

/// Post-auth feature set (`<bind>` + `<session>`).
pub async fn features_post_auth(_ctx: &mut HandlerContext<'_>, _msg: &mut Message) -> Result<ChainValue, XmppError> {
    Ok(ChainValue::Stanza(post_auth_features_element()))
}

/// Opens our own outbound stream on a dialed S2S connection
/// (`ConnectionKind::ServerOut`/`LocalServerOut`).
pub async fn out_stream_init(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let to = ctx.conn.peer_domain.clone().unwrap_or_default();
    let raw = format!(
        "<?xml version='1.0'?><stream:stream to='{to}' from='{from}' xmlns='{ns}' xmlns:stream='{stream_ns}' version='1.0'>",
        to = escape_attr(&to),
        from = escape_attr(&ctx.server.domain),
        ns = ns::JABBER_SERVER,
        stream_ns = ns::STREAM,
    );
    msg.output_buffer.push(OutputItem::Raw(raw));
    ctx.conn.state = ConnectionState::InStream;
    Ok(ChainValue::Empty)
}

/// Second depth-1 open on an already-open parser: the post-SASL restart.
/// Re-opens the stream and announces bind/session directly, since this
/// phase carries no paired `Write` step.
pub async fn in_stream_reinit(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let default_ns = ctx.conn.kind.default_ns();
    let raw = stream_open_text(&ctx.server.domain, &ctx.conn.id, default_ns);
    msg.output_buffer.push(OutputItem::Raw(raw));
    msg.output_buffer.push(OutputItem::Xml(post_auth_features_element()));
    ctx.conn.state = ConnectionState::InStream;
    Ok(ChainValue::Empty)
}

/// Depth-1 close, or the synthetic event fed on read-EOF. Idempotent: a
/// connection already `Closing`/`Closed` gets no second close tag.
pub async fn stream_end(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    if matches!(ctx.conn.state, ConnectionState::Closing | ConnectionState::Closed) {
        return Ok(ChainValue::Empty);
    }
    ctx.conn.state = ConnectionState::Closing;
    msg.output_buffer.push(OutputItem::Raw("</stream:stream>".to_string()));
    Ok(ChainValue::Empty)
}

/// Tears down server-side bookkeeping for a closed connection: the bound
/// resource (if any) and any outbound S2S link keyed by its peer domain.
/// Idempotent (gated on `ConnectionState::Closed`) so it can run both from
/// the `stream-end` phase and from the accept loop's own EOF handling.
pub async fn cleanup_conn(ctx: &mut HandlerContext<'_>, _msg: &mut Message) -> Result<ChainValue, XmppError> {
    if ctx.conn.state == ConnectionState::Closed {
        return Ok(ChainValue::Empty);
    }
    if let Some(full) = ctx.conn.user.jid.clone() {
        ctx.server.connections.unregister(&full);
    }
    if ctx.conn.kind.is_server() {
        if let Some(domain) = ctx.conn.peer_domain.clone() {
            ctx.server.s2s.remove(&domain);
        }
    }
    ctx.conn.state = ConnectionState::Closed;
    Ok(ChainValue::Empty)
}
