//! Write handler and socket serialization (component "write", §4.8),
//! grounded in the reference source's `handlers/write.py` (`WriteHandler`
//! flattens `lastRetVal` onto `outputBuffer`) plus §4.7's custom namespace
//! stripping writer.

use minidom::{Element, Node};
use tracing::warn;

use crate::connection::OutboundPayload;
use crate::error::XmppError;
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message, OutputItem};

/// `WriteHandler.handle()`: whatever the previous handler returned becomes
/// bytes queued for the socket. Lists/singletons/empties all flatten onto
/// `msg.output_buffer`; an unhandled error is dropped (already logged by the
/// dispatcher when it found no paired error-handler).
pub async fn write_handler(_ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    match std::mem::replace(&mut msg.last_ret_val, ChainValue::Empty) {
        ChainValue::Empty => {}
        ChainValue::Stanza(el) => msg.output_buffer.push(OutputItem::Xml(el)),
        ChainValue::Stanzas(els) => msg.output_buffer.extend(els.into_iter().map(OutputItem::Xml)),
        ChainValue::Route(desc) => {
            warn!(conn_id = %msg.conn_id, "write handler received an unrouted descriptor; dropping");
            let _ = desc;
        }
        ChainValue::Error(e) => {
            warn!(conn_id = %msg.conn_id, error = %e.error, "write handler received an unhandled error; dropping");
        }
    }
    Ok(ChainValue::Empty)
}

/// Drains a finished [`Message`]'s `output_buffer` onto its connection's
/// outbound channel. This is §4.3's result queue collapsed into a direct
/// call: since at most one Message runs per connection at a time, there is
/// nothing to hand off to a separate reactor step.
pub async fn flush_output(ctx: &mut HandlerContext<'_>, msg: &mut Message) {
    for item in std::mem::take(&mut msg.output_buffer) {
        let result = match item {
            OutputItem::Xml(el) => ctx.conn.send_element(el).await,
            OutputItem::Raw(s) => ctx.conn.send_raw(s).await,
        };
        if let Err(e) = result {
            warn!(conn_id = %msg.conn_id, error = %e, "failed to queue output for write");
        }
    }
}

/// Renders one outbound payload to bytes for the socket. Elements go through
/// [`serialize_element`]; raw strings (stream headers, pre-built XML text)
/// pass through untouched.
pub fn render_payload(payload: OutboundPayload) -> String {
    match payload {
        OutboundPayload::Raw(s) => s,
        OutboundPayload::Xml(el) => serialize_element(&el),
    }
}

/// Custom writer per §4.7: strips the default `jabber:client`/`jabber:server`
/// namespace from every tag and emits an explicit `xmlns='...'` for any
/// other namespace, never falling back to the stock `nsN:` prefixing that
/// real XMPP clients can't parse.
pub fn serialize_element(el: &Element) -> String {
    let mut out = String::new();
    write_element(el, &mut out);
    out
}

fn is_default_ns(ns: &str) -> bool {
    ns.is_empty() || ns == crate::parser::ns::JABBER_CLIENT || ns == crate::parser::ns::JABBER_SERVER
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(el.name());
    let ns = el.ns();
    if !is_default_ns(&ns) {
        out.push_str(" xmlns='");
        out.push_str(&escape_text(&ns).replace('\'', "&apos;"));
        out.push('\'');
    }
    for (key, value) in el.attrs() {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }

    let mut nodes = el.nodes().peekable();
    if nodes.peek().is_none() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for node in nodes {
        match node {
            Node::Element(child) => write_element(child, out),
            Node::Text(text) => out.push_str(&escape_text(text)),
        }
    }
    out.push_str("</");
    out.push_str(el.name());
    out.push('>');
}

pub(crate) fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub(crate) fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}
