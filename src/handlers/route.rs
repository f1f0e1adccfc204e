//! Thin wrappers over [`crate::routing::Router`] (component J), grounded in
//! the reference source's `handlers/route.py` (`ClientRouteHandler`,
//! `ServerRouteHandler`, `NewS2SConnHandler`). The router itself holds all
//! the resolution logic; these handlers exist only to connect it to the
//! `ChainValue::Route` values other handlers hand upward, and to kick off
//! the outbound dial when a new S2S link needs bootstrapping.

use jid::Jid;
use minidom::Element;

use crate::error::XmppError;
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message};
use crate::routing::RouteDescriptor;

/// Delivers to a local connection only, never crossing the S2S boundary.
/// Used by S2S-side handlers once a stanza's `to` has already been confirmed
/// local (an S2S peer routing to a remote-of-them, local-to-us address).
pub(super) async fn deliver_local(ctx: &mut HandlerContext<'_>, to: Jid, el: Element) -> Result<(), XmppError> {
    ctx.server.router.route_client(RouteDescriptor::stanza(to, el)).await
}

/// Delivers anywhere, crossing to S2S and kicking off a dial if this is the
/// first stanza addressed to a not-yet-linked domain.
pub(super) async fn deliver(ctx: &mut HandlerContext<'_>, to: Jid, el: Element) -> Result<(), XmppError> {
    let bootstrap_domain = ctx.server.router.route_server(RouteDescriptor::stanza(to, el)).await?;
    if let Some(domain) = bootstrap_domain {
        bootstrap_s2s(ctx, domain);
    }
    Ok(())
}

/// Spawns the outbound dial for a domain the router just staged its first
/// queued stanza for. A no-op (with a warning) if the server is already
/// shutting down and its own `Arc` can no longer be recovered.
fn bootstrap_s2s(ctx: &mut HandlerContext<'_>, domain: String) {
    match ctx.server.self_arc() {
        Some(shared) => crate::server::spawn_s2s_bootstrap(shared, domain),
        None => tracing::warn!(domain = %domain, "cannot bootstrap s2s link: server is shutting down"),
    }
}

/// `HandlerKind::RouteClient`: delivers whatever the previous step in the
/// chain staged as a [`ChainValue::Route`]. Not reached by any phase table
/// today (every current caller routes inline via [`deliver_local`]), kept so
/// the handler contract stays total over every `HandlerKind`.
pub async fn route_client(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    match msg.last_ret_val.clone() {
        ChainValue::Route(desc) => {
            ctx.server.router.route_client(desc).await?;
            Ok(ChainValue::Empty)
        }
        other => Ok(other),
    }
}

/// `HandlerKind::RouteServer`: same as [`route_client`] but crossing S2S,
/// bootstrapping a new link when needed. Kept for contract completeness; see
/// [`route_client`].
pub async fn route_server(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    match msg.last_ret_val.clone() {
        ChainValue::Route(desc) => {
            let bootstrap_domain = ctx.server.router.route_server(desc).await?;
            if let Some(domain) = bootstrap_domain {
                bootstrap_s2s(ctx, domain);
            }
            Ok(ChainValue::Empty)
        }
        other => Ok(other),
    }
}

/// `HandlerKind::NewS2SConn`: the reference source's own bootstrap trigger,
/// fired from within the handler chain rather than from [`deliver`]'s
/// side-channel spawn. Not reached by any phase table today; kept for
/// contract completeness.
pub async fn new_s2s_conn(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    match msg.last_ret_val.clone() {
        ChainValue::Route(desc) => {
            if let Jid::Full(full) = &desc.to {
                bootstrap_s2s(ctx, full.domain().as_str().to_string());
            } else if let Jid::Bare(bare) = &desc.to {
                bootstrap_s2s(ctx, bare.domain().as_str().to_string());
            }
            Ok(ChainValue::Empty)
        }
        other => Ok(other),
    }
}
