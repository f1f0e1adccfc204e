//! Server bootstrap and per-connection accept loops, grounded in the
//! teacher's `waddle-xmpp::server::XmppServer` (listener setup, bind-retry,
//! per-connection task spawn) adapted to this crate's phase/dispatcher
//! pipeline instead of a fixed handler struct. TLS is explicitly out of
//! scope (§1), so listeners here are plain TCP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

pub use crate::config::XmppServerConfig;
use crate::connection::{Connection, OutboundStanza};
use crate::dispatch::{Dispatcher, DispatcherKind};
use crate::error::XmppError;
use crate::handlers::HandlerContext;
use crate::jid_store::JidStore;
use crate::parser::ParserEvent;
use crate::registry::{ConnectionRegistry, S2sRegistry};
use crate::roster::RosterStore;
use crate::routing::Router;
use crate::types::{ConnectionKind, ConnectionState};
use crate::worker_pool::WorkerPool;

static LOCAL_CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_local_id(prefix: &str) -> String {
    let n = LOCAL_CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}

/// Everything a handler may need, shared across every connection of one
/// [`XmppServer`]. Cheap to clone (every field is already an `Arc` or a
/// small value), so it is handed to connection tasks as `Arc<SharedServer>`.
pub struct SharedServer {
    pub domain: String,
    pub jid_store: JidStore,
    pub roster: RosterStore,
    pub router: Router,
    pub connections: Arc<ConnectionRegistry>,
    pub s2s: Arc<S2sRegistry>,
    pub worker_pool: WorkerPool,
    pub core_dispatcher: Arc<Dispatcher>,
    pub c2s_dispatcher: Arc<Dispatcher>,
    pub s2s_dispatcher: Arc<Dispatcher>,
    /// A handle back to this same `Arc`, so code reached only through
    /// `&SharedServer` (handler bodies) can still hand an `Arc<SharedServer>`
    /// to `tokio::spawn` when bootstrapping an outbound S2S dial.
    self_ref: Weak<SharedServer>,
}

impl SharedServer {
    pub fn new(domain: String, jid_store: JidStore, worker_pool_size: usize) -> Arc<Self> {
        let roster = RosterStore::new(jid_store.clone());
        let connections = Arc::new(ConnectionRegistry::new());
        let s2s = Arc::new(S2sRegistry::new());
        let router = Router::new(domain.clone(), connections.clone(), s2s.clone());
        Arc::new_cyclic(|self_ref| SharedServer {
            domain,
            jid_store,
            roster,
            router,
            connections,
            s2s,
            worker_pool: WorkerPool::new(worker_pool_size),
            core_dispatcher: Dispatcher::new(DispatcherKind::Core),
            c2s_dispatcher: Dispatcher::new(DispatcherKind::C2sStanza),
            s2s_dispatcher: Dispatcher::new(DispatcherKind::S2sStanza),
            self_ref: self_ref.clone(),
        })
    }

    /// Builds a `SharedServer` around an in-memory store, for tests that
    /// need a fully wired `HandlerContext` without touching disk.
    #[cfg(test)]
    pub fn for_tests(domain: String, jid_store: JidStore) -> Arc<Self> {
        SharedServer::new(domain, jid_store, 2)
    }

    fn dispatcher_for(&self, kind: ConnectionKind) -> &Arc<Dispatcher> {
        match kind {
            ConnectionKind::ClientIn => &self.c2s_dispatcher,
            _ => &self.s2s_dispatcher,
        }
    }

    /// Upgrades back to an owned `Arc`, for handler code that needs to spawn
    /// work outliving the current `&SharedServer` borrow (e.g. dialing a new
    /// S2S link). `None` only once the server itself is being dropped.
    pub fn self_arc(&self) -> Option<Arc<SharedServer>> {
        self.self_ref.upgrade()
    }
}

/// Owns the two listeners and the shared state; `run` never returns unless a
/// listener task dies.
pub struct XmppServer {
    config: XmppServerConfig,
    shared: Arc<SharedServer>,
    c2s_listener: TcpListener,
    s2s_listener: TcpListener,
}

impl XmppServer {
    /// Opens the store, binds both listeners (retrying each bind up to
    /// `config.bind_retries` times per §6), and wires the shared subsystems.
    pub async fn bind(config: XmppServerConfig) -> Result<Self, XmppError> {
        let jid_store = JidStore::open(&config.store_path)
            .await
            .map_err(XmppError::from)?;
        let shared = SharedServer::new(config.domain.clone(), jid_store, config.worker_pool_size);

        let c2s_listener = bind_with_retry(&config.c2s_bind_addr, config.bind_retries).await?;
        let s2s_listener = bind_with_retry(&config.s2s_bind_addr, config.bind_retries).await?;

        Ok(XmppServer { config, shared, c2s_listener, s2s_listener })
    }

    pub fn shared(&self) -> Arc<SharedServer> {
        self.shared.clone()
    }

    /// The address the C2S listener actually bound to (useful when
    /// `c2s_bind_addr` asked for an ephemeral port).
    pub fn c2s_local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.c2s_listener.local_addr()
    }

    /// The address the S2S listener actually bound to.
    pub fn s2s_local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.s2s_listener.local_addr()
    }

    /// Runs the C2S and S2S accept loops concurrently. Returns only if one
    /// of them exits (which only happens if `accept()` itself fails fatally).
    pub async fn run(self) -> Result<(), XmppError> {
        info!(domain = %self.config.domain, c2s = %self.config.c2s_bind_addr, s2s = %self.config.s2s_bind_addr, "xmpp server listening");

        let c2s_shared = self.shared.clone();
        let c2s_listener = self.c2s_listener;
        let c2s_handle = tokio::spawn(async move {
            accept_loop(c2s_listener, ConnectionKind::ClientIn, c2s_shared).await
        });

        let s2s_shared = self.shared.clone();
        let s2s_listener = self.s2s_listener;
        let s2s_handle = tokio::spawn(async move {
            accept_loop(s2s_listener, ConnectionKind::ServerIn, s2s_shared).await
        });

        tokio::select! {
            res = c2s_handle => res.map_err(|e| XmppError::internal(format!("c2s accept loop panicked: {e}")))?,
            res = s2s_handle => res.map_err(|e| XmppError::internal(format!("s2s accept loop panicked: {e}")))?,
        }
    }
}

async fn bind_with_retry(addr: &str, retries: u32) -> Result<TcpListener, XmppError> {
    let mut last_err = None;
    for attempt in 0..=retries {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(addr, attempt, error = %e, "bind failed, retrying");
                last_err = Some(e);
            }
        }
    }
    Err(XmppError::internal(format!(
        "failed to bind {addr} after {} attempts: {}",
        retries + 1,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn accept_loop(listener: TcpListener, kind: ConnectionKind, shared: Arc<SharedServer>) -> Result<(), XmppError> {
    let mut next_id: u64 = 0;
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        next_id += 1;
        let conn_id = format!("{}{}", kind.id_prefix(), next_id);
        let shared = shared.clone();
        tokio::spawn(
            async move {
                let (read_half, write_half) = socket.into_split();
                if let Err(e) = handle_connection(read_half, write_half, conn_id, kind, shared, None).await {
                    warn!(error = %e, "connection ended with error");
                }
            }
            .instrument(info_span!("xmpp.connection", peer = %peer_addr, kind = %kind)),
        );
    }
}

/// Spawns the background task that dials out (or loops back, for same-host
/// S2S) to establish the link `route_server` just staged, per §4.6's
/// `new-s2s-conn` bootstrap.
pub fn spawn_s2s_bootstrap(shared: Arc<SharedServer>, domain: String) {
    tokio::spawn(async move {
        if let Err(e) = dial_or_loopback(shared, domain.clone()).await {
            warn!(domain = %domain, error = %e, "s2s bootstrap failed");
        }
    });
}

/// Establishes the outbound half of an S2S link. A target equal to our own
/// domain is answered via an in-process `tokio::io::duplex` pair instead of
/// a real TCP loopback, so a single-node deployment can still federate with
/// itself (useful for tests and for directed presence between two local
/// bare-JID resources that resolved through the S2S path).
async fn dial_or_loopback(shared: Arc<SharedServer>, domain: String) -> Result<(), XmppError> {
    if domain == shared.domain {
        let (near, far) = tokio::io::duplex(4096);
        let (far_read, far_write) = tokio::io::split(far);
        let (near_read, near_write) = tokio::io::split(near);

        let in_shared = shared.clone();
        let in_domain = domain.clone();
        tokio::spawn(async move {
            let id = next_local_id(ConnectionKind::LocalServerIn.id_prefix());
            if let Err(e) =
                handle_connection(far_read, far_write, id, ConnectionKind::LocalServerIn, in_shared, Some(in_domain)).await
            {
                warn!(error = %e, "local s2s inbound side ended with error");
            }
        });

        let id = next_local_id(ConnectionKind::LocalServerOut.id_prefix());
        handle_connection(near_read, near_write, id, ConnectionKind::LocalServerOut, shared, Some(domain)).await
    } else {
        let socket = TcpStream::connect((domain.as_str(), 5269)).await.map_err(XmppError::from)?;
        let (read_half, write_half) = socket.into_split();
        let id = next_local_id(ConnectionKind::ServerOut.id_prefix());
        handle_connection(read_half, write_half, id, ConnectionKind::ServerOut, shared, Some(domain)).await
    }
}

/// One connection's full lifecycle: spawns a writer task, feeds read bytes
/// into the parser, and dispatches every event through the shared
/// dispatchers until the socket or stream closes. Generic over the
/// read/write halves so the same loop drives both real `TcpStream`s and the
/// in-process `tokio::io::duplex` halves used for same-host S2S loopback.
async fn handle_connection<R, W>(
    read_half: R,
    mut write_half: W,
    conn_id: String,
    kind: ConnectionKind,
    shared: Arc<SharedServer>,
    peer_domain: Option<String>,
) -> Result<(), XmppError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(64);

    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let bytes = crate::handlers::render_payload(item.payload);
            if let Err(e) = write_half.write_all(bytes.as_bytes()).await {
                warn!(error = %e, "socket write failed");
                break;
            }
        }
    });

    let mut conn = Connection::new(conn_id.clone(), kind, tx);
    conn.peer_domain = peer_domain;

    if matches!(kind, ConnectionKind::ServerOut | ConnectionKind::LocalServerOut) {
        let mut ctx = HandlerContext { conn: &mut conn, server: shared.as_ref() };
        shared.core_dispatcher.dispatch_known_phase(&mut ctx, "out-stream-init", None).await;
    }

    let mut read_half = read_half;
    let mut buf = [0u8; 4096];

    let result = async {
        loop {
            let n = read_half.read(&mut buf).await.map_err(XmppError::from)?;
            if n == 0 {
                let mut ctx = HandlerContext { conn: &mut conn, server: shared.as_ref() };
                shared.core_dispatcher.dispatch_known_phase(&mut ctx, "stream-end", None).await;
                return Ok(());
            }
            let events = conn.parser.feed(&buf[..n])?;
            for event in events {
                if !handle_event(&mut conn, &shared, event).await? {
                    return Ok(());
                }
            }
        }
    }
    .await;

    shared.connections.cleanup_stale();
    drop(conn);
    let _ = writer.await;
    result
}

/// Returns `Ok(false)` once the connection should stop reading (stream end).
async fn handle_event(conn: &mut Connection, shared: &Arc<SharedServer>, event: ParserEvent) -> Result<bool, XmppError> {
    match event {
        ParserEvent::StreamOpen { header, .. } => {
            conn.stream_header = Some(header);
            if matches!(conn.kind, ConnectionKind::ServerOut | ConnectionKind::LocalServerOut) {
                // The reply half of a connection we dialed: our own greeting
                // already went out via `out-stream-init`, so this is the
                // peer's header completing the handshake, not a request for
                // one of our own. Mark the link live and flush anything the
                // router staged while the dial was in flight.
                conn.state = ConnectionState::InStream;
                if let Some(domain) = conn.peer_domain.clone() {
                    let queued = shared.s2s.mark_connected(domain, conn.sink());
                    for payload in queued {
                        let _ = conn.sink().send(OutboundStanza { payload }).await;
                    }
                }
                return Ok(true);
            }
            let mut ctx = HandlerContext { conn, server: shared.as_ref() };
            shared.core_dispatcher.dispatch_known_phase(&mut ctx, "in-stream-init", None).await;
            Ok(true)
        }
        ParserEvent::StreamReinit { header } => {
            conn.stream_header = Some(header);
            let mut ctx = HandlerContext { conn, server: shared.as_ref() };
            shared.core_dispatcher.dispatch_known_phase(&mut ctx, "in-stream-reinit", None).await;
            Ok(true)
        }
        ParserEvent::Stanza(el) => {
            let dispatcher = shared.dispatcher_for(conn.kind).clone();
            let qualified = crate::dispatch::qualified_name(&el);
            let mut ctx = HandlerContext { conn, server: shared.as_ref() };
            if qualified.ends_with("}auth") || qualified.ends_with("}response") || qualified.ends_with("}abort") {
                shared.core_dispatcher.dispatch_stanza(&mut ctx, el).await;
            } else {
                dispatcher.dispatch_stanza(&mut ctx, el).await;
            }
            Ok(true)
        }
        ParserEvent::StreamEnd => {
            let mut ctx = HandlerContext { conn, server: shared.as_ref() };
            shared.core_dispatcher.dispatch_known_phase(&mut ctx, "stream-end", None).await;
            Ok(false)
        }
    }
}
