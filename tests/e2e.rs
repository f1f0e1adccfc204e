//! Full-stack loopback tests: real `TcpStream`s against a real
//! `XmppServer::bind`, exercising the wire protocol end to end rather than
//! calling handlers directly. Grounded in the teacher's
//! `waddle-xmpp/tests/interop_test.rs` and its `tests/common` harness, but
//! without TLS (out of scope, see `DESIGN.md`) and with a minimal raw-XML
//! client instead of a dedicated client library.

use std::time::Duration;

use base64::Engine;
use jid::{BareJid, FullJid};
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use stanzad::{XmppServer, XmppServerConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Starts a server on two ephemeral ports, seeding the store with
/// `alice`/`bob`, both with password `"secret"`.
async fn start_test_server(domain: &str) -> XmppServer {
    let config = XmppServerConfig {
        domain: domain.to_string(),
        c2s_bind_addr: "127.0.0.1:0".to_string(),
        s2s_bind_addr: "127.0.0.1:0".to_string(),
        store_path: ":memory:".to_string(),
        bind_retries: 1,
        worker_pool_size: 2,
        log_dir: None,
    };
    XmppServer::bind(config).await.expect("server should bind ephemeral ports")
}

async fn seed_user(server: &XmppServer, localpart: &str, domain: &str, password: &str) {
    let bare: BareJid = format!("{localpart}@{domain}").parse().unwrap();
    server.shared().jid_store.upsert(&bare, password).await.expect("seeding a user should succeed");
}

struct RawClient {
    stream: TcpStream,
    buffer: String,
}

impl RawClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("client should connect to loopback server");
        RawClient { stream, buffer: String::new() }
    }

    async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.expect("write should succeed");
        self.stream.flush().await.expect("flush should succeed");
    }

    async fn read_until(&mut self, pattern: &str) -> String {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while !self.buffer.contains(pattern) {
            let mut buf = [0u8; 4096];
            let n = timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), self.stream.read(&mut buf))
                .await
                .expect("read should not time out")
                .expect("read should not error");
            assert!(n > 0, "connection closed before pattern {pattern:?} appeared; buffer so far: {}", self.buffer);
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        self.buffer.clone()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn sasl_plain_blob(authcid: &str, password: &str) -> String {
    let raw = format!("\0{authcid}\0{password}");
    base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
}

async fn authenticate(client: &mut RawClient, domain: &str, user: &str, password: &str, resource: &str) {
    client
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
    client.read_until("</stream:features>").await;
    client.clear();

    let blob = sasl_plain_blob(user, password);
    client
        .send(&format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{blob}</auth>"))
        .await;
    client.read_until("<success").await;
    client.clear();

    client
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
    client.read_until("</stream:features>").await;
    client.clear();

    client
        .send(&format!(
            "<iq type='set' id='bind1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{resource}</resource></bind></iq>"
        ))
        .await;
    client.read_until("</iq>").await;
    client.clear();

    client.send("<iq type='set' id='sess1'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>").await;
    client.read_until("</iq>").await;
    client.clear();
}

#[tokio::test]
async fn full_handshake_then_message_delivery() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "alice", domain, "secret").await;
    seed_user(&server, "bob", domain, "secret").await;
    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut alice = RawClient::connect(addr).await;
    authenticate(&mut alice, domain, "alice", "secret", "home").await;

    let mut bob = RawClient::connect(addr).await;
    authenticate(&mut bob, domain, "bob", "secret", "phone").await;

    alice.send("<message to='bob@localhost/phone' type='chat'><body>hi</body></message>").await;
    let received = bob.read_until("</message>").await;
    assert!(received.contains("hi"));
    assert!(received.contains("from='alice@localhost/home'") || received.contains("from=\"alice@localhost/home\""));
}

/// S1 — PLAIN auth success: the bare `<auth mechanism='PLAIN'>` exchange
/// yields `<success/>` and the connection is authenticated.
#[tokio::test]
async fn s1_plain_auth_succeeds_with_correct_password() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "bob", domain, "test").await;
    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut client = RawClient::connect(addr).await;
    client
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
    client.read_until("</stream:features>").await;
    client.clear();

    let blob = sasl_plain_blob("bob", "test");
    client
        .send(&format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{blob}</auth>"))
        .await;
    let response = client.read_until("<success").await;
    assert!(response.contains("urn:ietf:params:xml:ns:xmpp-sasl"));
}

/// Negative counterpart of S1: a wrong password gets `<failure>` with
/// `not-authorized`, not `<success>`.
#[tokio::test]
async fn wrong_password_gets_a_sasl_failure() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "alice", domain, "secret").await;
    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut client = RawClient::connect(addr).await;
    client
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
    client.read_until("</stream:features>").await;
    client.clear();

    let blob = sasl_plain_blob("alice", "wrong");
    client
        .send(&format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{blob}</auth>"))
        .await;
    let response = client.read_until("<failure").await;
    assert!(response.contains("not-authorized"));
}

/// S2 — resource binding collision: a second connection requesting the
/// resource a first connection already holds gets a different resource back,
/// still prefixed by the one it asked for.
#[tokio::test]
async fn s2_resource_binding_collision_gets_a_distinct_suffix() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "alice", domain, "secret").await;
    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut first = RawClient::connect(addr).await;
    authenticate(&mut first, domain, "alice", "secret", "x").await;

    let mut second = RawClient::connect(addr).await;
    second
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
    second.read_until("</stream:features>").await;
    second.clear();
    let blob = sasl_plain_blob("alice", "secret");
    second.send(&format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{blob}</auth>")).await;
    second.read_until("<success").await;
    second.clear();
    second
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
    second.read_until("</stream:features>").await;
    second.clear();
    second
        .send("<iq type='set' id='bind2'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>x</resource></bind></iq>")
        .await;
    let response = second.read_until("</iq>").await;

    let start = response.find("<jid>").unwrap() + 5;
    let end = response.find("</jid>").unwrap();
    let bound_jid = &response[start..end];
    assert!(bound_jid.starts_with("alice@localhost/x"));
    assert_ne!(bound_jid, "alice@localhost/x");
}

/// S3 — subscription add (simplified to a single local domain so the e2e
/// harness doesn't need a second federated server): Alice subscribes to
/// Bob, both on this server. Bob receives the subscription request and
/// Alice's other resource gets a roster push.
#[tokio::test]
async fn s3_subscribe_request_reaches_contact_and_pushes_to_other_resources() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "alice", domain, "secret").await;
    seed_user(&server, "bob", domain, "secret").await;
    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut alice_home = RawClient::connect(addr).await;
    authenticate(&mut alice_home, domain, "alice", "secret", "home").await;
    let mut alice_work = RawClient::connect(addr).await;
    authenticate(&mut alice_work, domain, "alice", "secret", "work").await;
    let mut bob = RawClient::connect(addr).await;
    authenticate(&mut bob, domain, "bob", "secret", "phone").await;

    alice_home.send("<presence type='subscribe' to='bob@localhost'/>").await;

    let at_bob = bob.read_until("type='subscribe'").await;
    assert!(at_bob.contains("from='alice@localhost'") || at_bob.contains("from=\"alice@localhost\""));

    let pushed = alice_work.read_until("jabber:iq:roster").await;
    assert!(pushed.contains("ask='subscribe'") || pushed.contains("ask=\"subscribe\""));

    let owner: BareJid = "alice@localhost".parse().unwrap();
    let contact: BareJid = "bob@localhost".parse().unwrap();
    let sub = server.shared().roster.subscription_of(&owner, &contact).await.unwrap();
    assert_eq!(sub, Some(stanzad::subscription::SubState::NonePendingOut));
}

/// S4 — initial presence fan-out: Alice's first `<presence/>` reaches every
/// one of her `from`-subscribers and marks her active.
#[tokio::test]
async fn s4_initial_presence_fans_out_to_every_subscriber() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "alice", domain, "secret").await;
    seed_user(&server, "bob", domain, "secret").await;
    seed_user(&server, "carol", domain, "secret").await;

    let alice_bare: BareJid = "alice@localhost".parse().unwrap();
    for contact_name in ["bob", "carol"] {
        let contact: BareJid = format!("{contact_name}@localhost").parse().unwrap();
        server.shared().roster.upsert_contact(&contact, &alice_bare, None, &[]).await.unwrap();
        server.shared().roster.set_subscription(&contact, &alice_bare, stanzad::subscription::SubState::From).await.unwrap();
    }

    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut alice = RawClient::connect(addr).await;
    authenticate(&mut alice, domain, "alice", "secret", "home").await;
    let mut bob = RawClient::connect(addr).await;
    authenticate(&mut bob, domain, "bob", "secret", "phone").await;
    let mut carol = RawClient::connect(addr).await;
    authenticate(&mut carol, domain, "carol", "secret", "tablet").await;

    alice.send("<presence/>").await;

    let at_bob = bob.read_until("<presence").await;
    let at_carol = carol.read_until("<presence").await;
    assert!(at_bob.contains("from='alice@localhost/home'") || at_bob.contains("from=\"alice@localhost/home\""));
    assert!(at_carol.contains("from='alice@localhost/home'") || at_carol.contains("from=\"alice@localhost/home\""));
    assert!(server.shared().connections.is_active(&jid::FullJid::from_str("alice@localhost/home").unwrap()));
}

/// S5 — an `<iq>` with an unrecognized payload namespace gets bounced back
/// as `service-unavailable`, echoing the original query.
#[tokio::test]
async fn s5_unknown_iq_query_yields_service_unavailable() {
    let domain = "localhost";
    let server = start_test_server(domain).await;
    seed_user(&server, "alice", domain, "secret").await;
    let addr = server.c2s_local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut alice = RawClient::connect(addr).await;
    authenticate(&mut alice, domain, "alice", "secret", "home").await;

    alice.send("<iq type='get' id='q1'><query xmlns='urn:example:foo'/></iq>").await;
    let response = alice.read_until("</iq>").await;
    assert!(response.contains("type='error'") || response.contains("type=\"error\""));
    assert!(response.contains("service-unavailable"));
    assert!(response.contains("urn:example:foo"));
}
