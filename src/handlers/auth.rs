//! SASL and legacy iq-auth handlers (component H), grounded in the
//! reference source's `handlers/sasl.py` / `handlers/iqauth.py`: verifies
//! credentials via [`crate::auth`] and [`crate::jid_store::JidStore`],
//! completing the connection's SASL/iq-auth scratch on success.

use jid::BareJid;
use minidom::Element;
use rand::Rng;

use crate::auth::{self, DigestMd5, DigestMd5State};
use crate::error::{generate_iq_error, SaslError, StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::handlers::HandlerContext;
use crate::message::{ChainValue, Message};
use crate::parser::ns;
use crate::types::ConnectionState;

/// A fresh per-exchange DIGEST-MD5 nonce. 16 random bytes, hex-encoded, same
/// shape as the teacher's session-id generation.
fn generate_nonce() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn challenge_element(text: String) -> Element {
    Element::builder("challenge", ns::SASL).append(text).build()
}

fn success_element() -> Element {
    Element::builder("success", ns::SASL).build()
}

fn failure_element(err: SaslError) -> Element {
    Element::builder("failure", ns::SASL)
        .append(Element::builder(err.element_name(), ns::SASL).build())
        .build()
}

/// Promotes `bare` to authenticated, shared by the PLAIN and DIGEST-MD5
/// completion paths. §4.5 requires the stream parser to be reset once SASL
/// succeeds so the client's post-auth restart opens a fresh document.
fn complete_sasl(ctx: &mut HandlerContext<'_>, bare: BareJid) {
    ctx.conn.sasl.complete = true;
    ctx.conn.sasl.in_progress = false;
    ctx.conn.user.authenticated = Some(bare);
    ctx.conn.state = ConnectionState::Authenticated;
    ctx.conn.parser.reset_parser();
}

/// Handles `<auth xmlns='...xmpp-sasl' mechanism='...'>`, the start of a
/// SASL negotiation.
pub async fn sasl_auth(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    if ctx.conn.iqauth.in_progress || ctx.conn.iqauth.complete {
        return Err(XmppError::PolicyViolation("legacy iq-auth already in progress".into()));
    }
    let stanza = msg.stanza.as_ref().ok_or_else(|| XmppError::bad_request("missing auth stanza"))?;
    let mechanism = stanza.attr("mechanism").unwrap_or_default().to_string();
    let text = stanza.text();

    match mechanism.as_str() {
        "PLAIN" => {
            let creds = auth::decode_plain(&text)?;
            let bare: BareJid = format!("{}@{}", creds.authcid, ctx.server.domain)
                .parse()
                .map_err(|_| XmppError::bad_jid("malformed authcid"))?;
            if !ctx.server.jid_store.verify_password(&bare, &creds.password).await.map_err(XmppError::from)? {
                return Err(SaslError::NotAuthorized.into());
            }
            ctx.conn.sasl.mechanism = Some("PLAIN".to_string());
            complete_sasl(ctx, bare);
            Ok(ChainValue::Stanza(success_element()))
        }
        "DIGEST-MD5" => {
            let mut digest = DigestMd5::new(ctx.server.domain.clone(), generate_nonce());
            let challenge = digest.initial_challenge();
            ctx.conn.sasl.mechanism = Some("DIGEST-MD5".to_string());
            ctx.conn.sasl.in_progress = true;
            ctx.conn.sasl.digest = Some(digest);
            Ok(ChainValue::Stanza(challenge_element(challenge)))
        }
        _ => Err(SaslError::InvalidMechanism.into()),
    }
}

/// Handles `<response xmlns='...xmpp-sasl'>`, the second and third legs of
/// the DIGEST-MD5 exchange (PLAIN completes in a single `sasl_auth` step and
/// never reaches here).
pub async fn sasl_response(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.as_ref().ok_or_else(|| XmppError::bad_request("missing response stanza"))?;
    let text = stanza.text();

    let state = ctx.conn.sasl.digest.as_ref().map(|d| d.state);
    match state {
        Some(DigestMd5State::SentChallenge1) => {
            let username = auth::peek_username(&text)?;
            let bare: BareJid = format!("{username}@{}", ctx.server.domain)
                .parse()
                .map_err(|_| XmppError::bad_jid("malformed username"))?;
            let password = ctx
                .server
                .jid_store
                .password_for(&bare)
                .await
                .map_err(XmppError::from)?
                .ok_or(SaslError::NotAuthorized)?;
            let digest = ctx.conn.sasl.digest.as_mut().expect("state checked above");
            let challenge2 = digest.verify_response(&text, &password)?;
            Ok(ChainValue::Stanza(challenge_element(challenge2)))
        }
        Some(DigestMd5State::SentChallenge2) => {
            let username = ctx
                .conn
                .sasl
                .digest
                .as_ref()
                .and_then(|d| d.username.clone())
                .ok_or(SaslError::NotAuthorized)?;
            ctx.conn.sasl.digest.as_mut().expect("state checked above").complete()?;
            let bare: BareJid = format!("{username}@{}", ctx.server.domain)
                .parse()
                .map_err(|_| XmppError::bad_jid("malformed username"))?;
            complete_sasl(ctx, bare);
            Ok(ChainValue::Stanza(success_element()))
        }
        _ => Err(SaslError::NotAuthorized.into()),
    }
}

/// Error-handler for both `sasl-auth` and `sasl-response`: turns whatever
/// failed the preceding step into a `<failure>` stanza, and abandons the
/// mechanism after repeated failures (§4.5's overflow rule).
pub async fn sasl_error(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let sasl_err = match &msg.last_ret_val {
        ChainValue::Error(e) => match e.error.as_ref() {
            XmppError::AuthFailed(se) => *se,
            _ => SaslError::TemporaryAuthFailure,
        },
        _ => SaslError::TemporaryAuthFailure,
    };
    ctx.conn.sasl.failures += 1;
    if ctx.conn.sasl.failures > 2 {
        ctx.conn.sasl.mechanism = None;
        ctx.conn.sasl.digest = None;
        ctx.conn.sasl.in_progress = false;
    }
    Ok(ChainValue::Stanza(failure_element(sasl_err)))
}

/// `<iq type='get'><query xmlns='jabber:iq:auth'/></iq>`: advertises the
/// legacy form fields (XEP-0078).
pub async fn iq_auth_get(_ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.as_ref().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    let query = Element::builder("query", ns::IQ_AUTH)
        .append(Element::builder("username", ns::IQ_AUTH).build())
        .append(Element::builder("digest", ns::IQ_AUTH).build())
        .append(Element::builder("resource", ns::IQ_AUTH).build())
        .build();
    let mut iq = Element::builder("iq", "jabber:client").attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        iq = iq.attr("id", id);
    }
    Ok(ChainValue::Stanza(iq.append(query).build()))
}

/// `<iq type='set'><query xmlns='jabber:iq:auth'>...</query></iq>`: the
/// legacy plaintext-or-digest login, completing in one round trip instead of
/// SASL's two. Failures are returned as `ChainValue::Stanza` rather than
/// propagated, since this phase has no registered error-handler.
pub async fn iq_auth_set(ctx: &mut HandlerContext<'_>, msg: &mut Message) -> Result<ChainValue, XmppError> {
    let stanza = msg.stanza.clone().ok_or_else(|| XmppError::bad_request("missing iq"))?;
    if ctx.conn.sasl.in_progress || ctx.conn.sasl.complete {
        return Ok(ChainValue::Stanza(generate_iq_error(
            &stanza,
            StanzaErrorCondition::NotAuthorized,
            StanzaErrorType::Auth,
        )));
    }
    let Some(query) = stanza.children().find(|c| c.name() == "query") else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify)));
    };
    let username = query.children().find(|c| c.name() == "username").map(|e| e.text());
    let resource = query.children().find(|c| c.name() == "resource").map(|e| e.text());
    let digest = query.children().find(|c| c.name() == "digest").map(|e| e.text());
    let password = query.children().find(|c| c.name() == "password").map(|e| e.text());

    let (Some(username), Some(resource)) = (username, resource) else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::NotAcceptable, StanzaErrorType::Modify)));
    };

    let Ok(bare) = format!("{username}@{}", ctx.server.domain).parse::<BareJid>() else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify)));
    };
    let Some(stored) = ctx.server.jid_store.password_for(&bare).await.map_err(XmppError::from)? else {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth)));
    };

    let verified = match &digest {
        Some(d) if !d.is_empty() => auth::verify_legacy_digest(&ctx.conn.id, &stored, d),
        _ => password.as_deref().map_or(false, |p| auth::verify_legacy_plain(p, &stored)),
    };
    if !verified {
        return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth)));
    }

    let full = match super::iq::bind_resource(ctx, bare.clone(), Some(resource)).await {
        Ok(full) => full,
        Err(_) => return Ok(ChainValue::Stanza(generate_iq_error(&stanza, StanzaErrorCondition::Conflict, StanzaErrorType::Cancel))),
    };
    ctx.conn.user.jid = Some(full);
    ctx.conn.iqauth.complete = true;
    ctx.conn.iqauth.mechanism = Some(if digest.is_some() { "digest" } else { "plain" });
    ctx.conn.state = ConnectionState::Bound;

    let mut iq = Element::builder("iq", "jabber:client").attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        iq = iq.attr("id", id);
    }
    Ok(ChainValue::Stanza(iq.build()))
}
