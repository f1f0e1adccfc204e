//! SASL and legacy iq-auth mechanics (component H), grounded in the
//! reference source's `auth_mechanisms.py` (`SASLPlain`, `SASLDigestMD5`,
//! `IQAuthPlain`/`IQAuthDigest`). Kept free of any database access: these
//! functions take the already-looked-up password and return a verdict or
//! the next protocol element, leaving credential lookup to
//! [`crate::jid_store::JidStore`] in the calling handler.

use std::collections::HashMap;

use base64::Engine;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::SaslError;

/// RFC 3920 §14.9: base64 text restricted to the base64 alphabet, with
/// padding only in the last one or two characters. Rejecting anything else
/// closes off a covert channel through non-canonical padding.
fn is_strict_base64(s: &str) -> bool {
    let bytes = s.as_bytes();
    let body_end = bytes.iter().rposition(|&b| b != b'=').map_or(0, |i| i + 1);
    let pad_len = bytes.len() - body_end;
    if pad_len > 2 {
        return false;
    }
    bytes[..body_end].iter().all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>, SaslError> {
    if !is_strict_base64(s) {
        return Err(SaslError::IncorrectEncoding);
    }
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|_| SaslError::IncorrectEncoding)
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// The decoded `authzid\0authcid\0password` triple from a PLAIN response.
pub struct PlainCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: String,
}

/// Decodes and splits a PLAIN SASL response. An empty `b64text` (the
/// client hasn't sent its response yet) is not valid here — the caller must
/// request one via a SASL challenge first, matching `jabber:iq:auth`-style
/// mechanisms' two-step flow instead.
pub fn decode_plain(b64text: &str) -> Result<PlainCredentials, SaslError> {
    let raw = decode_base64(b64text)?;
    let text = String::from_utf8(raw).map_err(|_| SaslError::IncorrectEncoding)?;
    let parts: Vec<&str> = text.split('\0').collect();
    if parts.len() != 3 {
        return Err(SaslError::IncorrectEncoding);
    }
    Ok(PlainCredentials {
        authzid: parts[0].to_string(),
        authcid: parts[1].to_string(),
        password: parts[2].to_string(),
    })
}

fn h(s: &[u8]) -> [u8; 16] {
    let digest = Md5::digest(s);
    digest.into()
}

fn hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn kd(k: &str, s: &str) -> [u8; 16] {
    h(format!("{k}:{s}").as_bytes())
}

/// Digest-MD5's three-step state machine (RFC 2831). One instance lives in
/// a connection's SASL scratch for the duration of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestMd5State {
    Init,
    SentChallenge1,
    SentChallenge2,
}

impl Default for DigestMd5State {
    fn default() -> Self {
        DigestMd5State::Init
    }
}

#[derive(Debug, Clone)]
pub struct DigestMd5 {
    pub state: DigestMd5State,
    pub nonce: String,
    pub realm: String,
    pub username: Option<String>,
}

impl DigestMd5 {
    pub fn new(realm: String, nonce: String) -> Self {
        DigestMd5 { state: DigestMd5State::Init, nonce, realm, username: None }
    }

    /// Builds the initial challenge text (base64-encoded
    /// `realm="...",qop="auth",nonce="...",charset=utf-8,algorithm=md5-sess`).
    pub fn initial_challenge(&mut self) -> String {
        self.state = DigestMd5State::SentChallenge1;
        let directives = format!(
            r#"realm="{}",qop="auth",nonce="{}",charset=utf-8,algorithm=md5-sess"#,
            self.realm, self.nonce
        );
        encode_base64(directives.as_bytes())
    }

    /// Parses the client's challenge-1 response and, if the digest checks
    /// out against `password`, returns the base64 `rspauth=...` challenge-2
    /// text. On any mismatch returns `SaslError::NotAuthorized` without
    /// revealing which field was wrong.
    pub fn verify_response(&mut self, b64text: &str, password: &str) -> Result<String, SaslError> {
        if self.state != DigestMd5State::SentChallenge1 {
            return Err(SaslError::NotAuthorized);
        }
        let raw = decode_base64(b64text)?;
        let text = String::from_utf8(raw).map_err(|_| SaslError::IncorrectEncoding)?;
        let pairs = parse_directives(&text)?;

        let username = pairs.get("username").ok_or(SaslError::NotAuthorized)?;
        let nonce = pairs.get("nonce").ok_or(SaslError::NotAuthorized)?;
        let realm = pairs.get("realm").ok_or(SaslError::NotAuthorized)?;
        let cnonce = pairs.get("cnonce").ok_or(SaslError::NotAuthorized)?;
        let nc = pairs.get("nc").ok_or(SaslError::NotAuthorized)?;
        let qop = pairs.get("qop").ok_or(SaslError::NotAuthorized)?;
        let response = pairs.get("response").ok_or(SaslError::NotAuthorized)?;
        let digest_uri = pairs.get("digest-uri").ok_or(SaslError::NotAuthorized)?;

        let nc_val = i64::from_str_radix(nc, 16).map_err(|_| SaslError::NotAuthorized)?;
        if nonce != &self.nonce
            || realm != &self.realm
            || nc_val != 1
            || !qop.split(',').any(|q| q == "auth")
            || response.is_empty()
            || digest_uri.is_empty()
        {
            return Err(SaslError::NotAuthorized);
        }
        self.username = Some(username.clone());

        let a1 = format!(
            "{}:{}:{}",
            hex(&h(format!("{username}:{realm}:{password}").as_bytes())),
            nonce,
            cnonce
        );
        let a2 = format!(":{digest_uri}");
        let a2client = format!("AUTHENTICATE:{digest_uri}");

        let digest = hex(&kd(
            &hex(&h(a1.as_bytes())),
            &format!("{nonce}:{nc}:{cnonce}:auth:{}", hex(&h(a2client.as_bytes()))),
        ));

        if &digest != response {
            return Err(SaslError::NotAuthorized);
        }

        let rspauth = hex(&kd(
            &hex(&h(a1.as_bytes())),
            &format!("{nonce}:{nc}:{cnonce}:auth:{}", hex(&h(a2.as_bytes()))),
        ));
        self.state = DigestMd5State::SentChallenge2;
        Ok(encode_base64(format!("rspauth={rspauth}").as_bytes()))
    }

    /// The client's final empty `<response/>` completes the exchange.
    pub fn complete(&mut self) -> Result<(), SaslError> {
        if self.state != DigestMd5State::SentChallenge2 {
            return Err(SaslError::NotAuthorized);
        }
        self.state = DigestMd5State::Init;
        Ok(())
    }
}

/// Peeks the `username` directive out of a challenge-1 response without
/// advancing any [`DigestMd5`] state machine, so the handler can look up the
/// stored password before calling [`DigestMd5::verify_response`].
pub fn peek_username(b64text: &str) -> Result<String, SaslError> {
    let raw = decode_base64(b64text)?;
    let text = String::from_utf8(raw).map_err(|_| SaslError::IncorrectEncoding)?;
    let pairs = parse_directives(&text)?;
    pairs.get("username").cloned().ok_or(SaslError::NotAuthorized)
}

/// Parses DIGEST-MD5 directive text (`key="value",key2=value2,...`),
/// handling commas embedded inside quoted values (e.g. `qop="auth,auth-int"`).
fn parse_directives(s: &str) -> Result<HashMap<String, String>, SaslError> {
    let mut out = HashMap::new();
    let bytes = s.as_bytes();
    let mut cur = 0usize;
    loop {
        let eq = s[cur..].find('=').map(|i| i + cur).ok_or(SaslError::IncorrectEncoding)?;
        if eq <= cur {
            return Err(SaslError::IncorrectEncoding);
        }
        let name = s[cur..eq].trim().to_string();
        let mut middle = eq + 1;
        let value;
        if bytes.get(middle) == Some(&b'"') {
            middle += 1;
            let end = s[middle..].find('"').map(|i| i + middle).ok_or(SaslError::IncorrectEncoding)?;
            value = s[middle..end].to_string();
            match s[end..].find(',') {
                Some(rel) => cur = end + rel + 1,
                None => {
                    out.insert(name, value);
                    break;
                }
            }
        } else {
            match s[middle..].find(',') {
                Some(rel) => {
                    value = s[middle..middle + rel].trim_end().to_string();
                    cur = middle + rel + 1;
                }
                None => {
                    value = s[middle..].trim_end().to_string();
                    out.insert(name, value);
                    break;
                }
            }
        }
        out.insert(name, value);
    }
    Ok(out)
}

/// Legacy `jabber:iq:auth` plaintext check (`IQAuthPlain`).
pub fn verify_legacy_plain(candidate: &str, stored: &str) -> bool {
    candidate == stored
}

/// Legacy `jabber:iq:auth` digest check: `SHA1(streamid + password)`
/// (`IQAuthDigest`).
pub fn verify_legacy_digest(stream_id: &str, stored_password: &str, digest: &str) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(stored_password.as_bytes());
    hex(&hasher.finalize()) == digest.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_base64_rejects_bad_alphabet() {
        assert!(!is_strict_base64("not valid!"));
        assert!(is_strict_base64("dGVzdA=="));
    }

    #[test]
    fn decode_plain_splits_three_parts() {
        let encoded = encode_base64(b"\0alice\0secret");
        let creds = decode_plain(&encoded).unwrap();
        assert_eq!(creds.authzid, "");
        assert_eq!(creds.authcid, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn decode_plain_rejects_wrong_part_count() {
        let encoded = encode_base64(b"alice\0secret");
        assert!(decode_plain(&encoded).is_err());
    }

    #[test]
    fn parse_directives_handles_quoted_commas() {
        let parsed = parse_directives(r#"realm="example.com",qop="auth,auth-int",nonce="abc123""#).unwrap();
        assert_eq!(parsed.get("realm").unwrap(), "example.com");
        assert_eq!(parsed.get("qop").unwrap(), "auth,auth-int");
        assert_eq!(parsed.get("nonce").unwrap(), "abc123");
    }

    #[test]
    fn digest_md5_full_round_trip_succeeds() {
        let password = "secret";
        let mut server = DigestMd5::new("localhost".into(), "n0nce".into());
        let challenge1 = server.initial_challenge();
        assert!(!challenge1.is_empty());

        let nonce = "n0nce";
        let cnonce = "cn0nce";
        let nc = "00000001";
        let username = "alice";
        let realm = "localhost";
        let digest_uri = "xmpp/localhost";

        let a1 = format!(
            "{}:{}:{}",
            hex(&h(format!("{username}:{realm}:{password}").as_bytes())),
            nonce,
            cnonce
        );
        let a2client = format!("AUTHENTICATE:{digest_uri}");
        let response = hex(&kd(
            &hex(&h(a1.as_bytes())),
            &format!("{nonce}:{nc}:{cnonce}:auth:{}", hex(&h(a2client.as_bytes()))),
        ));

        let client_response_text = format!(
            r#"username="{username}",realm="{realm}",nonce="{nonce}",cnonce="{cnonce}",nc={nc},qop=auth,digest-uri="{digest_uri}",response={response}"#
        );
        let b64 = encode_base64(client_response_text.as_bytes());

        let challenge2 = server.verify_response(&b64, password).unwrap();
        assert!(!challenge2.is_empty());
        assert_eq!(server.state, DigestMd5State::SentChallenge2);

        server.complete().unwrap();
        assert_eq!(server.state, DigestMd5State::Init);
    }

    #[test]
    fn digest_md5_rejects_wrong_password() {
        let mut server = DigestMd5::new("localhost".into(), "n0nce".into());
        server.initial_challenge();

        let client_response_text = r#"username="alice",realm="localhost",nonce="n0nce",cnonce="c",nc=00000001,qop=auth,digest-uri="xmpp/localhost",response=deadbeef"#;
        let b64 = encode_base64(client_response_text.as_bytes());
        assert!(server.verify_response(&b64, "secret").is_err());
    }

    #[test]
    fn legacy_plain_matches_stored_password() {
        assert!(verify_legacy_plain("secret", "secret"));
        assert!(!verify_legacy_plain("wrong", "secret"));
    }

    #[test]
    fn legacy_digest_matches_sha1_of_streamid_and_password() {
        let mut hasher = Sha1::new();
        hasher.update(b"stream123");
        hasher.update(b"secret");
        let expected = hex(&hasher.finalize());
        assert!(verify_legacy_digest("stream123", "secret", &expected));
        assert!(!verify_legacy_digest("stream123", "secret", "0000"));
    }
}
