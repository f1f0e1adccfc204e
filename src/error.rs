//! Unified error type for the stanza-processing engine.
//!
//! Every module boundary in this crate returns `Result<_, XmppError>` so
//! that handler chains (see [`crate::message`]) can treat any failure as
//! an opaque `lastRetVal` to hand to an error-handler.

use thiserror::Error;

/// Errors produced anywhere in the stanza pipeline.
#[derive(Error, Debug)]
pub enum XmppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("xml parse error: {0}")]
    XmlParse(String),

    #[error("parser is in an invalid state: {0}")]
    InvalidState(String),

    #[error("malformed jid: {0}")]
    BadJid(String),

    #[error("auth failed: {0}")]
    AuthFailed(#[from] SaslError),

    #[error("legacy iq-auth failed")]
    IqAuthFailed,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    pub fn bad_jid(msg: impl Into<String>) -> Self {
        Self::BadJid(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// SASL failure taxonomy from §4.5 — each maps to a `<failure>` child element.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslError {
    #[error("not-authorized")]
    NotAuthorized,
    #[error("incorrect-encoding")]
    IncorrectEncoding,
    #[error("invalid-authzid")]
    InvalidAuthzid,
    #[error("invalid-mechanism")]
    InvalidMechanism,
    #[error("mechanism-too-weak")]
    MechanismTooWeak,
    #[error("temporary-auth-failure")]
    TemporaryAuthFailure,
}

impl SaslError {
    /// The element name written inside `<failure xmlns='...xmpp-sasl'>`.
    pub fn element_name(self) -> &'static str {
        match self {
            SaslError::NotAuthorized => "not-authorized",
            SaslError::IncorrectEncoding => "incorrect-encoding",
            SaslError::InvalidAuthzid => "invalid-authzid",
            SaslError::InvalidMechanism => "invalid-mechanism",
            SaslError::MechanismTooWeak => "mechanism-too-weak",
            SaslError::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

/// RFC 6120 stanza-error conditions used by `generate_iq_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Forbidden,
    NotAuthorized,
    InternalServerError,
    ServiceUnavailable,
    ItemNotFound,
    Conflict,
    NotAcceptable,
    FeatureNotImplemented,
}

impl StanzaErrorCondition {
    pub fn element_name(self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "bad-request",
            StanzaErrorCondition::Forbidden => "forbidden",
            StanzaErrorCondition::NotAuthorized => "not-authorized",
            StanzaErrorCondition::InternalServerError => "internal-server-error",
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::Conflict => "conflict",
            StanzaErrorCondition::NotAcceptable => "not-acceptable",
            StanzaErrorCondition::FeatureNotImplemented => "feature-not-implemented",
        }
    }

    /// The legacy numeric error code historically paired with this condition.
    pub fn legacy_code(self) -> u16 {
        match self {
            StanzaErrorCondition::BadRequest => 400,
            StanzaErrorCondition::NotAuthorized => 401,
            StanzaErrorCondition::Forbidden => 403,
            StanzaErrorCondition::ItemNotFound => 404,
            StanzaErrorCondition::NotAcceptable => 406,
            StanzaErrorCondition::Conflict => 409,
            StanzaErrorCondition::InternalServerError => 500,
            StanzaErrorCondition::FeatureNotImplemented => 501,
            StanzaErrorCondition::ServiceUnavailable => 503,
        }
    }
}

/// `<iq type='error'>` type attribute per RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Cancel,
    Continue,
    Modify,
    Auth,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            StanzaErrorType::Cancel => "cancel",
            StanzaErrorType::Continue => "continue",
            StanzaErrorType::Modify => "modify",
            StanzaErrorType::Auth => "auth",
            StanzaErrorType::Wait => "wait",
        }
    }
}

/// Builds an `<iq type='error'>` bounce, echoing `original`'s children, per §7's
/// "unknown iq → service-unavailable" and "routing error" rules.
pub fn generate_iq_error(
    original: &minidom::Element,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
) -> minidom::Element {
    use minidom::Element;

    let mut iq = Element::builder("iq", "jabber:client").attr("type", "error");
    if let Some(id) = original.attr("id") {
        iq = iq.attr("id", id);
    }
    if let Some(from) = original.attr("to") {
        iq = iq.attr("from", from);
    }
    if let Some(to) = original.attr("from") {
        iq = iq.attr("to", to);
    }

    let mut error = Element::builder("error", "jabber:client")
        .attr("type", error_type.as_str())
        .attr("code", condition.legacy_code().to_string());
    error = error.append(
        Element::builder(condition.element_name(), "urn:ietf:params:xml:ns:xmpp-stanzas").build(),
    );

    let mut iq = iq.build();
    for child in original.children() {
        iq.append_child(child.clone());
    }
    iq.append_child(error.build());
    iq
}

/// Builds a `<stream:error>` element for fatal protocol violations (§4.1, §7).
pub fn generate_stream_error(condition: &str) -> minidom::Element {
    use minidom::Element;
    Element::builder("error", "http://etherx.jabber.org/streams")
        .append(Element::builder(condition, "urn:ietf:params:xml:ns:xmpp-streams").build())
        .build()
}

/// Free functions building the common named stream errors.
pub mod stream_errors {
    use minidom::Element;

    pub fn policy_violation() -> Element {
        super::generate_stream_error("policy-violation")
    }

    pub fn invalid_namespace() -> Element {
        super::generate_stream_error("invalid-namespace")
    }

    pub fn not_well_formed() -> Element {
        super::generate_stream_error("not-well-formed")
    }

    pub fn host_unknown() -> Element {
        super::generate_stream_error("host-unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sasl_error_element_names_match_taxonomy() {
        assert_eq!(SaslError::NotAuthorized.element_name(), "not-authorized");
        assert_eq!(SaslError::TemporaryAuthFailure.element_name(), "temporary-auth-failure");
    }

    #[test]
    fn iq_error_echoes_original_children_and_swaps_to_from() {
        let original: minidom::Element = "<iq xmlns='jabber:client' type='get' id='q1' from='a@x' to='b@x'><query xmlns='urn:example:foo'/></iq>"
            .parse()
            .unwrap();
        let err = generate_iq_error(&original, StanzaErrorCondition::ServiceUnavailable, StanzaErrorType::Cancel);
        assert_eq!(err.attr("type"), Some("error"));
        assert_eq!(err.attr("from"), Some("b@x"));
        assert_eq!(err.attr("to"), Some("a@x"));
        assert!(err.children().any(|c| c.name() == "query"));
        assert!(err.children().any(|c| c.name() == "error"));
    }
}
