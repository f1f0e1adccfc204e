//! Phase/handler registry (component D).
//!
//! A *phase* is a named bucket of xpath-matched handler chains. Three
//! tables exist — [`core_phases`] (stream-level events, shared by every
//! connection kind), [`c2s_stanza_phases`] (first-level children of a
//! client stream) and [`s2s_stanza_phases`] (first-level children of a
//! server stream) — mirroring the reference source's `_corePhases`,
//! `_c2sStanzaPhases` and `_s2sStanzaPhases` dicts.

use crate::handlers::HandlerKind;

/// Matches a stanza by its normalized `{namespace}localname` qualified tag
/// and, optionally, its `type` attribute.
#[derive(Debug, Clone)]
pub struct XPathMatcher {
    pub qualified_name: &'static str,
    pub type_attr: Option<&'static str>,
}

impl XPathMatcher {
    const fn tag(qualified_name: &'static str) -> Self {
        XPathMatcher { qualified_name, type_attr: None }
    }

    const fn tag_type(qualified_name: &'static str, type_attr: &'static str) -> Self {
        XPathMatcher { qualified_name, type_attr: Some(type_attr) }
    }

    /// `top` is the stanza's own qualified tag; `child` is its first child
    /// element's qualified tag, when it has exactly one (an `<iq>`'s
    /// `<query>`/`<bind>`/`<session>` payload). An xpath of the bare
    /// `"{ns}tag"` form matches on `top` alone, regardless of `child` — this
    /// is how `unknown-iq` catches every `<iq>` whose payload no more
    /// specific phase recognizes. An xpath containing `/` requires `child`
    /// to match too.
    pub fn matches(&self, top: &str, child: Option<&str>, type_attr: Option<&str>) -> bool {
        let path_matches = match self.qualified_name.split_once('/') {
            Some((want_top, want_child)) => top == want_top && child == Some(want_child),
            None => top == self.qualified_name,
        };
        path_matches && self.type_attr.map_or(true, |want| type_attr == Some(want))
    }
}

/// One entry in a phase table: an xpath match, a priority (higher wins when
/// more than one phase's xpath matches the same stanza) and the ordered
/// handler / error-handler chains to load into a [`crate::message::Message`].
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: &'static str,
    pub xpath: Option<XPathMatcher>,
    pub priority: i32,
    pub handlers: &'static [HandlerKind],
    pub error_handlers: &'static [HandlerKind],
}

impl Phase {
    const fn named(name: &'static str) -> Self {
        Phase { name, xpath: None, priority: 0, handlers: &[], error_handlers: &[] }
    }
}

/// An ordered collection of [`Phase`]s, matched highest-priority-first.
#[derive(Debug, Clone)]
pub struct PhaseTable {
    phases: &'static [Phase],
}

impl PhaseTable {
    /// Looks a phase up by its symbolic name (used for fixed transitions
    /// like `in-stream-init` that don't depend on stanza content).
    pub fn by_name(&self, name: &str) -> Option<&'static Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Finds the best-matching phase for an incoming stanza, preferring
    /// higher `priority` among ties, falling back to `default` if nothing
    /// else matches. `child` is the stanza's first child's qualified tag
    /// (only meaningful for `<iq>`, whose phases key off their payload).
    pub fn resolve(&self, qualified_name: &str, child: Option<&str>, type_attr: Option<&str>) -> &'static Phase {
        self.phases
            .iter()
            .filter(|p| p.xpath.as_ref().is_some_and(|x| x.matches(qualified_name, child, type_attr)))
            .max_by_key(|p| p.priority)
            .unwrap_or_else(|| self.by_name("default").expect("every phase table has a default"))
    }
}

use HandlerKind::*;

const CORE_PHASES: &[Phase] = &[
    Phase::named("default"),
    Phase {
        name: "in-stream-init",
        handlers: &[InStreamInit, FeaturesInit, Write],
        ..Phase::named("in-stream-init")
    },
    Phase { name: "in-stream-reinit", handlers: &[InStreamReInit], ..Phase::named("in-stream-reinit") },
    Phase { name: "out-stream-init", handlers: &[OutStreamInit, Write], ..Phase::named("out-stream-init") },
    Phase { name: "stream-end", handlers: &[StreamEnd, CleanUpConn], ..Phase::named("stream-end") },
    Phase::named("close-stream"),
    Phase {
        name: "features",
        xpath: Some(XPathMatcher::tag("{http://etherx.jabber.org/streams}features")),
        ..Phase::named("features")
    },
    Phase {
        name: "sasl-auth",
        xpath: Some(XPathMatcher::tag("{urn:ietf:params:xml:ns:xmpp-sasl}auth")),
        handlers: &[SaslAuth, Write],
        error_handlers: &[SaslError],
        ..Phase::named("sasl-auth")
    },
    Phase {
        name: "sasl-response",
        xpath: Some(XPathMatcher::tag("{urn:ietf:params:xml:ns:xmpp-sasl}response")),
        handlers: &[SaslResponse, Write],
        error_handlers: &[SaslError],
        ..Phase::named("sasl-response")
    },
    Phase {
        name: "sasl-abort",
        xpath: Some(XPathMatcher::tag("{urn:ietf:params:xml:ns:xmpp-sasl}abort")),
        error_handlers: &[SaslError],
        ..Phase::named("sasl-abort")
    },
    Phase {
        name: "test",
        handlers: &[SimpleReply, Write],
        ..Phase::named("test")
    },
];

const C2S_STANZA_PHASES: &[Phase] = &[
    Phase::named("default"),
    Phase {
        name: "iq-auth-get",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}iq/{jabber:iq:auth}query", "get")),
        handlers: &[IqAuthGet, Write],
        ..Phase::named("iq-auth-get")
    },
    Phase {
        name: "iq-auth-set",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}iq/{jabber:iq:auth}query", "set")),
        handlers: &[IqAuthSet, Write],
        ..Phase::named("iq-auth-set")
    },
    Phase {
        name: "iq-bind",
        xpath: Some(XPathMatcher::tag("{jabber:client}iq/{urn:ietf:params:xml:ns:xmpp-bind}bind")),
        handlers: &[IqBind, Write],
        ..Phase::named("iq-bind")
    },
    Phase {
        name: "iq-session",
        xpath: Some(XPathMatcher::tag("{jabber:client}iq/{urn:ietf:params:xml:ns:xmpp-session}session")),
        handlers: &[IqSession, Write],
        ..Phase::named("iq-session")
    },
    Phase {
        name: "iq-roster-get",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}iq/{jabber:iq:roster}query", "get")),
        handlers: &[IqRosterGet, Write],
        ..Phase::named("iq-roster-get")
    },
    Phase {
        name: "iq-roster-update",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}iq/{jabber:iq:roster}query", "set")),
        handlers: &[IqRosterUpdate, RosterPush, Write],
        ..Phase::named("iq-roster-update")
    },
    Phase {
        name: "message",
        xpath: Some(XPathMatcher::tag("{jabber:client}message")),
        handlers: &[C2SMessage],
        ..Phase::named("message")
    },
    Phase {
        name: "c2s-presence",
        xpath: Some(XPathMatcher::tag("{jabber:client}presence")),
        handlers: &[C2SPresence, Write],
        ..Phase::named("c2s-presence")
    },
    Phase {
        name: "c2s-presence-unavailable",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}presence", "unavailable")),
        priority: 1,
        handlers: &[C2SPresence],
        ..Phase::named("c2s-presence-unavailable")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}presence", "subscribe")),
        priority: 2,
        handlers: &[C2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}presence", "subscribed")),
        priority: 2,
        handlers: &[C2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}presence", "unsubscribe")),
        priority: 2,
        handlers: &[C2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:client}presence", "unsubscribed")),
        priority: 2,
        handlers: &[C2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "unknown-iq",
        xpath: Some(XPathMatcher::tag("{jabber:client}iq")),
        priority: -1,
        handlers: &[IqNotImplemented, Write],
        ..Phase::named("unknown-iq")
    },
];

const S2S_STANZA_PHASES: &[Phase] = &[
    Phase::named("default"),
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:server}presence", "subscribe")),
        priority: 1,
        handlers: &[S2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:server}presence", "subscribed")),
        priority: 1,
        handlers: &[S2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:server}presence", "unsubscribe")),
        priority: 1,
        handlers: &[S2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "subscription",
        xpath: Some(XPathMatcher::tag_type("{jabber:server}presence", "unsubscribed")),
        priority: 1,
        handlers: &[S2SSubscription],
        ..Phase::named("subscription")
    },
    Phase {
        name: "s2s-presence",
        xpath: Some(XPathMatcher::tag("{jabber:server}presence")),
        handlers: &[S2SPresence, Write],
        ..Phase::named("s2s-presence")
    },
    Phase {
        name: "s2s-presence-unavailable",
        xpath: Some(XPathMatcher::tag_type("{jabber:server}presence", "unavailable")),
        priority: 2,
        handlers: &[S2SPresence, Write],
        ..Phase::named("s2s-presence-unavailable")
    },
    Phase {
        name: "s2s-presence-probe",
        xpath: Some(XPathMatcher::tag_type("{jabber:server}presence", "probe")),
        priority: 2,
        handlers: &[S2SProbe],
        ..Phase::named("s2s-presence-probe")
    },
    Phase {
        name: "message",
        xpath: Some(XPathMatcher::tag("{jabber:server}message")),
        handlers: &[S2SMessage],
        ..Phase::named("message")
    },
];

pub fn core_phases() -> PhaseTable {
    PhaseTable { phases: CORE_PHASES }
}

pub fn c2s_stanza_phases() -> PhaseTable {
    PhaseTable { phases: C2S_STANZA_PHASES }
}

pub fn s2s_stanza_phases() -> PhaseTable {
    PhaseTable { phases: S2S_STANZA_PHASES }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c2s_presence_beats_default_but_loses_to_subscription() {
        let table = c2s_stanza_phases();
        let plain = table.resolve("{jabber:client}presence", None, None);
        assert_eq!(plain.name, "c2s-presence");

        let typed = table.resolve("{jabber:client}presence", None, Some("subscribe"));
        assert_eq!(typed.name, "subscription");
    }

    #[test]
    fn presence_unavailable_outranks_plain_presence_and_is_not_a_subscription_type() {
        let table = c2s_stanza_phases();
        let unavail = table.resolve("{jabber:client}presence", None, Some("unavailable"));
        assert_eq!(unavail.name, "c2s-presence-unavailable");
    }

    #[test]
    fn every_subscription_control_type_resolves_to_subscription() {
        let table = c2s_stanza_phases();
        for ty in ["subscribe", "subscribed", "unsubscribe", "unsubscribed"] {
            let resolved = table.resolve("{jabber:client}presence", None, Some(ty));
            assert_eq!(resolved.name, "subscription", "type {ty} should resolve to subscription");
        }
    }

    #[test]
    fn unknown_iq_is_lowest_priority_fallback() {
        let table = c2s_stanza_phases();
        let resolved = table.resolve("{jabber:client}iq", Some("{urn:example:unrecognized}query"), None);
        assert_eq!(resolved.name, "unknown-iq");
    }

    #[test]
    fn iq_bind_matches_on_child_payload_not_bare_iq_tag() {
        let table = c2s_stanza_phases();
        let resolved = table.resolve(
            "{jabber:client}iq",
            Some("{urn:ietf:params:xml:ns:xmpp-bind}bind"),
            None,
        );
        assert_eq!(resolved.name, "iq-bind");
    }

    #[test]
    fn iq_roster_get_and_set_are_distinguished_by_type_attr() {
        let table = c2s_stanza_phases();
        let get = table.resolve("{jabber:client}iq", Some("{jabber:iq:roster}query"), Some("get"));
        assert_eq!(get.name, "iq-roster-get");
        let set = table.resolve("{jabber:client}iq", Some("{jabber:iq:roster}query"), Some("set"));
        assert_eq!(set.name, "iq-roster-update");
    }

    #[test]
    fn core_phase_lookup_by_name() {
        let table = core_phases();
        let phase = table.by_name("in-stream-init").unwrap();
        assert_eq!(phase.handlers, &[InStreamInit, FeaturesInit, Write]);
    }

    #[test]
    fn s2s_probe_outranks_plain_s2s_presence() {
        let table = s2s_stanza_phases();
        let resolved = table.resolve("{jabber:server}presence", None, Some("probe"));
        assert_eq!(resolved.name, "s2s-presence-probe");
    }
}
