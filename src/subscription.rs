//! Presence-subscription automaton (component I): the 9-state model from
//! RFC 6121 §3 (none / none+out / none+in / none+in+out / to / to+in /
//! from / from+out / both), with the exact transition tables for the four
//! subscription-control stanza types crossed with direction (C2S-initiated
//! vs. S2S-initiated).

use std::fmt;

/// One of the nine legal subscription states a roster item can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubState {
    None,
    NonePendingOut,
    NonePendingIn,
    NonePendingInOut,
    To,
    ToPendingIn,
    From,
    FromPendingOut,
    Both,
}

impl SubState {
    pub fn has_to(self) -> bool {
        matches!(self, SubState::To | SubState::ToPendingIn | SubState::Both)
    }

    pub fn has_from(self) -> bool {
        matches!(self, SubState::From | SubState::FromPendingOut | SubState::Both)
    }

    pub fn has_pending_out(self) -> bool {
        matches!(self, SubState::NonePendingOut | SubState::NonePendingInOut | SubState::FromPendingOut)
    }

    pub fn has_pending_in(self) -> bool {
        matches!(self, SubState::NonePendingIn | SubState::NonePendingInOut | SubState::ToPendingIn)
    }

    /// Serialized into `<item subscription='...'>`.
    pub fn roster_attr(self) -> &'static str {
        match self {
            s if s.has_to() && s.has_from() => "both",
            s if s.has_to() => "to",
            s if s.has_from() => "from",
            _ => "none",
        }
    }

    /// `true` when `ask='subscribe'` belongs on the roster item.
    pub fn ask_subscribe(self) -> bool {
        self.has_pending_out()
    }
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.roster_attr())
    }
}

/// A subscription-control event, one per `<presence type='...'>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubEvent {
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
}

/// Who sent the stanza that produced a [`SubEvent`] relative to the roster
/// owner: `Local` means our own user issued it (a C2S presence); `Remote`
/// means the contact's server delivered it to us (an S2S presence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Outcome of applying one event: the roster item's new state, whether the
/// event should be relayed to the peer, and whether it should be delivered
/// to the user's interested resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: SubState,
    pub relay: bool,
    pub deliver: bool,
}

/// Applies one subscription event to `state`, returning the resulting
/// transition. Table grounded in RFC 6121 §3.1.2-3.1.6 (approximating the
/// reference source's `presence.py`, which conflates several of these
/// states under a single `ask` flag — reworked here into the full 9-state
/// automaton per the design).
pub fn apply(state: SubState, event: SubEvent, origin: Origin) -> Transition {
    use Origin::*;
    use SubEvent::*;
    use SubState::*;

    match (event, origin) {
        (Subscribe, Local) => match state {
            None | NonePendingIn => Transition { next: if state == NonePendingIn { NonePendingInOut } else { NonePendingOut }, relay: true, deliver: false },
            From => Transition { next: FromPendingOut, relay: true, deliver: false },
            s => Transition { next: s, relay: false, deliver: false },
        },
        (Subscribe, Remote) => match state {
            None | NonePendingOut => Transition { next: if state == NonePendingOut { NonePendingInOut } else { NonePendingIn }, relay: false, deliver: true },
            To | ToPendingIn => Transition { next: ToPendingIn, relay: false, deliver: true },
            From | FromPendingOut | Both => Transition { next: state, relay: true, deliver: false },
            _ => Transition { next: state, relay: false, deliver: true },
        },
        (Subscribed, Local) => match state {
            NonePendingIn => Transition { next: From, relay: true, deliver: false },
            NonePendingInOut => Transition { next: FromPendingOut, relay: true, deliver: false },
            ToPendingIn => Transition { next: Both, relay: true, deliver: false },
            s => Transition { next: s, relay: false, deliver: false },
        },
        (Subscribed, Remote) => match state {
            NonePendingOut => Transition { next: To, relay: false, deliver: true },
            NonePendingInOut => Transition { next: ToPendingIn, relay: false, deliver: true },
            FromPendingOut => Transition { next: Both, relay: false, deliver: true },
            s => Transition { next: s, relay: false, deliver: false },
        },
        (Unsubscribe, Local) => match state {
            To | ToPendingIn => Transition { next: if state == ToPendingIn { NonePendingIn } else { None }, relay: true, deliver: false },
            Both => Transition { next: From, relay: true, deliver: false },
            NonePendingOut | NonePendingInOut => {
                Transition { next: if state == NonePendingInOut { NonePendingIn } else { None }, relay: true, deliver: false }
            }
            s => Transition { next: s, relay: false, deliver: false },
        },
        (Unsubscribe, Remote) => match state {
            From | FromPendingOut => Transition { next: if state == FromPendingOut { NonePendingOut } else { None }, relay: false, deliver: true },
            Both => Transition { next: To, relay: false, deliver: true },
            NonePendingIn | NonePendingInOut => {
                Transition { next: if state == NonePendingInOut { NonePendingOut } else { None }, relay: false, deliver: true }
            }
            s => Transition { next: s, relay: false, deliver: false },
        },
        (Unsubscribed, Local) => match state {
            From | FromPendingOut => Transition { next: if state == FromPendingOut { NonePendingOut } else { None }, relay: true, deliver: false },
            Both => Transition { next: To, relay: true, deliver: false },
            ToPendingIn => Transition { next: To, relay: true, deliver: false },
            NonePendingIn | NonePendingInOut => {
                Transition { next: if state == NonePendingInOut { NonePendingOut } else { None }, relay: true, deliver: false }
            }
            s => Transition { next: s, relay: false, deliver: false },
        },
        (Unsubscribed, Remote) => match state {
            To | ToPendingIn => Transition { next: if state == ToPendingIn { NonePendingIn } else { None }, relay: false, deliver: true },
            Both => Transition { next: From, relay: false, deliver: true },
            NonePendingOut | NonePendingInOut => {
                Transition { next: if state == NonePendingInOut { NonePendingIn } else { None }, relay: false, deliver: true }
            }
            s => Transition { next: s, relay: false, deliver: false },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_subscribe_from_none_stages_pending_out() {
        let t = apply(SubState::None, SubEvent::Subscribe, Origin::Local);
        assert_eq!(t.next, SubState::NonePendingOut);
        assert!(t.relay);
    }

    #[test]
    fn remote_subscribed_completes_to() {
        let t = apply(SubState::NonePendingOut, SubEvent::Subscribed, Origin::Remote);
        assert_eq!(t.next, SubState::To);
        assert!(t.deliver);
    }

    #[test]
    fn remote_subscribe_while_to_pending_in_merges() {
        let t = apply(SubState::To, SubEvent::Subscribe, Origin::Remote);
        assert_eq!(t.next, SubState::ToPendingIn);
    }

    #[test]
    fn both_unsubscribe_local_drops_to_from() {
        let t = apply(SubState::Both, SubEvent::Unsubscribe, Origin::Local);
        assert_eq!(t.next, SubState::From);
        assert!(t.relay);
    }

    #[test]
    fn roster_attr_reports_both() {
        assert_eq!(SubState::Both.roster_attr(), "both");
        assert_eq!(SubState::NonePendingOut.roster_attr(), "none");
        assert!(SubState::NonePendingOut.ask_subscribe());
    }
}
