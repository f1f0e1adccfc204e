//! Handler-chain state machine (component E).
//!
//! A [`Message`] wraps one incoming stanza (or synthetic stream event)
//! together with the ordered `(handler, error_handler)` pairs a [`Phase`]
//! loaded into it, and walks that chain one step at a time. Because every
//! handler in this crate is `async fn` rather than the reference source's
//! inline/threaded split (see design notes §9), there is no separate
//! suspend/resume bookkeeping: the dispatcher simply `.await`s each step.

use std::collections::VecDeque;

use minidom::Element;

use crate::error::XmppError;
use crate::handlers::HandlerKind;
use crate::phases::Phase;

/// The value threaded from one handler to the next, or an error handed to
/// the paired error-handler. Mirrors the reference source's `lastRetVal`,
/// which is either a return value or a raised exception.
#[derive(Debug, Clone)]
pub enum ChainValue {
    Empty,
    Stanza(Element),
    Stanzas(Vec<Element>),
    Route(crate::routing::RouteDescriptor),
    Error(ChainError),
}

#[derive(Debug, Clone)]
pub struct ChainError {
    pub error: std::sync::Arc<XmppError>,
}

impl From<XmppError> for ChainValue {
    fn from(e: XmppError) -> Self {
        ChainValue::Error(ChainError { error: std::sync::Arc::new(e) })
    }
}

/// One scheduled step: a handler to run, and the error-handler to run
/// instead if the step before it failed.
#[derive(Debug, Clone, Copy)]
struct ChainStep {
    handler: HandlerKind,
    error_handler: Option<HandlerKind>,
}

/// A single unit of work moving through the phase/handler pipeline.
///
/// `stop_chain`, `running`, and `last_ret_val` correspond directly to the
/// reference source's `Message` fields of the same names (`stopChain`,
/// `runningPair`, `lastRetVal`).
pub struct Message {
    pub conn_id: String,
    pub phase_name: &'static str,
    pub stanza: Option<Element>,
    chain: VecDeque<ChainStep>,
    pub last_ret_val: ChainValue,
    pub stop_chain: bool,
    pub output_buffer: Vec<OutputItem>,
}

#[derive(Debug, Clone)]
pub enum OutputItem {
    Xml(Element),
    Raw(String),
}

impl Message {
    pub fn from_phase(conn_id: String, phase: &'static Phase, stanza: Option<Element>) -> Self {
        let chain = phase
            .handlers
            .iter()
            .zip(phase.error_handlers.iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(h, eh)| ChainStep { handler: *h, error_handler: eh.copied() })
            .collect();
        Message {
            conn_id,
            phase_name: phase.name,
            stanza,
            chain,
            last_ret_val: ChainValue::Empty,
            stop_chain: false,
            output_buffer: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.stop_chain || self.chain.is_empty()
    }

    /// Pops the next `(handler, error_handler)` pair and decides which of
    /// the two to actually run, based on whether the previous step left an
    /// error in `last_ret_val`. Per the explicitly recorded decision on the
    /// reference source's dequeue ambiguity: both members of the pair are
    /// removed together every step, whether or not the error-handler runs.
    ///
    /// Returns `None` once the chain is exhausted, or `Some(None)` for a
    /// step whose failure has no registered error-handler (the failure
    /// silently carries forward to the next pair).
    pub fn next_step(&mut self) -> Option<Option<HandlerKind>> {
        let next = self.chain.pop_front()?;
        let failed_before = matches!(self.last_ret_val, ChainValue::Error(_));
        Some(if failed_before { next.error_handler } else { Some(next.handler) })
    }

    /// Records the outcome of running the handler [`Message::next_step`]
    /// returned.
    pub fn set_result(&mut self, result: Result<ChainValue, XmppError>) {
        self.last_ret_val = match result {
            Ok(v) => v,
            Err(e) => e.into(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::core_phases;

    #[test]
    fn chain_loads_handler_error_pairs_from_phase() {
        let table = core_phases();
        let phase = table.by_name("sasl-auth").unwrap();
        let msg = Message::from_phase("c1".into(), phase, None);
        assert_eq!(msg.chain.len(), 2);
        assert_eq!(msg.chain[0].handler, HandlerKind::SaslAuth);
        assert_eq!(msg.chain[0].error_handler, Some(HandlerKind::SaslError));
    }

    #[test]
    fn empty_chain_is_done_immediately() {
        let table = core_phases();
        let phase = table.by_name("default").unwrap();
        let msg = Message::from_phase("c1".into(), phase, None);
        assert!(msg.is_done());
    }

    #[test]
    fn stop_chain_halts_further_steps() {
        let table = core_phases();
        let phase = table.by_name("sasl-auth").unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, None);
        let kind = msg.next_step().flatten().unwrap();
        assert_eq!(kind, HandlerKind::SaslAuth);
        msg.stop_chain = true;
        msg.set_result(Ok(ChainValue::Empty));
        assert!(msg.is_done());
        assert!(msg.next_step().is_none() || msg.is_done());
    }

    #[test]
    fn error_routes_to_paired_error_handler() {
        let table = core_phases();
        let phase = table.by_name("sasl-auth").unwrap();
        let mut msg = Message::from_phase("c1".into(), phase, None);
        let kind = msg.next_step().flatten().unwrap();
        assert_eq!(kind, HandlerKind::SaslAuth);
        msg.set_result(Err(XmppError::internal("boom")));
        assert!(matches!(msg.last_ret_val, ChainValue::Error(_)));

        let seen = msg.next_step();
        assert_eq!(seen, Some(Some(HandlerKind::SaslError)));
    }
}
