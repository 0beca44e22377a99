//! Negotiation state machine for one connection
//!
//! Every operation on a connection's media stack runs as a named transition.
//! Negotiation transitions (offers, answers, bandwidth renegotiation) are
//! serialized: a second one waits until the first side effect has settled.
//! Non-negotiation transitions (candidates, attaching and detaching media)
//! run from any active state without waiting.
//!
//! ```text
//!            create-offer / process-offer / process-answer / negotiate-max-bw
//!   initial ────────────────────────────────────────────────────────────▶ stable
//!      │                      ▲ (same set of transitions)                  │
//!      │ error                │                                            │ error
//!      ▼                      │                                            ▼
//!   failed ───────────────────┘                                          failed
//!
//!   close: any active state ──▶ closed (absorbing)
//! ```

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use tracing::{debug, warn};

/// Maximum number of retained history entries
pub const HISTORY_SIZE_LIMIT: usize = 200;

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmState {
    Initial,
    Stable,
    Failed,
    Closed,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Initial => "initial",
            FsmState::Stable => "stable",
            FsmState::Failed => "failed",
            FsmState::Closed => "closed",
        }
    }

    /// States from which transitions are accepted
    pub fn is_active(&self) -> bool {
        !matches!(self, FsmState::Closed)
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    CreateOffer,
    ProcessOffer,
    ProcessAnswer,
    NegotiateMaxBw,
    AddIceCandidate,
    AddStream,
    RemoveStream,
    Close,
    Error,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::CreateOffer => "create-offer",
            Transition::ProcessOffer => "process-offer",
            Transition::ProcessAnswer => "process-answer",
            Transition::NegotiateMaxBw => "negotiate-max-bw",
            Transition::AddIceCandidate => "add-ice-candidate",
            Transition::AddStream => "add-stream",
            Transition::RemoveStream => "remove-stream",
            Transition::Close => "close",
            Transition::Error => "error",
        }
    }

    /// Transitions that mutate negotiation state and must be serialized
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Transition::CreateOffer
                | Transition::ProcessOffer
                | Transition::ProcessAnswer
                | Transition::NegotiateMaxBw
        )
    }

    /// Target state when taken from `from`
    pub fn target(&self, from: FsmState) -> FsmState {
        match self {
            Transition::CreateOffer
            | Transition::ProcessOffer
            | Transition::ProcessAnswer
            | Transition::NegotiateMaxBw => FsmState::Stable,
            Transition::AddIceCandidate | Transition::AddStream | Transition::RemoveStream => from,
            Transition::Close => FsmState::Closed,
            Transition::Error => FsmState::Failed,
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One executed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub from: FsmState,
    pub to: FsmState,
    pub transition: Transition,
}

#[derive(Debug)]
struct FsmInner {
    state: FsmState,
    history: VecDeque<HistoryEntry>,
    pending: Option<Transition>,
}

impl FsmInner {
    fn record(&mut self, session_id: u64, from: FsmState, to: FsmState, transition: Transition) {
        debug!(
            "Transition, sessionId: {}, transition: {}, from: {}, to: {}",
            session_id, transition, from, to
        );
        self.state = to;
        self.history.push_back(HistoryEntry {
            from,
            to,
            transition,
        });
        while self.history.len() > HISTORY_SIZE_LIMIT {
            self.history.pop_front();
        }
    }

    fn last_transition(&self) -> &'static str {
        self.history
            .back()
            .map(|entry| entry.transition.name())
            .unwrap_or("none")
    }

    fn fail(&mut self, session_id: u64, message: &str) {
        let from = self.state;
        self.record(session_id, from, FsmState::Failed, Transition::Error);
        warn!(
            "Error transition, sessionId: {}, message: {}, from: {}, printing history",
            session_id, message, from
        );
        for entry in &self.history {
            warn!(
                "Error transition history, sessionId: {}, transition: {}, from: {}, to: {}",
                session_id, entry.transition, entry.from, entry.to
            );
        }
    }
}

/// Serializing negotiation state machine
pub struct NegotiationFsm {
    session_id: u64,
    inner: Mutex<FsmInner>,
    negotiation: tokio::sync::Mutex<()>,
}

impl NegotiationFsm {
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            inner: Mutex::new(FsmInner {
                state: FsmState::Initial,
                history: VecDeque::new(),
                pending: None,
            }),
            negotiation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> FsmState {
        self.inner.lock().state
    }

    /// Executed transitions, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.iter().copied().collect()
    }

    /// A negotiation side effect is in flight
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    fn closed_noop(&self, transition: Transition) -> bool {
        let inner = self.inner.lock();
        if inner.state == FsmState::Closed {
            debug!(
                "Trying to transition a closed state, sessionId: {}, transition: {}",
                self.session_id, transition
            );
            return true;
        }
        false
    }

    /// Run `effect` as `transition`
    ///
    /// Returns `Ok(None)` without running anything when the machine is
    /// closed, and discards the result when it was closed while the effect
    /// was in flight. A failed effect moves the machine to `failed` and is
    /// returned as [`Error::NegotiationFailed`].
    pub async fn apply<T, Fut>(&self, transition: Transition, effect: Fut) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        if matches!(transition, Transition::Close | Transition::Error) {
            return Err(Error::InvalidState(format!(
                "{} is not an effect transition",
                transition
            )));
        }

        if self.closed_noop(transition) {
            return Ok(None);
        }

        let _serial = if transition.is_negotiation() {
            let guard = match self.negotiation.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    {
                        let inner = self.inner.lock();
                        warn!(
                            "Pending transition, sessionId: {}, transition: {}, from: {}, pending: {}, lastTransition: {}",
                            self.session_id,
                            transition,
                            inner.state,
                            inner.pending.map(|t| t.name()).unwrap_or("none"),
                            inner.last_transition()
                        );
                    }
                    self.negotiation.lock().await
                }
            };

            if self.closed_noop(transition) {
                return Ok(None);
            }
            self.inner.lock().pending = Some(transition);
            Some(guard)
        } else {
            None
        };

        let result = effect.await;

        let mut inner = self.inner.lock();
        if transition.is_negotiation() {
            inner.pending = None;
        }

        if inner.state == FsmState::Closed {
            debug!(
                "Discarding {} result on closed machine, sessionId: {}",
                transition, self.session_id
            );
            return Ok(None);
        }

        match result {
            Ok(value) => {
                let from = inner.state;
                inner.record(self.session_id, from, transition.target(from), transition);
                Ok(Some(value))
            }
            Err(e) => {
                let message = e.to_string();
                inner.fail(self.session_id, &message);
                Err(Error::NegotiationFailed {
                    transition: transition.name().to_string(),
                    message,
                })
            }
        }
    }

    /// Record a failure; ignored once closed
    pub fn error(&self, message: &str) {
        let mut inner = self.inner.lock();
        if inner.state == FsmState::Closed {
            debug!(
                "Ignoring error on closed machine, sessionId: {}, message: {}",
                self.session_id, message
            );
            return;
        }
        inner.fail(self.session_id, message);
    }

    /// Close the machine
    ///
    /// Never waits for an in-flight negotiation. Returns `true` when the
    /// caller must release the stack, `false` when the machine was already
    /// closed.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == FsmState::Closed {
            debug!(
                "Trying to transition a closed state, sessionId: {}, transition: close",
                self.session_id
            );
            return false;
        }
        let from = inner.state;
        inner.record(self.session_id, from, FsmState::Closed, Transition::Close);
        debug!("Reached closed, sessionId: {}, from: {}", self.session_id, from);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_negotiation_reaches_stable() {
        let fsm = NegotiationFsm::new(1);
        assert_eq!(fsm.state(), FsmState::Initial);

        let sdp = fsm
            .apply(Transition::CreateOffer, async { Ok("v=0".to_string()) })
            .await
            .unwrap();
        assert_eq!(sdp.as_deref(), Some("v=0"));
        assert_eq!(fsm.state(), FsmState::Stable);
        assert_eq!(
            fsm.history(),
            vec![HistoryEntry {
                from: FsmState::Initial,
                to: FsmState::Stable,
                transition: Transition::CreateOffer
            }]
        );
    }

    #[tokio::test]
    async fn test_non_negotiation_keeps_state() {
        let fsm = NegotiationFsm::new(1);
        fsm.apply(Transition::AddStream, async { Ok(()) }).await.unwrap();
        fsm.apply(Transition::AddIceCandidate, async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(fsm.state(), FsmState::Initial);
        assert_eq!(fsm.history().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_effect_moves_to_failed() {
        let fsm = NegotiationFsm::new(2);
        let result = fsm
            .apply(Transition::ProcessAnswer, async {
                Err::<(), _>(Error::WebRtcError("bad sdp".to_string()))
            })
            .await;

        match result {
            Err(Error::NegotiationFailed { transition, message }) => {
                assert_eq!(transition, "process-answer");
                assert!(message.contains("bad sdp"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fsm.state(), FsmState::Failed);
        assert_eq!(fsm.history().last().map(|e| e.transition), Some(Transition::Error));

        // failed is an active state
        fsm.apply(Transition::CreateOffer, async { Ok(()) }).await.unwrap();
        assert_eq!(fsm.state(), FsmState::Stable);
    }

    #[tokio::test]
    async fn test_closed_is_absorbing() {
        let fsm = NegotiationFsm::new(3);
        assert!(fsm.close());
        assert!(!fsm.close());

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let result = fsm
            .apply(Transition::CreateOffer, async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));

        fsm.error("late failure");
        assert_eq!(fsm.state(), FsmState::Closed);
        assert_eq!(fsm.history().len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let fsm = NegotiationFsm::new(4);
        for _ in 0..(HISTORY_SIZE_LIMIT + 25) {
            fsm.apply(Transition::AddIceCandidate, async { Ok(()) })
                .await
                .unwrap();
        }
        assert_eq!(fsm.history().len(), HISTORY_SIZE_LIMIT);
    }

    #[tokio::test]
    async fn test_negotiations_are_serialized() {
        let fsm = Arc::new(NegotiationFsm::new(5));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let first = {
            let fsm = fsm.clone();
            let order = order_tx.clone();
            tokio::spawn(async move {
                fsm.apply(Transition::CreateOffer, async move {
                    let _ = release_rx.await;
                    let _ = order.send("offer");
                    Ok(())
                })
                .await
            })
        };

        while !fsm.is_pending() {
            tokio::task::yield_now().await;
        }

        // candidates are not held back by the pending offer
        fsm.apply(Transition::AddIceCandidate, async { Ok(()) })
            .await
            .unwrap();

        let second = {
            let fsm = fsm.clone();
            let order = order_tx.clone();
            tokio::spawn(async move {
                fsm.apply(Transition::ProcessAnswer, async move {
                    let _ = order.send("answer");
                    Ok(())
                })
                .await
            })
        };

        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(order_rx.recv().await, Some("offer"));
        assert_eq!(order_rx.recv().await, Some("answer"));
        assert!(!fsm.is_pending());
        assert_eq!(fsm.state(), FsmState::Stable);
    }

    #[tokio::test]
    async fn test_close_discards_inflight_result() {
        let fsm = Arc::new(NegotiationFsm::new(6));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let task = {
            let fsm = fsm.clone();
            tokio::spawn(async move {
                fsm.apply(Transition::ProcessOffer, async move {
                    let _ = release_rx.await;
                    Ok("answer".to_string())
                })
                .await
            })
        };

        while !fsm.is_pending() {
            tokio::task::yield_now().await;
        }

        assert!(fsm.close());
        release_tx.send(()).unwrap();

        assert_eq!(task.await.unwrap().unwrap(), None);
        assert_eq!(fsm.state(), FsmState::Closed);
    }
}
