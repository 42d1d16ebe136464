//! Per-direction ICE candidate relay.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::CandidateFlushPolicy;
use crate::endpoint::{Endpoint, IceCandidate, IceGatheringState};
use crate::error::PairError;
use crate::negotiator::Direction;
use crate::observer::Reporter;

#[derive(Default)]
struct RelayState {
    queued: Vec<IceCandidate>,
    terminated: bool,
}

/// Buffers candidates gathered on `source` and hands them to `target` once
/// the flush condition holds. Queued candidates are drained in one step so
/// each is delivered exactly once, in arrival order.
pub(crate) struct CandidateRelay<E: Endpoint> {
    direction: Direction,
    source: Arc<E>,
    target: Arc<E>,
    policy: CandidateFlushPolicy,
    state: Mutex<RelayState>,
    reporter: Reporter,
}

impl<E: Endpoint> CandidateRelay<E> {
    pub(crate) fn new(
        direction: Direction,
        source: Arc<E>,
        target: Arc<E>,
        policy: CandidateFlushPolicy,
        reporter: Reporter,
    ) -> Arc<Self> {
        Arc::new(Self {
            direction,
            source,
            target,
            policy,
            state: Mutex::new(RelayState::default()),
            reporter,
        })
    }

    /// Routes the source's candidate notifications into this relay.
    pub(crate) fn attach(self: &Arc<Self>) {
        let relay: Weak<Self> = Arc::downgrade(self);
        self.source.on_ice_candidate(Box::new(move |candidate| {
            let relay = relay.clone();
            Box::pin(async move {
                if let Some(relay) = relay.upgrade() {
                    relay.handle(candidate).await;
                }
            })
        }));
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Handles one discovery notification. `None` is the end-of-gathering
    /// terminator.
    pub(crate) async fn handle(&self, candidate: Option<IceCandidate>) {
        {
            let mut state = self.state.lock();
            match candidate {
                Some(candidate) if !candidate.is_empty() => {
                    tracing::trace!(
                        target: "peer_pair::relay",
                        direction = %self.direction,
                        candidate = %candidate.candidate,
                        "captured ice candidate"
                    );
                    state.queued.push(candidate);
                }
                Some(_) => {}
                None => state.terminated = true,
            }
        }
        self.flush().await;
    }

    /// Delivers every queued candidate if the flush condition holds, returning
    /// how many were handed to the target. Calling it with nothing queued is
    /// a no-op.
    pub(crate) async fn flush(&self) -> usize {
        if !self.ready().await {
            return 0;
        }
        let drained = std::mem::take(&mut self.state.lock().queued);
        if drained.is_empty() {
            return 0;
        }
        tracing::debug!(
            target: "peer_pair::relay",
            direction = %self.direction,
            count = drained.len(),
            "gathering complete, sending candidates to target"
        );
        let mut delivered = 0;
        for candidate in drained {
            match self.target.add_ice_candidate(candidate).await {
                Ok(()) => delivered += 1,
                Err(source) => self.reporter.error(PairError::AddCandidate {
                    index: self.direction.target,
                    source,
                }),
            }
        }
        delivered
    }

    async fn ready(&self) -> bool {
        let gathered = self.state.lock().terminated
            || self.source.ice_gathering_state() == IceGatheringState::Complete;
        if !gathered {
            return false;
        }
        match self.policy {
            CandidateFlushPolicy::OnLocalGatheringComplete => true,
            CandidateFlushPolicy::AfterRemoteDescription => {
                self.target.remote_description().await.is_some()
            }
        }
    }
}
