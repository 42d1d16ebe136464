//! Offer/answer handshake between the two endpoints of a session.
//!
//! A handshake is an explicit state machine advanced one asynchronous step at
//! a time:
//!
//! ```text
//! Idle --createOffer--> OfferCreated --source.setLocal--> LocalSet
//!   --target.setRemote--> RemoteAnswerPending --createAnswer, target.setLocal--> AnswerSet
//!   --source.setRemote--> Complete
//! ```
//!
//! Each handshake keeps its state on its own stack. The only thing shared
//! between handshakes is the session's serial lock, which keeps a
//! renegotiation from interleaving with one that is still outstanding.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::endpoint::{Endpoint, SessionDescription};
use crate::error::{NegotiationError, PairError};
use crate::observer::Reporter;
use crate::relay::CandidateRelay;
use crate::runtime::spawn_task;

/// A directed pair of endpoint indices: `source` makes the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Direction {
    pub source: usize,
    pub target: usize,
}

impl Direction {
    pub const FORWARD: Direction = Direction {
        source: 0,
        target: 1,
    };
    pub const REVERSE: Direction = Direction {
        source: 1,
        target: 0,
    };

    pub fn reversed(self) -> Direction {
        Direction {
            source: self.target,
            target: self.source,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    Idle,
    OfferCreated,
    LocalSet,
    RemoteAnswerPending,
    AnswerSet,
    Complete,
}

/// Where a handshake ended up.
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    pub direction: Direction,
    /// Last phase reached. Equal to `Complete` unless `error` is set.
    pub phase: NegotiationPhase,
    pub error: Option<NegotiationError>,
}

impl NegotiationOutcome {
    pub fn is_complete(&self) -> bool {
        self.phase == NegotiationPhase::Complete && self.error.is_none()
    }
}

enum Step {
    Idle,
    OfferCreated(SessionDescription),
    LocalSet,
    RemoteAnswerPending,
    AnswerSet(SessionDescription),
    Complete,
}

impl Step {
    fn phase(&self) -> NegotiationPhase {
        match self {
            Step::Idle => NegotiationPhase::Idle,
            Step::OfferCreated(_) => NegotiationPhase::OfferCreated,
            Step::LocalSet => NegotiationPhase::LocalSet,
            Step::RemoteAnswerPending => NegotiationPhase::RemoteAnswerPending,
            Step::AnswerSet(_) => NegotiationPhase::AnswerSet,
            Step::Complete => NegotiationPhase::Complete,
        }
    }
}

pub(crate) struct Negotiator<E: Endpoint> {
    endpoints: [Arc<E>; 2],
    /// Indexed by the relay's source endpoint.
    relays: [Arc<CandidateRelay<E>>; 2],
    reporter: Reporter,
    serial: AsyncMutex<()>,
}

impl<E: Endpoint> Negotiator<E> {
    pub(crate) fn new(
        endpoints: [Arc<E>; 2],
        relays: [Arc<CandidateRelay<E>>; 2],
        reporter: Reporter,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            relays,
            reporter,
            serial: AsyncMutex::new(()),
        })
    }

    pub(crate) fn endpoint(&self, index: usize) -> &Arc<E> {
        &self.endpoints[index]
    }

    pub(crate) fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Starts a handshake on the runtime without waiting for it.
    pub(crate) fn spawn(self: &Arc<Self>, direction: Direction) -> JoinHandle<NegotiationOutcome> {
        let negotiator = Arc::clone(self);
        spawn_task(async move { negotiator.negotiate(direction).await })
    }

    /// Runs one complete offer/answer exchange. Failures are reported and end
    /// this attempt only; the endpoints keep whatever state the host left.
    pub(crate) async fn negotiate(&self, direction: Direction) -> NegotiationOutcome {
        let _serial = self.serial.lock().await;
        tracing::debug!(target: "peer_pair::negotiator", %direction, "creating offer");

        let mut step = Step::Idle;
        loop {
            step = match self.advance(direction, step).await {
                Ok(next) => next,
                Err((phase, err)) => {
                    self.reporter.error(PairError::Negotiation(err.clone()));
                    return NegotiationOutcome {
                        direction,
                        phase,
                        error: Some(err),
                    };
                }
            };
            let phase = step.phase();
            self.reporter.transition(direction, phase);
            if phase == NegotiationPhase::Complete {
                tracing::debug!(
                    target: "peer_pair::negotiator",
                    %direction,
                    signaling = %self.endpoints[direction.target].signaling_state(),
                    "handshake ok"
                );
                return NegotiationOutcome {
                    direction,
                    phase,
                    error: None,
                };
            }
        }
    }

    async fn advance(
        &self,
        direction: Direction,
        step: Step,
    ) -> Result<Step, (NegotiationPhase, NegotiationError)> {
        let source = &self.endpoints[direction.source];
        let target = &self.endpoints[direction.target];
        let phase = step.phase();
        let next = match step {
            Step::Idle => {
                let offer = source
                    .create_offer()
                    .await
                    .map_err(|source| NegotiationError::CreateOffer { direction, source })
                    .map_err(|err| (phase, err))?;
                Step::OfferCreated(offer)
            }
            Step::OfferCreated(offer) => {
                source
                    .set_local_description(offer)
                    .await
                    .map_err(|err| (phase, set_local(direction, direction.source, err)))?;
                Step::LocalSet
            }
            Step::LocalSet => {
                // the target takes the source's current local description, not
                // the value createOffer returned
                let offer = source.local_description().await.ok_or((
                    phase,
                    NegotiationError::MissingLocalDescription {
                        direction,
                        index: direction.source,
                    },
                ))?;
                target
                    .set_remote_description(offer)
                    .await
                    .map_err(|err| (phase, set_remote(direction, direction.target, err)))?;
                self.relays[direction.source].flush().await;
                Step::RemoteAnswerPending
            }
            Step::RemoteAnswerPending => {
                let answer = target
                    .create_answer()
                    .await
                    .map_err(|source| NegotiationError::CreateAnswer { direction, source })
                    .map_err(|err| (phase, err))?;
                target
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|err| (phase, set_local(direction, direction.target, err)))?;
                Step::AnswerSet(answer)
            }
            Step::AnswerSet(answer) => {
                source
                    .set_remote_description(answer)
                    .await
                    .map_err(|err| (phase, set_remote(direction, direction.source, err)))?;
                self.relays[direction.target].flush().await;
                Step::Complete
            }
            Step::Complete => Step::Complete,
        };
        Ok(next)
    }
}

fn set_local(
    direction: Direction,
    index: usize,
    source: crate::error::EndpointError,
) -> NegotiationError {
    NegotiationError::SetLocalDescription {
        direction,
        index,
        source,
    }
}

fn set_remote(
    direction: Direction,
    index: usize,
    source: crate::error::EndpointError,
) -> NegotiationError {
    NegotiationError::SetRemoteDescription {
        direction,
        index,
        source,
    }
}
