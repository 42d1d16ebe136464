use thiserror::Error;

use crate::negotiator::Direction;

#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    #[error("peer connection error: {0}")]
    Host(String),
    #[error("unsupported session description type {0}")]
    UnsupportedSdp(String),
    #[error("endpoint closed")]
    Closed,
}

impl EndpointError {
    pub fn host<E: std::fmt::Display>(err: E) -> Self {
        EndpointError::Host(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("createOffer failed ({direction}): {source}")]
    CreateOffer {
        direction: Direction,
        #[source]
        source: EndpointError,
    },
    #[error("createAnswer failed ({direction}): {source}")]
    CreateAnswer {
        direction: Direction,
        #[source]
        source: EndpointError,
    },
    #[error("setLocalDescription failed on endpoint {index} ({direction}): {source}")]
    SetLocalDescription {
        direction: Direction,
        index: usize,
        #[source]
        source: EndpointError,
    },
    #[error("setRemoteDescription failed on endpoint {index} ({direction}): {source}")]
    SetRemoteDescription {
        direction: Direction,
        index: usize,
        #[source]
        source: EndpointError,
    },
    #[error("endpoint {index} has no local description to relay ({direction})")]
    MissingLocalDescription { direction: Direction, index: usize },
}

#[derive(Debug, Clone, Error)]
pub enum PairError {
    #[error("endpoint setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("addIceCandidate failed on endpoint {index}: {source}")]
    AddCandidate {
        index: usize,
        #[source]
        source: EndpointError,
    },
    #[error("failed to create data channel {label:?}: {source}")]
    CreateChannel {
        label: String,
        #[source]
        source: EndpointError,
    },
    #[error("data channel {label:?} has no counterpart on the remote endpoint")]
    UnmatchedChannel { label: String },
    #[error("timed out")]
    Timeout,
    #[error("session event channel closed")]
    ChannelClosed,
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> PairError {
    PairError::Setup(err.to_string())
}
