//! In-process pairing of two WebRTC peer connections.
//!
//! A [`PeerPair`] owns two endpoints and runs the signaling between them
//! directly: offers and answers are handed across, ICE candidates are relayed
//! once the receiving side can take them, and renegotiation is triggered
//! automatically after the first successful connection. Data channels created
//! through [`PeerPair::create_channels_and_connect`] are matched with their
//! counterparts by label.
//!
//! ```no_run
//! # async fn demo() -> Result<(), peer_pair::PairError> {
//! use std::time::Duration;
//! use peer_pair::{PairConfig, PeerPair};
//!
//! let pair = PeerPair::loopback(PairConfig::default()).await?;
//! let channels = pair
//!     .channels_and_connect(&["control"], Duration::from_secs(5))
//!     .await?;
//! assert_eq!(channels[0].label(), "control");
//! pair.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod factory;
mod monitor;
pub mod negotiator;
pub mod observer;
mod relay;
mod renegotiation;
mod runtime;
pub mod session;
pub mod testing;
pub mod webrtc;

pub use channels::{ChannelPair, PairingCallback};
pub use config::{CandidateFlushPolicy, ConnectedPolicy, IceServer, PairConfig, PairConfigBuilder};
pub use endpoint::{
    ChannelConstraints, ChannelState, DataChannel, Endpoint, IceCandidate, IceConnectionState,
    IceGatheringState, SdpKind, SessionDescription, SignalingState,
};
pub use error::{EndpointError, NegotiationError, PairError};
pub use factory::{EndpointFactory, EndpointPair};
pub use negotiator::{Direction, NegotiationOutcome, NegotiationPhase};
pub use observer::{SessionEvent, SessionObserver, TracingObserver};
pub use session::PeerPair;
pub use self::webrtc::WebRtcFactory;
