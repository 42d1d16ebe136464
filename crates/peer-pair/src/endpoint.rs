//! The collaborator surface the orchestrator drives.
//!
//! An [`Endpoint`] is a host-provided peer connection. The orchestrator never
//! builds session descriptions or candidates itself; it only moves the values
//! one endpoint produces into the other endpoint's setters. The traits mirror
//! the handler model of webrtc-rs: every `on_*` setter replaces the handler
//! installed before it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub type OnIceCandidateFn = Box<dyn FnMut(Option<IceCandidate>) -> HandlerFuture + Send + Sync>;
pub type OnIceConnectionStateFn =
    Box<dyn FnMut(IceConnectionState) -> HandlerFuture + Send + Sync>;
pub type OnNegotiationNeededFn = Box<dyn FnMut() -> HandlerFuture + Send + Sync>;
pub type OnDataChannelFn<C> = Box<dyn FnMut(Arc<C>) -> HandlerFuture + Send + Sync>;
pub type OnOpenFn = Box<dyn FnOnce() -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Opaque session description as produced by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

/// One gathered ICE candidate, in the JSON shape browsers exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    /// Browsers signal end-of-candidates with an empty candidate string.
    pub fn is_empty(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

impl fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceGatheringState::New => "new",
            IceGatheringState::Gathering => "gathering",
            IceGatheringState::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-channel options applied when the pairing protocol creates channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConstraints {
    pub ordered: Option<bool>,
    pub max_retransmits: Option<u16>,
}

pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Installs the open handler. Implementations must still run the handler
    /// when the channel is already open at the time it is installed.
    fn on_open(&self, handler: OnOpenFn);
}

#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    type Channel: DataChannel;

    async fn create_offer(&self) -> Result<SessionDescription, EndpointError>;

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), EndpointError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), EndpointError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError>;

    async fn create_data_channel(
        &self,
        label: &str,
        constraints: &ChannelConstraints,
    ) -> Result<Arc<Self::Channel>, EndpointError>;

    async fn close(&self) -> Result<(), EndpointError>;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn ice_gathering_state(&self) -> IceGatheringState;

    fn signaling_state(&self) -> SignalingState;

    fn on_ice_candidate(&self, handler: OnIceCandidateFn);

    fn on_ice_connection_state_change(&self, handler: OnIceConnectionStateFn);

    fn on_negotiation_needed(&self, handler: OnNegotiationNeededFn);

    fn on_data_channel(&self, handler: OnDataChannelFn<Self::Channel>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_json_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).expect("serialize candidate");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn description_kind_serializes_as_type() {
        let desc = SessionDescription::new(SdpKind::Answer, "v=0");
        let json = serde_json::to_value(&desc).expect("serialize description");
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn states_render_w3c_names() {
        assert_eq!(IceConnectionState::Completed.to_string(), "completed");
        assert_eq!(SignalingState::HaveRemoteOffer.to_string(), "have-remote-offer");
        assert_eq!(ChannelState::Open.to_string(), "open");
        assert!(IceCandidate::new("  ").is_empty());
    }
}
