//! Endpoint implementation over webrtc-rs peer connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::config::{IceServer, PairConfig};
use crate::endpoint::{
    ChannelConstraints, ChannelState, DataChannel, Endpoint, HandlerFuture, IceCandidate,
    IceConnectionState, IceGatheringState, OnDataChannelFn, OnIceCandidateFn, OnIceConnectionStateFn,
    OnNegotiationNeededFn, OnOpenFn, SdpKind, SessionDescription, SignalingState,
};
use crate::error::{EndpointError, PairError, to_setup_error};
use crate::factory::{EndpointFactory, EndpointPair};

const LOOPBACK_CIDR: &str = "10.0.0.0/24";
const LOOPBACK_IPS: [&str; 2] = ["10.0.0.2", "10.0.0.3"];

impl From<RTCSessionDescription> for SessionDescription {
    fn from(desc: RTCSessionDescription) -> Self {
        let kind = match desc.sdp_type {
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Offer | RTCSdpType::Unspecified => SdpKind::Offer,
        };
        SessionDescription::new(kind, desc.sdp)
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EndpointError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(EndpointError::host),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(EndpointError::host),
        SdpKind::Pranswer => {
            RTCSessionDescription::pranswer(desc.sdp).map_err(EndpointError::host)
        }
        SdpKind::Rollback => Err(EndpointError::UnsupportedSdp(desc.kind.to_string())),
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                IceConnectionState::New
            }
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

impl From<RTCIceGatheringState> for IceGatheringState {
    fn from(state: RTCIceGatheringState) -> Self {
        match state {
            RTCIceGatheringState::Unspecified | RTCIceGatheringState::New => {
                IceGatheringState::New
            }
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
        }
    }
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }
}

impl From<RTCDataChannelState> for ChannelState {
    fn from(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

impl DataChannel for RTCDataChannel {
    fn label(&self) -> &str {
        RTCDataChannel::label(self)
    }

    fn ready_state(&self) -> ChannelState {
        RTCDataChannel::ready_state(self).into()
    }

    fn on_open(&self, handler: OnOpenFn) {
        RTCDataChannel::on_open(self, handler);
    }
}

#[async_trait]
impl Endpoint for RTCPeerConnection {
    type Channel = RTCDataChannel;

    async fn create_offer(&self) -> Result<SessionDescription, EndpointError> {
        let offer = RTCPeerConnection::create_offer(self, None)
            .await
            .map_err(EndpointError::host)?;
        Ok(offer.into())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError> {
        let answer = RTCPeerConnection::create_answer(self, None)
            .await
            .map_err(EndpointError::host)?;
        Ok(answer.into())
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), EndpointError> {
        let desc = to_rtc_description(desc)?;
        RTCPeerConnection::set_local_description(self, desc)
            .await
            .map_err(EndpointError::host)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), EndpointError> {
        let desc = to_rtc_description(desc)?;
        RTCPeerConnection::set_remote_description(self, desc)
            .await
            .map_err(EndpointError::host)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        RTCPeerConnection::local_description(self)
            .await
            .map(Into::into)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        RTCPeerConnection::remote_description(self)
            .await
            .map(Into::into)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError> {
        RTCPeerConnection::add_ice_candidate(self, candidate.into())
            .await
            .map_err(EndpointError::host)
    }

    async fn create_data_channel(
        &self,
        label: &str,
        constraints: &ChannelConstraints,
    ) -> Result<Arc<RTCDataChannel>, EndpointError> {
        let init = RTCDataChannelInit {
            ordered: constraints.ordered,
            max_retransmits: constraints.max_retransmits,
            ..Default::default()
        };
        RTCPeerConnection::create_data_channel(self, label, Some(init))
            .await
            .map_err(EndpointError::host)
    }

    async fn close(&self) -> Result<(), EndpointError> {
        RTCPeerConnection::close(self)
            .await
            .map_err(EndpointError::host)
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        RTCPeerConnection::ice_connection_state(self).into()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        RTCPeerConnection::ice_gathering_state(self).into()
    }

    fn signaling_state(&self) -> SignalingState {
        RTCPeerConnection::signaling_state(self).into()
    }

    fn on_ice_candidate(&self, mut handler: OnIceCandidateFn) {
        RTCPeerConnection::on_ice_candidate(
            self,
            Box::new(move |candidate: Option<RTCIceCandidate>| -> HandlerFuture {
                let candidate = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(IceCandidate::from(init)),
                        Err(err) => {
                            tracing::warn!(
                                target: "peer_pair::webrtc",
                                error = %err,
                                "dropping candidate that failed to serialize"
                            );
                            return Box::pin(async {});
                        }
                    },
                    None => None,
                };
                handler(candidate)
            }),
        );
    }

    fn on_ice_connection_state_change(&self, mut handler: OnIceConnectionStateFn) {
        RTCPeerConnection::on_ice_connection_state_change(
            self,
            Box::new(move |state: RTCIceConnectionState| handler(state.into())),
        );
    }

    fn on_negotiation_needed(&self, handler: OnNegotiationNeededFn) {
        RTCPeerConnection::on_negotiation_needed(self, handler);
    }

    fn on_data_channel(&self, handler: OnDataChannelFn<RTCDataChannel>) {
        RTCPeerConnection::on_data_channel(self, handler);
    }
}

fn build_api(setting: SettingEngine) -> Result<API, PairError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// `Router::start` returns a future that is not `Send`, so it is driven on a
/// blocking thread instead of inside the caller's future.
async fn start_router(router: &Arc<AsyncMutex<Router>>) -> Result<(), PairError> {
    let router = Arc::clone(router);
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || {
        handle.block_on(async move {
            let mut router = router.lock().await;
            router.start().await
        })
    })
    .await
    .map_err(to_setup_error)?
    .map_err(to_setup_error)
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), PairError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(nic_clone)
            .await
            .map_err(to_setup_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(to_setup_error)?;
    }
    Ok(())
}

/// Builds [`RTCPeerConnection`] pairs.
#[derive(Debug, Clone, Default)]
pub struct WebRtcFactory {
    loopback: bool,
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts both endpoints on an in-process virtual network so they connect
    /// without touching OS networking.
    pub fn loopback() -> Self {
        Self { loopback: true }
    }

    async fn loopback_settings() -> Result<([SettingEngine; 2], Arc<AsyncMutex<Router>>), PairError> {
        let wan = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: LOOPBACK_CIDR.to_owned(),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));

        let mut settings = [SettingEngine::default(), SettingEngine::default()];
        for (setting, ip) in settings.iter_mut().zip(LOOPBACK_IPS) {
            let vnet = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![ip.to_owned()],
                ..Default::default()
            })));
            attach_vnet_to_router(&vnet, &wan).await?;
            setting.set_vnet(Some(vnet));
            setting.set_ice_timeouts(
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_millis(200)),
            );
        }

        start_router(&wan).await?;
        Ok((settings, wan))
    }
}

#[async_trait]
impl EndpointFactory<RTCPeerConnection> for WebRtcFactory {
    async fn create_pair(
        &self,
        config: &PairConfig,
    ) -> Result<EndpointPair<RTCPeerConnection>, PairError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };

        let (settings, router) = if self.loopback {
            let (settings, router) = Self::loopback_settings().await?;
            (settings, Some(router))
        } else {
            ([SettingEngine::default(), SettingEngine::default()], None)
        };

        let mut endpoints = Vec::with_capacity(2);
        for setting in settings {
            let api = build_api(setting)?;
            let pc = api
                .new_peer_connection(rtc_config.clone())
                .await
                .map_err(to_setup_error)?;
            endpoints.push(Arc::new(pc));
        }
        let endpoints: [Arc<RTCPeerConnection>; 2] = endpoints
            .try_into()
            .map_err(|_| PairError::Setup("expected two peer connections".into()))?;

        tracing::debug!(
            target: "peer_pair::webrtc",
            loopback = self.loopback,
            ice_servers = config.ice_servers.len(),
            "created peer connections"
        );

        let pair = EndpointPair::new(endpoints);
        Ok(match router {
            Some(router) => pair.with_keepalive(router),
            None => pair,
        })
    }
}
