//! Scripted in-process endpoints for exercising the orchestrator without a
//! real ICE stack.
//!
//! A [`FakeEndpoint`] pair behaves like two loopback peer connections: every
//! operation completes asynchronously, setting a local description starts
//! candidate gathering, the endpoint turns connected once it holds both
//! descriptions and has heard at least one remote candidate, and data
//! channels created on one side show up on the other after the next
//! handshake.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::PairConfig;
use crate::endpoint::{
    ChannelConstraints, ChannelState, DataChannel, Endpoint, IceCandidate, IceConnectionState,
    IceGatheringState, OnDataChannelFn, OnIceCandidateFn, OnIceConnectionStateFn,
    OnNegotiationNeededFn, OnOpenFn, SdpKind, SessionDescription, SignalingState,
};
use crate::error::{EndpointError, PairError};
use crate::factory::{EndpointFactory, EndpointPair};
use crate::runtime::spawn_task;

#[derive(Debug, Clone)]
pub struct FakeOptions {
    /// Candidates gathered after the first local description.
    pub candidates: usize,
    /// ICE state reached once connectivity is established.
    pub settle_state: IceConnectionState,
    /// Reject `add_ice_candidate` until a remote description is set, as real
    /// stacks do.
    pub reject_early_candidates: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            candidates: 2,
            settle_state: IceConnectionState::Connected,
            reject_early_candidates: true,
        }
    }
}

/// Operations that can be told to fail once via [`FakeEndpoint::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
    CreateDataChannel,
}

struct ChannelInner {
    state: ChannelState,
    on_open: Option<OnOpenFn>,
}

pub struct FakeChannel {
    label: String,
    inner: Mutex<ChannelInner>,
}

impl FakeChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Connecting,
                on_open: None,
            }),
        })
    }

    /// Moves the channel to `open` and runs the pending open handler.
    pub fn open(&self) {
        let handler = {
            let mut inner = self.inner.lock();
            inner.state = ChannelState::Open;
            inner.on_open.take()
        };
        if let Some(handler) = handler {
            spawn_task(handler());
        }
    }
}

impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        self.inner.lock().state
    }

    fn on_open(&self, handler: OnOpenFn) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Open {
            drop(inner);
            spawn_task(handler());
        } else {
            inner.on_open = Some(handler);
        }
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    ice: IceConnectionState,
    gathering: IceGatheringState,
    signaling: SignalingState,
    received: Vec<IceCandidate>,
    calls: Vec<String>,
    failures: Vec<FakeOp>,
    unannounced: Vec<Arc<FakeChannel>>,
    version: u64,
}

#[derive(Default)]
struct Handlers {
    ice_candidate: Mutex<Option<OnIceCandidateFn>>,
    ice_state: Mutex<Option<OnIceConnectionStateFn>>,
    negotiation_needed: Mutex<Option<OnNegotiationNeededFn>>,
    data_channel: Mutex<Option<OnDataChannelFn<FakeChannel>>>,
}

pub struct FakeEndpoint {
    index: usize,
    options: FakeOptions,
    me: Weak<FakeEndpoint>,
    peer: OnceCell<Weak<FakeEndpoint>>,
    state: Mutex<FakeState>,
    handlers: Handlers,
}

impl FakeEndpoint {
    /// Two endpoints that know about each other.
    pub fn pair(options: FakeOptions) -> [Arc<FakeEndpoint>; 2] {
        let endpoints = [0, 1].map(|index| {
            Arc::new_cyclic(|me| FakeEndpoint {
                index,
                options: options.clone(),
                me: me.clone(),
                peer: OnceCell::new(),
                state: Mutex::new(FakeState::default()),
                handlers: Handlers::default(),
            })
        });
        let _ = endpoints[0].peer.set(Arc::downgrade(&endpoints[1]));
        let _ = endpoints[1].peer.set(Arc::downgrade(&endpoints[0]));
        endpoints
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Negotiation operations performed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn received_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().received.clone()
    }

    pub fn fail_next(&self, op: FakeOp) {
        self.state.lock().failures.push(op);
    }

    /// Overrides the ICE state without notifying anyone.
    pub fn force_ice_state(&self, state: IceConnectionState) {
        self.state.lock().ice = state;
    }

    /// Runs the installed negotiation-needed handler, if any. Returns whether
    /// one was installed.
    pub async fn fire_negotiation_needed(&self) -> bool {
        let future = {
            let mut handler = self.handlers.negotiation_needed.lock();
            handler.as_mut().map(|f| f())
        };
        match future {
            Some(future) => {
                future.await;
                true
            }
            None => false,
        }
    }

    pub fn has_negotiation_handler(&self) -> bool {
        self.handlers.negotiation_needed.lock().is_some()
    }

    fn take_failure(&self, op: FakeOp) -> Result<(), EndpointError> {
        let mut state = self.state.lock();
        match state.failures.iter().position(|failure| *failure == op) {
            Some(position) => {
                state.failures.remove(position);
                Err(EndpointError::Host(format!("injected {op:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn is_settled(state: &FakeState) -> bool {
        matches!(
            state.ice,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }

    fn candidate(&self, n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{n} 1 udp 2130706431 10.0.0.{} {} typ host",
                self.index + 2,
                5000 + n
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn emit_candidate(&self, candidate: Option<IceCandidate>) {
        let future = {
            let mut handler = self.handlers.ice_candidate.lock();
            handler.as_mut().map(|f| f(candidate))
        };
        if let Some(future) = future {
            future.await;
        }
    }

    async fn emit_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        let future = {
            let mut handler = self.handlers.ice_state.lock();
            handler.as_mut().map(|f| f(ice))
        };
        if let Some(future) = future {
            future.await;
        }
    }

    fn start_gathering(&self) {
        {
            let mut state = self.state.lock();
            if state.gathering != IceGatheringState::New {
                return;
            }
            state.gathering = IceGatheringState::Gathering;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        spawn_task(async move {
            for n in 0..me.options.candidates {
                tokio::task::yield_now().await;
                me.emit_candidate(Some(me.candidate(n))).await;
            }
            me.state.lock().gathering = IceGatheringState::Complete;
            me.emit_candidate(None).await;
        });
    }

    /// Moves towards connected once both descriptions and a remote candidate
    /// are present, and announces pending channels on a settled connection.
    fn settle(&self) {
        let (connect, announce) = {
            let mut state = self.state.lock();
            let reachable = state.local.is_some()
                && state.remote.is_some()
                && (self.options.candidates == 0 || !state.received.is_empty());
            let connect = reachable && state.ice == IceConnectionState::New;
            if connect {
                state.ice = IceConnectionState::Checking;
            }
            let announce = Self::is_settled(&state)
                && state.signaling == SignalingState::Stable
                && !state.unannounced.is_empty();
            (connect, announce)
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if connect {
            spawn_task(async move {
                me.emit_ice_state(IceConnectionState::Checking).await;
                tokio::task::yield_now().await;
                me.emit_ice_state(me.options.settle_state).await;
                me.settle();
            });
        } else if announce {
            spawn_task(async move { me.announce_channels().await });
        }
    }

    async fn announce_channels(&self) {
        let channels = std::mem::take(&mut self.state.lock().unannounced);
        let Some(peer) = self.peer.get().and_then(Weak::upgrade) else {
            return;
        };
        for local in channels {
            let mirror = FakeChannel::new(local.label());
            let future = {
                let mut handler = peer.handlers.data_channel.lock();
                handler.as_mut().map(|f| f(mirror.clone()))
            };
            if let Some(future) = future {
                future.await;
            }
            tokio::task::yield_now().await;
            local.open();
            mirror.open();
        }
    }

    fn next_sdp(&self, kind: SdpKind) -> SessionDescription {
        let mut state = self.state.lock();
        state.version += 1;
        SessionDescription::new(
            kind,
            format!(
                "v=0\r\no=fake-{} {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
                self.index, state.version
            ),
        )
    }

    fn invalid_state(op: &str, state: SignalingState) -> EndpointError {
        EndpointError::Host(format!("{op} called in signaling state {state}"))
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    type Channel = FakeChannel;

    async fn create_offer(&self) -> Result<SessionDescription, EndpointError> {
        tokio::task::yield_now().await;
        self.record("create_offer".into());
        self.take_failure(FakeOp::CreateOffer)?;
        Ok(self.next_sdp(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError> {
        tokio::task::yield_now().await;
        self.record("create_answer".into());
        self.take_failure(FakeOp::CreateAnswer)?;
        let signaling = self.state.lock().signaling;
        if signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid_state("createAnswer", signaling));
        }
        Ok(self.next_sdp(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), EndpointError> {
        tokio::task::yield_now().await;
        self.record(format!("set_local_description({})", desc.kind));
        self.take_failure(FakeOp::SetLocalDescription)?;
        {
            let mut state = self.state.lock();
            state.signaling = match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, current) => return Err(Self::invalid_state("setLocalDescription", current)),
            };
            state.local = Some(desc);
        }
        self.start_gathering();
        self.settle();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), EndpointError> {
        tokio::task::yield_now().await;
        self.record(format!("set_remote_description({})", desc.kind));
        self.take_failure(FakeOp::SetRemoteDescription)?;
        {
            let mut state = self.state.lock();
            state.signaling = match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, current) => return Err(Self::invalid_state("setRemoteDescription", current)),
            };
            state.remote = Some(desc);
        }
        self.settle();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError> {
        tokio::task::yield_now().await;
        self.take_failure(FakeOp::AddCandidate)?;
        {
            let mut state = self.state.lock();
            if self.options.reject_early_candidates && state.remote.is_none() {
                return Err(EndpointError::Host("no remote description".into()));
            }
            state.received.push(candidate);
        }
        self.settle();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _constraints: &ChannelConstraints,
    ) -> Result<Arc<FakeChannel>, EndpointError> {
        self.record(format!("create_data_channel({label})"));
        self.take_failure(FakeOp::CreateDataChannel)?;
        let channel = FakeChannel::new(label);
        let settled = {
            let mut state = self.state.lock();
            state.unannounced.push(channel.clone());
            Self::is_settled(&state)
        };
        if settled && self.has_negotiation_handler() {
            if let Some(me) = self.me.upgrade() {
                spawn_task(async move {
                    me.fire_negotiation_needed().await;
                });
            }
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<(), EndpointError> {
        let mut state = self.state.lock();
        state.ice = IceConnectionState::Closed;
        state.signaling = SignalingState::Closed;
        Ok(())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().gathering
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn on_ice_candidate(&self, handler: OnIceCandidateFn) {
        *self.handlers.ice_candidate.lock() = Some(handler);
    }

    fn on_ice_connection_state_change(&self, handler: OnIceConnectionStateFn) {
        *self.handlers.ice_state.lock() = Some(handler);
    }

    fn on_negotiation_needed(&self, handler: OnNegotiationNeededFn) {
        *self.handlers.negotiation_needed.lock() = Some(handler);
    }

    fn on_data_channel(&self, handler: OnDataChannelFn<FakeChannel>) {
        *self.handlers.data_channel.lock() = Some(handler);
    }
}

/// Factory handing out [`FakeEndpoint`] pairs.
#[derive(Debug, Clone, Default)]
pub struct FakeFactory {
    pub options: FakeOptions,
}

#[async_trait]
impl EndpointFactory<FakeEndpoint> for FakeFactory {
    async fn create_pair(&self, _config: &PairConfig) -> Result<EndpointPair<FakeEndpoint>, PairError> {
        Ok(EndpointPair::new(FakeEndpoint::pair(self.options.clone())))
    }
}
