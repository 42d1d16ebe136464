use std::any::Any;
use std::ops::Index;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channels::{ChannelPair, ChannelPairing, PairingCallback};
use crate::config::PairConfig;
use crate::endpoint::Endpoint;
use crate::error::PairError;
use crate::factory::{EndpointFactory, EndpointPair};
use crate::monitor::ConnectionMonitor;
use crate::negotiator::{Direction, NegotiationOutcome, Negotiator};
use crate::observer::{Reporter, SessionEvent, SessionObserver};
use crate::relay::CandidateRelay;
use crate::renegotiation;
use crate::webrtc::WebRtcFactory;

/// Two endpoints wired to negotiate with each other in-process.
///
/// Indexing gives the endpoints in order; `pair[0]` makes the initial offer.
/// The session does not close its endpoints on drop, call [`PeerPair::close`]
/// when done with them.
pub struct PeerPair<E: Endpoint> {
    endpoints: [Arc<E>; 2],
    config: PairConfig,
    reporter: Reporter,
    relays: [Arc<CandidateRelay<E>>; 2],
    negotiator: Arc<Negotiator<E>>,
    monitor: Arc<ConnectionMonitor<E>>,
    pairing_generation: Arc<AtomicU64>,
    _keepalive: Option<Box<dyn Any + Send + Sync>>,
}

impl PeerPair<RTCPeerConnection> {
    /// Creates two webrtc-rs peer connections using `config`.
    pub async fn new(config: PairConfig) -> Result<Self, PairError> {
        Self::with_factory(&WebRtcFactory::new(), config).await
    }

    /// Like [`PeerPair::new`] but on an in-process virtual network.
    pub async fn loopback(config: PairConfig) -> Result<Self, PairError> {
        Self::with_factory(&WebRtcFactory::loopback(), config).await
    }
}

impl<E: Endpoint> PeerPair<E> {
    pub async fn with_factory<F>(factory: &F, config: PairConfig) -> Result<Self, PairError>
    where
        F: EndpointFactory<E>,
    {
        let EndpointPair {
            endpoints,
            keepalive,
        } = factory.create_pair(&config).await?;
        let mut pair = Self::from_endpoints(endpoints, config);
        pair._keepalive = keepalive;
        Ok(pair)
    }

    /// Wires up endpoints the caller already constructed.
    pub fn from_endpoints(endpoints: [Arc<E>; 2], config: PairConfig) -> Self {
        let reporter = Reporter::new(config.event_capacity);

        let relays = [Direction::FORWARD, Direction::REVERSE].map(|direction| {
            CandidateRelay::new(
                direction,
                Arc::clone(&endpoints[direction.source]),
                Arc::clone(&endpoints[direction.target]),
                config.candidate_flush,
                reporter.clone(),
            )
        });
        for relay in &relays {
            relay.attach();
        }

        let negotiator = Negotiator::new(endpoints.clone(), relays.clone(), reporter.clone());

        let monitor =
            ConnectionMonitor::new(endpoints.clone(), config.connected_policy, reporter.clone());
        let armed = Arc::downgrade(&negotiator);
        monitor.once_connected(move || {
            if let Some(negotiator) = armed.upgrade() {
                renegotiation::arm(&negotiator);
            }
        });
        monitor.attach();

        tracing::debug!(
            target: "peer_pair::session",
            connected_policy = ?config.connected_policy,
            candidate_flush = ?config.candidate_flush,
            "peer pair wired"
        );

        Self {
            endpoints,
            config,
            reporter,
            relays,
            negotiator,
            monitor,
            pairing_generation: Arc::new(AtomicU64::new(0)),
            _keepalive: None,
        }
    }

    /// Replaces the default tracing observer.
    pub fn with_observer(self, observer: Arc<dyn SessionObserver>) -> Self {
        self.reporter.set_observer(observer);
        self
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &[Arc<E>; 2] {
        &self.endpoints
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<E>> {
        self.endpoints.iter()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Candidates still held by the relay for `direction`.
    pub fn pending_candidates(&self, direction: Direction) -> usize {
        self.relays[direction.source].pending()
    }

    /// Kicks off the initial handshake with endpoint 0 offering.
    pub fn connect(&self) -> JoinHandle<NegotiationOutcome> {
        self.negotiator.spawn(Direction::FORWARD)
    }

    /// Runs one handshake in `direction` and waits for it.
    pub async fn negotiate(&self, direction: Direction) -> NegotiationOutcome {
        self.negotiator.negotiate(direction).await
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.reporter.subscribe()
    }

    /// Whether both endpoints satisfy the connected policy right now.
    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }

    /// Resolves once the session announced `Connected`.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), PairError> {
        let mut events = self.reporter.subscribe();
        if self.monitor.has_announced() {
            return Ok(());
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Connected) => return Ok(()),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.monitor.has_announced() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PairError::ChannelClosed);
                    }
                }
            }
        };
        timeout(limit, wait).await.map_err(|_| PairError::Timeout)?
    }

    /// Creates one channel per name on endpoint 0, pairs each with its mirror
    /// on endpoint 1 and starts the handshake. `callback` runs once every
    /// channel on both sides is open; without a callback the pairing still
    /// proceeds. Endpoint 1's incoming-channel handler is released once the
    /// requested channels have arrived.
    pub async fn create_channels_and_connect<S: AsRef<str>>(
        &self,
        names: &[S],
        callback: Option<PairingCallback<E::Channel>>,
    ) {
        let generation = self.pairing_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pairing = ChannelPairing::new(names.len(), callback, self.reporter.clone());

        if !names.is_empty() {
            let capture = Arc::clone(&pairing);
            let receiver = Arc::downgrade(&self.endpoints[1]);
            let current = Arc::clone(&self.pairing_generation);
            self.endpoints[1].on_data_channel(Box::new(move |channel| {
                let pairing = Arc::clone(&capture);
                let receiver = receiver.clone();
                let current = Arc::clone(&current);
                Box::pin(async move {
                    if !pairing.arrive(channel) || current.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    if let Some(receiver) = receiver.upgrade() {
                        release_channel_handler(&*receiver);
                    }
                })
            }));
        }

        for name in names {
            let label = name.as_ref();
            match self.endpoints[0]
                .create_data_channel(label, &self.config.constraints)
                .await
            {
                Ok(channel) => pairing.add_sender(channel),
                Err(source) => {
                    pairing.fail(PairError::CreateChannel {
                        label: label.to_string(),
                        source,
                    });
                    if self.pairing_generation.load(Ordering::SeqCst) == generation {
                        release_channel_handler(&*self.endpoints[1]);
                    }
                    return;
                }
            }
        }
        pairing.seal();

        self.negotiator.spawn(Direction::FORWARD);
    }

    /// [`PeerPair::create_channels_and_connect`] returning the pairs directly.
    pub async fn channels_and_connect<S: AsRef<str>>(
        &self,
        names: &[S],
        limit: Duration,
    ) -> Result<Vec<ChannelPair<E::Channel>>, PairError> {
        let (tx, rx) = oneshot::channel();
        self.create_channels_and_connect(
            names,
            Some(Box::new(
                move |result: Result<Vec<ChannelPair<E::Channel>>, PairError>| {
                    let _ = tx.send(result);
                },
            )),
        )
        .await;
        timeout(limit, rx)
            .await
            .map_err(|_| PairError::Timeout)?
            .map_err(|_| PairError::ChannelClosed)?
    }

    /// Closes both endpoints. A failure on the first is logged and the second is
    /// still closed.
    pub async fn close(&self) {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if let Err(err) = endpoint.close().await {
                tracing::warn!(
                    target: "peer_pair::session",
                    index,
                    error = %err,
                    "failed to close endpoint"
                );
            }
        }
    }
}

fn release_channel_handler<E: Endpoint>(endpoint: &E) {
    endpoint.on_data_channel(Box::new(|_| Box::pin(async {})));
}

impl<E: Endpoint> Index<usize> for PeerPair<E> {
    type Output = Arc<E>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.endpoints[index]
    }
}

impl<'a, E: Endpoint> IntoIterator for &'a PeerPair<E> {
    type Item = &'a Arc<E>;
    type IntoIter = std::slice::Iter<'a, Arc<E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEndpoint, FakeOptions};

    #[tokio::test]
    async fn behaves_like_an_ordered_pair() {
        let endpoints = FakeEndpoint::pair(FakeOptions::default());
        let pair = PeerPair::from_endpoints(endpoints.clone(), PairConfig::default());
        assert_eq!(pair.len(), 2);
        assert!(Arc::ptr_eq(&pair[0], &endpoints[0]));
        assert_eq!(pair.iter().map(|e| e.index()).collect::<Vec<_>>(), vec![0, 1]);
        assert!(!pair.is_connected());
    }

    #[tokio::test]
    async fn wait_connected_times_out_without_handshake() {
        let pair = PeerPair::from_endpoints(
            FakeEndpoint::pair(FakeOptions::default()),
            PairConfig::default(),
        );
        let result = pair.wait_connected(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PairError::Timeout)));
    }
}
