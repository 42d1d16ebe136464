use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::endpoint::IceConnectionState;
use crate::error::PairError;
use crate::negotiator::{Direction, NegotiationPhase};

/// Notifications published on [`crate::PeerPair::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Both endpoints reached a connected ICE state. Sent once per session.
    Connected,
    /// An endpoint raised negotiation-needed and a handshake was started.
    Renegotiating(Direction),
    Error(String),
}

/// Hook the orchestrator calls for state transitions and failures.
///
/// Every method has a default that logs through `tracing`, so implementors
/// only override what they care about.
pub trait SessionObserver: Send + Sync + 'static {
    fn on_transition(&self, direction: Direction, phase: NegotiationPhase) {
        tracing::debug!(
            target: "peer_pair::negotiator",
            %direction,
            ?phase,
            "handshake advanced"
        );
    }

    fn on_ice_state(&self, index: usize, state: IceConnectionState) {
        tracing::debug!(
            target: "peer_pair::monitor",
            index,
            %state,
            "ice connection state changed"
        );
    }

    fn on_error(&self, error: &PairError) {
        tracing::warn!(target: "peer_pair", error = %error, "peer pair error");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {}

/// Shared error reporter and event publisher for one session.
#[derive(Clone)]
pub(crate) struct Reporter {
    observer: Arc<RwLock<Arc<dyn SessionObserver>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Reporter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            observer: Arc::new(RwLock::new(Arc::new(TracingObserver))),
            events,
        }
    }

    pub(crate) fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.observer.write() = observer;
    }

    fn observer(&self) -> Arc<dyn SessionObserver> {
        self.observer.read().clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn transition(&self, direction: Direction, phase: NegotiationPhase) {
        self.observer().on_transition(direction, phase);
    }

    pub(crate) fn ice_state(&self, index: usize, state: IceConnectionState) {
        self.observer().on_ice_state(index, state);
    }

    pub(crate) fn error(&self, error: PairError) {
        self.observer().on_error(&error);
        self.emit(SessionEvent::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        errors: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recording {
        fn on_error(&self, error: &PairError) {
            self.errors.lock().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn errors_reach_observer_and_subscribers() {
        let reporter = Reporter::new(8);
        let recording = Arc::new(Recording::default());
        reporter.set_observer(recording.clone());
        let mut events = reporter.subscribe();

        reporter.error(PairError::Timeout);

        assert_eq!(recording.errors.lock().as_slice(), ["timed out"]);
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::Error("timed out".into())
        );
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let reporter = Reporter::new(1);
        reporter.emit(SessionEvent::Connected);
        reporter.error(PairError::ChannelClosed);
    }
}
