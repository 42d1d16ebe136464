//! Connection-state monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::ConnectedPolicy;
use crate::endpoint::Endpoint;
use crate::observer::{Reporter, SessionEvent};

type ConnectedHook = Box<dyn FnOnce() + Send + Sync>;

pub(crate) struct ConnectionMonitor<E: Endpoint> {
    endpoints: [Arc<E>; 2],
    policy: ConnectedPolicy,
    announced: AtomicBool,
    on_connected: Mutex<Option<ConnectedHook>>,
    reporter: Reporter,
}

impl<E: Endpoint> ConnectionMonitor<E> {
    pub(crate) fn new(endpoints: [Arc<E>; 2], policy: ConnectedPolicy, reporter: Reporter) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            policy,
            announced: AtomicBool::new(false),
            on_connected: Mutex::new(None),
            reporter,
        })
    }

    /// Registers the one-shot listener run on the first connected transition.
    pub(crate) fn once_connected(&self, hook: impl FnOnce() + Send + Sync + 'static) {
        *self.on_connected.lock() = Some(Box::new(hook));
    }

    pub(crate) fn attach(self: &Arc<Self>) {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let monitor: Weak<Self> = Arc::downgrade(self);
            endpoint.on_ice_connection_state_change(Box::new(move |state| {
                let monitor = monitor.clone();
                Box::pin(async move {
                    if let Some(monitor) = monitor.upgrade() {
                        monitor.reporter.ice_state(index, state);
                        monitor.check();
                    }
                })
            }));
        }
    }

    /// Both endpoints currently satisfy the connected policy. Read from the
    /// endpoints on every call.
    pub(crate) fn is_connected(&self) -> bool {
        self.endpoints
            .iter()
            .filter(|endpoint| self.policy.accepts(endpoint.ice_connection_state()))
            .count()
            == 2
    }

    pub(crate) fn has_announced(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    /// Recomputes the connected flag and announces the first time it holds.
    pub(crate) fn check(&self) {
        if !self.is_connected() || self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "peer_pair::monitor", "both endpoints connected");
        self.reporter.emit(SessionEvent::Connected);
        let hook = self.on_connected.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::IceConnectionState;
    use crate::testing::{FakeEndpoint, FakeOptions};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn announces_once_when_both_connected() {
        let pair = FakeEndpoint::pair(FakeOptions::default());
        let reporter = Reporter::new(8);
        let mut events = reporter.subscribe();
        let monitor = ConnectionMonitor::new(pair.clone(), ConnectedPolicy::ConnectedOnly, reporter);
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        monitor.once_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pair[0].force_ice_state(IceConnectionState::Connected);
        monitor.check();
        assert!(!monitor.has_announced());

        pair[1].force_ice_state(IceConnectionState::Connected);
        monitor.check();
        monitor.check();

        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(events.try_recv().expect("event"), SessionEvent::Connected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn completed_needs_relaxed_policy() {
        let pair = FakeEndpoint::pair(FakeOptions::default());
        pair[0].force_ice_state(IceConnectionState::Completed);
        pair[1].force_ice_state(IceConnectionState::Connected);

        let strict = ConnectionMonitor::new(pair.clone(), ConnectedPolicy::ConnectedOnly, Reporter::new(1));
        let relaxed =
            ConnectionMonitor::new(pair.clone(), ConnectedPolicy::ConnectedOrCompleted, Reporter::new(1));

        assert!(!strict.is_connected());
        assert!(relaxed.is_connected());
    }
}
