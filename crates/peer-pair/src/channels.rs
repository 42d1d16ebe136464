//! Data channel pairing.
//!
//! Channels are created on endpoint 0, their mirrors arrive on endpoint 1 and
//! are matched back by label. The caller hears about the set once every
//! channel on both sides is open.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::{ChannelState, DataChannel};
use crate::error::PairError;
use crate::observer::Reporter;

pub type PairingCallback<C> = Box<dyn FnOnce(Result<Vec<ChannelPair<C>>, PairError>) + Send + 'static>;

/// `[sender, receiver]` for one label: the sender lives on endpoint 0.
pub struct ChannelPair<C> {
    channels: [Arc<C>; 2],
}

impl<C> Clone for ChannelPair<C> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
        }
    }
}

impl<C: DataChannel> ChannelPair<C> {
    pub fn label(&self) -> &str {
        self.channels[0].label()
    }

    pub fn sender(&self) -> &Arc<C> {
        &self.channels[0]
    }

    pub fn receiver(&self) -> &Arc<C> {
        &self.channels[1]
    }

    pub fn is_open(&self) -> bool {
        self.channels
            .iter()
            .all(|channel| channel.ready_state() == ChannelState::Open)
    }

    pub fn into_array(self) -> [Arc<C>; 2] {
        self.channels
    }
}

impl<C: DataChannel> std::fmt::Debug for ChannelPair<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPair")
            .field("label", &self.label())
            .field("sender", &self.channels[0].ready_state())
            .field("receiver", &self.channels[1].ready_state())
            .finish()
    }
}

struct Pending<C> {
    sender: Arc<C>,
    receiver: Option<Arc<C>>,
}

struct PairingState<C> {
    pending: Vec<Pending<C>>,
    arrived: Vec<Arc<C>>,
    matched: bool,
    waiting: bool,
    callback: Option<PairingCallback<C>>,
}

enum Readiness<C> {
    Done(Option<PairingCallback<C>>, Vec<ChannelPair<C>>),
    WaitOn(Arc<C>),
    Failed(Option<PairingCallback<C>>, PairError),
    Idle,
}

pub(crate) struct ChannelPairing<C: DataChannel> {
    expected: usize,
    state: Mutex<PairingState<C>>,
    reporter: Reporter,
}

impl<C: DataChannel> ChannelPairing<C> {
    /// A pairing for `expected` channels. Senders are added as they are
    /// created; remote channels may arrive before the last sender exists.
    pub(crate) fn new(
        expected: usize,
        callback: Option<PairingCallback<C>>,
        reporter: Reporter,
    ) -> Arc<Self> {
        Arc::new(Self {
            expected,
            state: Mutex::new(PairingState {
                pending: Vec::with_capacity(expected),
                arrived: Vec::new(),
                matched: false,
                waiting: false,
                callback,
            }),
            reporter,
        })
    }

    pub(crate) fn add_sender(&self, sender: Arc<C>) {
        self.state.lock().pending.push(Pending {
            sender,
            receiver: None,
        });
    }

    /// Marks the sender list complete and matches if every remote channel is
    /// already here.
    pub(crate) fn seal(self: &Arc<Self>) {
        if self.try_match() {
            self.check();
        }
    }

    /// Abandons the pairing, handing `err` to the callback. Later arrivals are
    /// ignored.
    pub(crate) fn fail(&self, err: PairError) {
        let callback = {
            let mut state = self.state.lock();
            state.matched = true;
            state.callback.take()
        };
        self.reporter.error(err.clone());
        if let Some(callback) = callback {
            callback(Err(err));
        }
    }

    /// Records a channel announced on the receiving endpoint. Once as many
    /// have arrived as were requested, they are matched and the readiness
    /// check starts. Returns whether the pairing no longer needs arrivals.
    pub(crate) fn arrive(self: &Arc<Self>, channel: Arc<C>) -> bool {
        let complete = {
            let mut state = self.state.lock();
            if state.matched || state.arrived.len() >= self.expected {
                tracing::trace!(
                    target: "peer_pair::channels",
                    label = channel.label(),
                    "ignoring channel after pairing"
                );
                return true;
            }
            tracing::debug!(
                target: "peer_pair::channels",
                label = channel.label(),
                arrived = state.arrived.len() + 1,
                expected = self.expected,
                "captured remote data channel"
            );
            state.arrived.push(channel);
            state.arrived.len() >= self.expected
        };
        if self.try_match() {
            self.check();
        }
        complete
    }

    fn try_match(&self) -> bool {
        let mut state = self.state.lock();
        if state.matched
            || state.pending.len() < self.expected
            || state.arrived.len() < self.expected
        {
            return false;
        }
        state.matched = true;
        let arrived = std::mem::take(&mut state.arrived);
        for channel in arrived {
            let slot = state.pending.iter_mut().find(|pending| {
                pending.receiver.is_none() && pending.sender.label() == channel.label()
            });
            match slot {
                Some(pending) => pending.receiver = Some(channel),
                None => tracing::warn!(
                    target: "peer_pair::channels",
                    label = channel.label(),
                    "remote data channel has no local counterpart"
                ),
            }
        }
        true
    }

    /// Re-evaluates readiness. At most one open handler is outstanding at a
    /// time; when it fires the check runs again.
    pub(crate) fn check(self: &Arc<Self>) {
        match self.readiness() {
            Readiness::Done(callback, pairs) => {
                tracing::debug!(
                    target: "peer_pair::channels",
                    count = pairs.len(),
                    "all data channels open"
                );
                if let Some(callback) = callback {
                    callback(Ok(pairs));
                }
            }
            Readiness::Failed(callback, err) => {
                self.reporter.error(err.clone());
                if let Some(callback) = callback {
                    callback(Err(err));
                }
            }
            Readiness::WaitOn(channel) => {
                let pairing = Arc::clone(self);
                channel.on_open(Box::new(move || {
                    Box::pin(async move {
                        pairing.state.lock().waiting = false;
                        pairing.check();
                    })
                }));
            }
            Readiness::Idle => {}
        }
    }

    fn readiness(&self) -> Readiness<C> {
        let mut state = self.state.lock();
        if !state.matched || state.waiting {
            return Readiness::Idle;
        }
        if let Some(pending) = state.pending.iter().find(|p| p.receiver.is_none()) {
            let err = PairError::UnmatchedChannel {
                label: pending.sender.label().to_string(),
            };
            return Readiness::Failed(state.callback.take(), err);
        }
        let not_open = state
            .pending
            .iter()
            .flat_map(|p| [Some(&p.sender), p.receiver.as_ref()])
            .flatten()
            .find(|channel| channel.ready_state() != ChannelState::Open)
            .cloned();
        if let Some(channel) = not_open {
            state.waiting = true;
            return Readiness::WaitOn(channel);
        }
        let Some(callback) = state.callback.take() else {
            return Readiness::Idle;
        };
        let pairs = state
            .pending
            .iter()
            .filter_map(|p| {
                p.receiver.as_ref().map(|receiver| ChannelPair {
                    channels: [p.sender.clone(), receiver.clone()],
                })
            })
            .collect();
        Readiness::Done(Some(callback), pairs)
    }
}
