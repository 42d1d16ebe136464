//! Re-runs the handshake when an endpoint raises negotiation-needed.

use std::sync::{Arc, Weak};

use crate::endpoint::Endpoint;
use crate::negotiator::{Direction, Negotiator};
use crate::observer::SessionEvent;

/// Arms both endpoints so that the one needing renegotiation becomes the
/// offer source. The handlers stay installed for the rest of the session.
pub(crate) fn arm<E: Endpoint>(negotiator: &Arc<Negotiator<E>>) {
    for direction in [Direction::FORWARD, Direction::REVERSE] {
        let weak: Weak<Negotiator<E>> = Arc::downgrade(negotiator);
        negotiator
            .endpoint(direction.source)
            .on_negotiation_needed(Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(negotiator) = weak.upgrade() else {
                        return;
                    };
                    tracing::debug!(
                        target: "peer_pair::renegotiation",
                        %direction,
                        "negotiation needed"
                    );
                    negotiator
                        .reporter()
                        .emit(SessionEvent::Renegotiating(direction));
                    // the handshake drives this endpoint, so it must not run
                    // inside the endpoint's own handler
                    negotiator.spawn(direction);
                })
            }));
    }
    tracing::debug!(target: "peer_pair::renegotiation", "renegotiation handlers armed");
}
