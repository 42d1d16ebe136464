use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use peer_pair::testing::{FakeChannel, FakeEndpoint, FakeFactory, FakeOp, FakeOptions};
use peer_pair::{
    CandidateFlushPolicy, ChannelConstraints, ChannelPair, ConnectedPolicy, DataChannel, Direction, Endpoint,
    IceConnectionState, NegotiationPhase, PairConfig, PairError, PeerPair, SessionEvent,
    SessionObserver,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn fake_pair(options: FakeOptions, config: PairConfig) -> PeerPair<FakeEndpoint> {
    PeerPair::with_factory(&FakeFactory { options }, config)
        .await
        .expect("create fake pair")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        sleep(Duration::from_millis(10)).await;
    }
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[derive(Default)]
struct Transitions {
    seen: Mutex<Vec<(Direction, NegotiationPhase)>>,
}

impl Transitions {
    fn completed(&self, direction: Direction) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|(d, phase)| *d == direction && *phase == NegotiationPhase::Complete)
            .count()
    }
}

impl SessionObserver for Transitions {
    fn on_transition(&self, direction: Direction, phase: NegotiationPhase) {
        self.seen.lock().push((direction, phase));
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn connect_announces_connected_once() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;
    let mut events = pair.events();

    let outcome = pair.connect().await.expect("handshake task");
    assert!(outcome.is_complete(), "handshake failed: {outcome:?}");
    assert_eq!(outcome.direction, Direction::FORWARD);

    pair.wait_connected(WAIT).await.expect("connected");
    assert!(pair.is_connected());
    for endpoint in &pair {
        assert_eq!(endpoint.ice_connection_state(), IceConnectionState::Connected);
    }

    sleep(Duration::from_millis(50)).await;
    let connected = drain(&mut events)
        .into_iter()
        .filter(|event| *event == SessionEvent::Connected)
        .count();
    assert_eq!(connected, 1);

    assert_eq!(
        pair[0].calls(),
        vec![
            "create_offer",
            "set_local_description(offer)",
            "set_remote_description(answer)",
        ]
    );
    assert_eq!(
        pair[1].calls(),
        vec![
            "set_remote_description(offer)",
            "create_answer",
            "set_local_description(answer)",
        ]
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn candidates_arrive_in_order_exactly_once() {
    init_tracing();
    let options = FakeOptions {
        candidates: 3,
        ..FakeOptions::default()
    };
    let pair = fake_pair(options, PairConfig::default()).await;
    pair.connect();
    pair.wait_connected(WAIT).await.expect("connected");

    eventually(|| pair[0].received_candidates().len() == 3 && pair[1].received_candidates().len() == 3)
        .await;
    sleep(Duration::from_millis(50)).await;

    let received = pair[1].received_candidates();
    assert_eq!(received.len(), 3);
    for (n, candidate) in received.iter().enumerate() {
        assert!(
            candidate.candidate.starts_with(&format!("candidate:{n} ")),
            "unexpected order: {received:?}"
        );
        assert!(candidate.candidate.contains("10.0.0.2"));
    }
    assert!(pair[0]
        .received_candidates()
        .iter()
        .all(|candidate| candidate.candidate.contains("10.0.0.3")));
    assert_eq!(pair.pending_candidates(Direction::FORWARD), 0);
    assert_eq!(pair.pending_candidates(Direction::REVERSE), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn negotiation_needed_on_answerer_reverses_roles() {
    init_tracing();
    let transitions = Arc::new(Transitions::default());
    let pair = fake_pair(FakeOptions::default(), PairConfig::default())
        .await
        .with_observer(transitions.clone());
    let mut events = pair.events();

    pair.connect();
    pair.wait_connected(WAIT).await.expect("connected");
    eventually(|| pair[1].has_negotiation_handler()).await;

    pair[1]
        .create_data_channel("late", &ChannelConstraints::default())
        .await
        .expect("create channel");
    eventually(|| transitions.completed(Direction::REVERSE) == 1).await;

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::Renegotiating(Direction::REVERSE)));
    assert_eq!(
        seen.iter()
            .filter(|event| **event == SessionEvent::Connected)
            .count(),
        1
    );
    assert!(!seen.iter().any(|event| matches!(event, SessionEvent::Error(_))));

    let calls = pair[1].calls();
    assert_eq!(
        &calls[calls.len() - 3..],
        [
            "create_offer",
            "set_local_description(offer)",
            "set_remote_description(answer)",
        ]
    );
    assert_eq!(transitions.completed(Direction::FORWARD), 1);
    assert!(pair.is_connected());
}

#[test_timeout::tokio_timeout_test(10)]
async fn explicit_handshakes_run_back_to_back() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;
    let first = pair.connect();
    let second = pair.negotiate(Direction::REVERSE).await;
    let first = first.await.expect("handshake task");

    assert!(first.is_complete());
    assert!(second.is_complete());
    pair.wait_connected(WAIT).await.expect("connected");
}

#[test_timeout::tokio_timeout_test(10)]
async fn channels_pair_up_by_label() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;

    let channels = pair
        .channels_and_connect(&["a", "b"], WAIT)
        .await
        .expect("channel pairs");

    let labels: Vec<&str> = channels.iter().map(|pair| pair.label()).collect();
    assert_eq!(labels, ["a", "b"]);
    for channel_pair in &channels {
        assert!(channel_pair.is_open());
        assert_eq!(channel_pair.sender().label(), channel_pair.receiver().label());
    }
    assert!(pair[0].calls().contains(&"create_data_channel(a)".to_string()));
    pair.wait_connected(WAIT).await.expect("connected");
}

#[test_timeout::tokio_timeout_test(10)]
async fn duplicate_labels_get_distinct_receivers() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;

    let channels = pair
        .channels_and_connect(&["dup", "dup"], WAIT)
        .await
        .expect("channel pairs");

    assert_eq!(channels.len(), 2);
    assert!(!Arc::ptr_eq(channels[0].receiver(), channels[1].receiver()));
    assert!(!Arc::ptr_eq(channels[0].sender(), channels[1].sender()));
}

#[test_timeout::tokio_timeout_test(10)]
async fn channels_opened_after_pairing_are_left_alone() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;
    let mut events = pair.events();

    let channels = pair
        .channels_and_connect(&["a"], WAIT)
        .await
        .expect("channel pairs");
    let receiver = Arc::clone(channels[0].receiver());
    drop(channels);
    eventually(|| Arc::strong_count(&receiver) == 1).await;

    pair.wait_connected(WAIT).await.expect("connected");
    eventually(|| pair[0].has_negotiation_handler()).await;
    pair[0]
        .create_data_channel("late", &ChannelConstraints::default())
        .await
        .expect("create channel");
    eventually(|| {
        pair[0]
            .calls()
            .iter()
            .filter(|call| call.as_str() == "set_remote_description(answer)")
            .count()
            >= 2
    })
    .await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(Arc::strong_count(&receiver), 1);
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::Error(_))));
}

#[test_timeout::tokio_timeout_test(10)]
async fn channels_requested_after_connecting_renegotiate_once() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;
    let mut events = pair.events();

    pair.connect();
    pair.wait_connected(WAIT).await.expect("connected");
    eventually(|| pair[0].has_negotiation_handler()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let counter = Arc::clone(&calls);
    pair.create_channels_and_connect(
        &["a", "b"],
        Some(Box::new(
            move |result: Result<Vec<ChannelPair<FakeChannel>>, PairError>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(result);
            },
        )),
    )
    .await;

    let channels = timeout(WAIT, rx)
        .await
        .expect("pairing before timeout")
        .expect("callback ran")
        .expect("channel pairs");
    let labels: Vec<&str> = channels.iter().map(|pair| pair.label()).collect();
    assert_eq!(labels, ["a", "b"]);
    assert!(channels.iter().all(|channel_pair| channel_pair.is_open()));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let seen = drain(&mut events);
    assert_eq!(
        seen.iter()
            .filter(|event| **event == SessionEvent::Connected)
            .count(),
        1
    );
    assert!(seen.contains(&SessionEvent::Renegotiating(Direction::FORWARD)));
    assert!(pair.is_connected());
}

#[test_timeout::tokio_timeout_test(10)]
async fn empty_channel_list_still_connects() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;

    let channels = pair
        .channels_and_connect::<&str>(&[], WAIT)
        .await
        .expect("empty pairing");

    assert!(channels.is_empty());
    pair.wait_connected(WAIT).await.expect("connected");
}

#[test_timeout::tokio_timeout_test(10)]
async fn pairing_without_callback_still_connects() {
    init_tracing();
    let pair = fake_pair(FakeOptions::default(), PairConfig::default()).await;

    pair.create_channels_and_connect(&["quiet"], None).await;

    pair.wait_connected(WAIT).await.expect("connected");
}

#[test_timeout::tokio_timeout_test(10)]
async fn channel_creation_failure_reaches_callback() {
    init_tracing();
    let endpoints = FakeEndpoint::pair(FakeOptions::default());
    endpoints[0].fail_next(FakeOp::CreateDataChannel);
    let pair = PeerPair::from_endpoints(endpoints, PairConfig::default());
    let mut events = pair.events();

    let result = pair.channels_and_connect(&["a"], WAIT).await;

    match result {
        Err(PairError::CreateChannel { label, .. }) => assert_eq!(label, "a"),
        other => panic!("expected channel creation error, got {other:?}"),
    }
    assert!(matches!(events.try_recv(), Ok(SessionEvent::Error(_))));
}

#[test_timeout::tokio_timeout_test(10)]
async fn completed_state_needs_the_lenient_policy() {
    init_tracing();
    let options = FakeOptions {
        settle_state: IceConnectionState::Completed,
        ..FakeOptions::default()
    };

    let strict = fake_pair(options.clone(), PairConfig::default()).await;
    strict.connect();
    eventually(|| {
        strict
            .iter()
            .all(|endpoint| endpoint.ice_connection_state() == IceConnectionState::Completed)
    })
    .await;
    assert!(!strict.is_connected());
    assert!(matches!(
        strict.wait_connected(Duration::from_millis(200)).await,
        Err(PairError::Timeout)
    ));

    let config = PairConfig::builder()
        .connected_policy(ConnectedPolicy::ConnectedOrCompleted)
        .build()
        .expect("config");
    let lenient = fake_pair(options, config).await;
    lenient.connect();
    lenient.wait_connected(WAIT).await.expect("connected");
}

#[test_timeout::tokio_timeout_test(10)]
async fn eager_flush_connects_when_early_candidates_are_accepted() {
    init_tracing();
    let options = FakeOptions {
        reject_early_candidates: false,
        ..FakeOptions::default()
    };
    let config = PairConfig::builder()
        .candidate_flush(CandidateFlushPolicy::OnLocalGatheringComplete)
        .build()
        .expect("config");
    let pair = fake_pair(options, config).await;

    pair.connect();
    pair.wait_connected(WAIT).await.expect("connected");
    eventually(|| pair[1].received_candidates().len() == 2).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_candidate_is_reported_and_the_rest_delivered() {
    init_tracing();
    let endpoints = FakeEndpoint::pair(FakeOptions::default());
    endpoints[1].fail_next(FakeOp::AddCandidate);
    let pair = PeerPair::from_endpoints(endpoints, PairConfig::default());
    let mut events = pair.events();

    pair.connect();
    pair.wait_connected(WAIT).await.expect("connected");
    eventually(|| pair[1].received_candidates().len() == 1).await;

    let errors: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Error(message) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1, "errors: {errors:?}");
    assert!(errors[0].contains("addIceCandidate failed on endpoint 1"));
    assert!(pair[1].received_candidates()[0]
        .candidate
        .starts_with("candidate:1 "));
}

#[test_timeout::tokio_timeout_test(10)]
async fn failed_offer_is_reported_in_the_outcome() {
    init_tracing();
    let endpoints = FakeEndpoint::pair(FakeOptions::default());
    endpoints[0].fail_next(FakeOp::CreateOffer);
    let pair = PeerPair::from_endpoints(endpoints, PairConfig::default());

    let outcome = pair.connect().await.expect("handshake task");

    assert!(!outcome.is_complete());
    assert_eq!(outcome.phase, NegotiationPhase::Idle);
    assert!(outcome.error.is_some());
    assert!(pair[1].calls().is_empty());

    let retry = pair.negotiate(Direction::FORWARD).await;
    assert!(retry.is_complete());
    pair.wait_connected(WAIT).await.expect("connected");
}
