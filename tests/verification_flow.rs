//! End-to-end two-party ceremonies over an in-memory transport.
//!
//! Two services are wired back to back: everything one sends becomes an
//! inbound event for the other, delivered by the test pump. This exercises
//! the full stack from façade operation to peer state change.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use veriflow::{
    CancelCode,
    FakeCryptoEngine,
    OutgoingVerificationEvent,
    RequestState,
    TransportChannel,
    TransportError,
    VerificationConfig,
    VerificationEvent,
    VerificationMethod,
    VerificationService,
    VerificationTransport,
};

const ALICE: &str = "@alice:example.org";
const ALICE_DEVICE: &str = "ALICEDEV";
const BOB: &str = "@bob:example.org";
const BOB_DEVICE: &str = "BOBDEV";

/// Turns outgoing events into the peer's inbound events on a channel
struct ChannelTransport {
    from_user: String,
    from_device: String,
    outbox: mpsc::UnboundedSender<VerificationEvent>,
}

#[async_trait]
impl VerificationTransport for ChannelTransport {
    async fn send_verification_event(
        &self,
        event: OutgoingVerificationEvent,
    ) -> Result<(), TransportError> {
        let inbound = VerificationEvent::new(
            self.from_user.clone(),
            Some(self.from_device.clone()),
            event.flow_id,
            event.channel,
            event.payload,
        );
        self.outbox.send(inbound).map_err(|_| TransportError::permanent("peer hung up"))
    }
}

struct Pair {
    alice: Arc<VerificationService>,
    alice_engine: Arc<FakeCryptoEngine>,
    alice_outbox: mpsc::UnboundedReceiver<VerificationEvent>,
    bob: Arc<VerificationService>,
    bob_engine: Arc<FakeCryptoEngine>,
    bob_outbox: mpsc::UnboundedReceiver<VerificationEvent>,
}

impl Pair {
    fn new() -> Self {
        let (alice_tx, alice_outbox) = mpsc::unbounded_channel();
        let (bob_tx, bob_outbox) = mpsc::unbounded_channel();

        let alice_engine = Arc::new(FakeCryptoEngine::new(ALICE, ALICE_DEVICE));
        let bob_engine = Arc::new(FakeCryptoEngine::new(BOB, BOB_DEVICE));

        let alice = VerificationService::new(
            ALICE,
            ALICE_DEVICE,
            alice_engine.clone(),
            Arc::new(ChannelTransport {
                from_user: ALICE.to_string(),
                from_device: ALICE_DEVICE.to_string(),
                outbox: alice_tx,
            }),
            VerificationConfig::default(),
        );
        let bob = VerificationService::new(
            BOB,
            BOB_DEVICE,
            bob_engine.clone(),
            Arc::new(ChannelTransport {
                from_user: BOB.to_string(),
                from_device: BOB_DEVICE.to_string(),
                outbox: bob_tx,
            }),
            VerificationConfig::default(),
        );

        Self { alice, alice_engine, alice_outbox, bob, bob_engine, bob_outbox }
    }

    /// Deliver queued events back and forth until both directions go quiet
    async fn settle(&mut self) {
        loop {
            // Let the spawned send tasks drain into the outboxes first
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            let mut progressed = false;
            while let Ok(event) = self.alice_outbox.try_recv() {
                self.bob.handle_event(event).await;
                progressed = true;
            }
            while let Ok(event) = self.bob_outbox.try_recv() {
                self.alice.handle_event(event).await;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }
}

fn room() -> TransportChannel {
    TransportChannel::InRoom { room_id: "!room:example.org".to_string() }
}

/// Drive a pair to the point where both sides are ready
async fn ready_pair(pair: &mut Pair, methods: Vec<VerificationMethod>) -> String {
    let flow_id = pair.alice.request(methods.clone(), BOB, room()).await.unwrap();
    pair.settle().await;

    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(bob_view.state, RequestState::Requested);
    assert!(!bob_view.initiated_by_us);

    pair.bob.ready(&flow_id, methods).await.unwrap();
    pair.settle().await;
    flow_id
}

#[tokio::test]
async fn full_sas_ceremony_verifies_both_devices() {
    let mut pair = Pair::new();
    let flow_id = ready_pair(&mut pair, vec![VerificationMethod::Sas]).await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    assert_eq!(alice_view.state, RequestState::Ready);
    assert_eq!(alice_view.other_device_id.as_deref(), Some(BOB_DEVICE));

    pair.alice.start(&flow_id, VerificationMethod::Sas).await.unwrap();
    pair.settle().await;

    // Both sides derived the same code and show it to their users
    let alice_txn = pair.alice.get_transaction(BOB, &flow_id).await.unwrap();
    let bob_txn = pair.bob.get_transaction(ALICE, &flow_id).await.unwrap();
    let alice_sas = alice_txn.short_auth_string().unwrap();
    let bob_sas = bob_txn.short_auth_string().unwrap();
    assert_eq!(alice_sas, bob_sas);

    pair.alice.match_sas_code(&flow_id, true).await.unwrap();
    pair.settle().await;
    pair.bob.confirm(&flow_id).await.unwrap();
    pair.settle().await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(alice_view.state, RequestState::Done);
    assert_eq!(bob_view.state, RequestState::Done);

    assert_eq!(
        pair.alice_engine.verified_devices(),
        vec![(BOB.to_string(), BOB_DEVICE.to_string())]
    );
    assert_eq!(
        pair.bob_engine.verified_devices(),
        vec![(ALICE.to_string(), ALICE_DEVICE.to_string())]
    );
}

#[tokio::test]
async fn simultaneous_sas_starts_converge_on_one_ceremony() {
    let mut pair = Pair::new();
    let flow_id = ready_pair(&mut pair, vec![VerificationMethod::Sas]).await;

    // Both sides start before seeing each other's start
    pair.alice.start(&flow_id, VerificationMethod::Sas).await.unwrap();
    pair.bob.start(&flow_id, VerificationMethod::Sas).await.unwrap();
    pair.settle().await;

    // Alice's start wins the tiebreak, Bob answers it as responder; both
    // sides end up comparing the same code instead of waiting forever
    let alice_txn = pair.alice.get_transaction(BOB, &flow_id).await.unwrap();
    let bob_txn = pair.bob.get_transaction(ALICE, &flow_id).await.unwrap();
    assert_eq!(
        alice_txn.short_auth_string().unwrap(),
        bob_txn.short_auth_string().unwrap()
    );

    pair.alice.match_sas_code(&flow_id, true).await.unwrap();
    pair.settle().await;
    pair.bob.match_sas_code(&flow_id, true).await.unwrap();
    pair.settle().await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(alice_view.state, RequestState::Done);
    assert_eq!(bob_view.state, RequestState::Done);
}

#[tokio::test]
async fn full_qr_ceremony_verifies_both_devices() {
    let mut pair = Pair::new();
    let methods = vec![VerificationMethod::QrCodeShow, VerificationMethod::QrCodeScan];
    let flow_id = ready_pair(&mut pair, methods).await;

    // Alice shows the code, Bob's start lands him in the scanning role
    pair.alice.start(&flow_id, VerificationMethod::QrCodeShow).await.unwrap();
    pair.settle().await;

    let alice_txn = pair.alice.get_transaction(BOB, &flow_id).await.unwrap();
    let code = alice_txn.qr_code_bytes().unwrap().to_vec();
    let bob_txn = pair.bob.get_transaction(ALICE, &flow_id).await.unwrap();
    assert!(bob_txn.qr_code_bytes().is_none());

    pair.bob.submit_scanned_qr(&flow_id, &code).await.unwrap();
    pair.settle().await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(alice_view.state, RequestState::Done);
    assert_eq!(bob_view.state, RequestState::Done);

    assert_eq!(
        pair.alice_engine.verified_devices(),
        vec![(BOB.to_string(), BOB_DEVICE.to_string())]
    );
    assert_eq!(
        pair.bob_engine.verified_devices(),
        vec![(ALICE.to_string(), ALICE_DEVICE.to_string())]
    );
}

#[tokio::test]
async fn scan_without_prior_start_begins_the_transaction() {
    let mut pair = Pair::new();
    let methods = vec![VerificationMethod::QrCodeShow, VerificationMethod::QrCodeScan];
    let flow_id = ready_pair(&mut pair, methods).await;

    // Bob starts by showing; Alice scans without an explicit start call
    pair.bob.start(&flow_id, VerificationMethod::QrCodeShow).await.unwrap();
    pair.settle().await;

    let code = pair
        .bob
        .get_transaction(ALICE, &flow_id)
        .await
        .unwrap()
        .qr_code_bytes()
        .unwrap()
        .to_vec();
    pair.alice.submit_scanned_qr(&flow_id, &code).await.unwrap();
    pair.settle().await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(alice_view.state, RequestState::Done);
    assert_eq!(bob_view.state, RequestState::Done);
}

#[tokio::test]
async fn disjoint_methods_cancel_both_sides_with_no_common_method() {
    let mut pair = Pair::new();
    let flow_id = pair
        .alice
        .request(vec![VerificationMethod::Sas], BOB, room())
        .await
        .unwrap();
    pair.settle().await;

    pair.bob
        .ready(&flow_id, vec![VerificationMethod::QrCodeShow])
        .await
        .unwrap();
    pair.settle().await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(bob_view.state, RequestState::Cancelled);
    assert_eq!(bob_view.cancel_code, Some(CancelCode::NoCommonMethod));
    assert_eq!(alice_view.state, RequestState::Cancelled);
    assert_eq!(alice_view.cancel_code, Some(CancelCode::NoCommonMethod));
}

#[tokio::test]
async fn user_cancellation_reaches_the_peer() {
    let mut pair = Pair::new();
    let flow_id = ready_pair(&mut pair, vec![VerificationMethod::Sas]).await;

    pair.alice.cancel(&flow_id, CancelCode::User).await.unwrap();
    pair.settle().await;

    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(bob_view.state, RequestState::Cancelled);
    assert_eq!(bob_view.cancel_code, Some(CancelCode::User));
}

#[tokio::test]
async fn sas_mismatch_cancels_both_sides_and_verifies_nothing() {
    let mut pair = Pair::new();
    let flow_id = ready_pair(&mut pair, vec![VerificationMethod::Sas]).await;

    pair.alice.start(&flow_id, VerificationMethod::Sas).await.unwrap();
    pair.settle().await;

    pair.bob.match_sas_code(&flow_id, false).await.unwrap();
    pair.settle().await;

    let alice_view = pair.alice.get_request(BOB, &flow_id).await.unwrap();
    let bob_view = pair.bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(bob_view.state, RequestState::Cancelled);
    assert_eq!(bob_view.cancel_code, Some(CancelCode::MismatchedSas));
    assert_eq!(alice_view.state, RequestState::Cancelled);
    assert_eq!(alice_view.cancel_code, Some(CancelCode::MismatchedSas));

    assert!(pair.alice_engine.verified_devices().is_empty());
    assert!(pair.bob_engine.verified_devices().is_empty());
}

#[tokio::test]
async fn request_times_out_on_both_sides() {
    let (alice_tx, mut alice_outbox) = mpsc::unbounded_channel();
    let (bob_tx, _bob_outbox) = mpsc::unbounded_channel();

    let short = VerificationConfig {
        requested_timeout: Duration::from_millis(30),
        ..VerificationConfig::default()
    };
    let alice = VerificationService::new(
        ALICE,
        ALICE_DEVICE,
        Arc::new(FakeCryptoEngine::new(ALICE, ALICE_DEVICE)),
        Arc::new(ChannelTransport {
            from_user: ALICE.to_string(),
            from_device: ALICE_DEVICE.to_string(),
            outbox: alice_tx,
        }),
        short.clone(),
    );
    let bob = VerificationService::new(
        BOB,
        BOB_DEVICE,
        Arc::new(FakeCryptoEngine::new(BOB, BOB_DEVICE)),
        Arc::new(ChannelTransport {
            from_user: BOB.to_string(),
            from_device: BOB_DEVICE.to_string(),
            outbox: bob_tx,
        }),
        short,
    );

    let flow_id = alice.request(vec![VerificationMethod::Sas], BOB, room()).await.unwrap();
    tokio::task::yield_now().await;
    if let Ok(event) = alice_outbox.try_recv() {
        bob.handle_event(event).await;
    }

    // Bob never answers; both sides age out on their own
    tokio::time::sleep(Duration::from_millis(90)).await;

    let alice_view = alice.get_request(BOB, &flow_id).await.unwrap();
    assert_eq!(alice_view.state, RequestState::Expired);
    let bob_view = bob.get_request(ALICE, &flow_id).await.unwrap();
    assert_eq!(bob_view.state, RequestState::Expired);
}
