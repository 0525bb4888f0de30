//! End-to-end credential exchange over an in-memory network and an
//! in-process adjudicator.
//!
//! Time is virtual (`start_paused`): response and challenge deadlines fire
//! as soon as every task is quiescent, so the dispute scenarios run in
//! milliseconds while still exercising the real timers.

use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};

use credchan::app::TransitionError;
use credchan::error::ValidationError;
use credchan::{
    Adjudicator, Client, ClientConfig, Error, LocalAdjudicator, Network, Phase, Signer, U256,
};

const DOC: &[u8] = b"verifiable credential: Jane Doe, MSc Chemistry, 2025";

fn eth(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credchan=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Two connected clients sharing one adjudicator. The first is the channel
/// proposer (the holder in every scenario), the second the issuer.
async fn setup(seed: u64) -> (Client, Client, Arc<LocalAdjudicator>) {
    init_tracing();
    let net = Network::new();
    let adjudicator = Arc::new(LocalAdjudicator::new());
    let mut rng = StdRng::seed_from_u64(seed);
    let config = ClientConfig {
        challenge_duration: Duration::from_secs(60),
        response_timeout: Duration::from_secs(10),
    };

    let mut clients = Vec::new();
    for _ in 0..2 {
        let signer = Signer::new(&mut rng);
        let (bus, inbox) = net.endpoint(signer.address()).await;
        clients.push(Client::new(
            config,
            signer,
            Arc::new(bus),
            inbox,
            Arc::clone(&adjudicator) as Arc<dyn Adjudicator>,
        ));
    }
    let issuer = clients.pop().unwrap();
    let holder = clients.pop().unwrap();
    (holder, issuer, adjudicator)
}

#[tokio::test(start_paused = true)]
async fn honest_swap_settles_cooperatively() {
    let (holder, issuer, adjudicator) = setup(1).await;
    let issuer_addr = issuer.address();
    let price = eth(5);

    let holder_task = tokio::spawn(async move {
        let channel = holder
            .open_channel(issuer_addr, [eth(10), U256::zero()])
            .await
            .unwrap();
        let channel_id = channel.id();

        let pending = channel.request_credential(DOC, price).await.unwrap();
        let offer = pending.wait().await.unwrap();
        assert!(offer.credential().verify(issuer_addr));

        let credential = offer.accept().await.unwrap();
        channel.close().await.unwrap();
        // A second close is a no-op.
        channel.close().await.unwrap();
        assert_eq!(channel.phase(), Phase::Closed);
        (channel_id, credential)
    });

    let issuer_task = tokio::spawn(async move {
        let channel = issuer.next_channel_request().await.unwrap().accept().await.unwrap();

        let request = channel.next_credential_request().await.unwrap();
        request.check_doc(DOC).unwrap();
        request.check_price(price).unwrap();
        // Mismatching expectations are caught before signing anything.
        assert!(request.check_doc(b"some other document").is_err());
        assert!(request.check_price(eth(4)).is_err());
        request.issue().await.unwrap();

        channel.wait_concludable().await.unwrap();
        channel.close().await.unwrap();
    });

    let (channel_id, credential) = holder_task.await.unwrap();
    issuer_task.await.unwrap();

    assert!(credential.verify(issuer_addr));
    let finals = adjudicator
        .query_final(channel_id)
        .await
        .unwrap()
        .expect("channel settled");
    assert_eq!(finals.balances, [eth(5), eth(5)]);
    // Cooperative path: request, issue, accept, finalize.
    assert_eq!(finals.version(), 4);
    assert!(finals.is_final);
    assert_eq!(adjudicator.total_holdings().await, U256::zero());
}

#[tokio::test(start_paused = true)]
async fn rejecting_a_delivered_credential_is_overruled_on_chain() {
    let (holder, issuer, adjudicator) = setup(2).await;
    let issuer_addr = issuer.address();
    let price = eth(5);

    let holder_task = tokio::spawn(async move {
        let channel = holder
            .open_channel(issuer_addr, [eth(10), U256::zero()])
            .await
            .unwrap();
        let channel_id = channel.id();

        let pending = channel.request_credential(DOC, price).await.unwrap();
        let offer = pending.wait().await.unwrap();
        let credential = offer.credential().clone();

        // Trying to back out after the signature arrived: the issuer
        // declines and takes the payment through a dispute instead.
        let err = offer.reject("changed my mind").await.unwrap_err();
        assert!(matches!(err, Error::Declined { .. }));

        channel.wait_concludable().await.unwrap();
        channel.close().await.unwrap();
        (channel_id, credential)
    });

    let issuer_task = tokio::spawn(async move {
        let channel = issuer.next_channel_request().await.unwrap().accept().await.unwrap();
        let request = channel.next_credential_request().await.unwrap();
        request.check_doc(DOC).unwrap();
        request.check_price(price).unwrap();
        request.issue().await.unwrap();

        // The challenge window runs out without a refutation.
        channel.wait_concludable().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(channel.phase(), Phase::Closed);
    });

    let (channel_id, credential) = holder_task.await.unwrap();
    issuer_task.await.unwrap();

    // The defecting holder keeps a valid credential but paid for it anyway.
    assert!(credential.verify(issuer_addr));
    let finals = adjudicator
        .query_final(channel_id)
        .await
        .unwrap()
        .expect("dispute concluded");
    assert_eq!(finals.balances, [eth(5), eth(5)]);
    // Adjudicated path: the issuer-signed issuance state wins as-is.
    assert_eq!(finals.version(), 2);
    assert_eq!(adjudicator.total_holdings().await, U256::zero());
}

#[tokio::test(start_paused = true)]
async fn going_silent_after_delivery_forces_a_dispute() {
    let (holder, issuer, adjudicator) = setup(3).await;
    let issuer_addr = issuer.address();
    let price = eth(5);

    let holder_task = tokio::spawn(async move {
        let channel = holder
            .open_channel(issuer_addr, [eth(10), U256::zero()])
            .await
            .unwrap();
        let channel_id = channel.id();

        let pending = channel.request_credential(DOC, price).await.unwrap();
        let offer = pending.wait().await.unwrap();
        let credential = offer.credential().clone();
        // Neither accept nor reject: just stop responding.
        drop(offer);

        channel.wait_concludable().await.unwrap();
        channel.close().await.unwrap();
        (channel_id, credential)
    });

    let issuer_task = tokio::spawn(async move {
        let channel = issuer.next_channel_request().await.unwrap().accept().await.unwrap();
        let request = channel.next_credential_request().await.unwrap();
        request.issue().await.unwrap();

        // Response timeout escalates, then the challenge window expires.
        channel.wait_concludable().await.unwrap();
        channel.close().await.unwrap();
    });

    let (channel_id, credential) = holder_task.await.unwrap();
    issuer_task.await.unwrap();

    assert!(credential.verify(issuer_addr));
    let finals = adjudicator
        .query_final(channel_id)
        .await
        .unwrap()
        .expect("dispute concluded");
    assert_eq!(finals.balances, [eth(5), eth(5)]);
    assert_eq!(adjudicator.total_holdings().await, U256::zero());
}

#[tokio::test(start_paused = true)]
async fn issuing_an_unaffordable_request_is_refused_locally() {
    let (holder, issuer, _adjudicator) = setup(5).await;
    let issuer_addr = issuer.address();

    let issuer_task = tokio::spawn(async move {
        let channel = issuer.next_channel_request().await.unwrap().accept().await.unwrap();

        // The request asks for more than the holder deposited; signing it
        // would propose a payment no balance covers.
        let request = channel.next_credential_request().await.unwrap();
        let err = request.issue().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::Transition(TransitionError::InsufficientFunds))
        ));
        // The refusal is local; the channel actor keeps running.
        assert_eq!(channel.phase(), Phase::Open);
    });

    let channel = holder
        .open_channel(issuer_addr, [eth(1), U256::zero()])
        .await
        .unwrap();
    let pending = channel.request_credential(DOC, eth(5)).await.unwrap();
    issuer_task.await.unwrap();
    assert_eq!(channel.phase(), Phase::Open);
    drop(pending);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_an_offer_honors_the_caller_deadline() {
    let (holder, issuer, _adjudicator) = setup(6).await;
    let issuer_addr = issuer.address();

    let issuer_task = tokio::spawn(async move {
        let channel = issuer.next_channel_request().await.unwrap().accept().await.unwrap();
        // Take the request but never answer it.
        let request = channel.next_credential_request().await.unwrap();
        (channel, request)
    });

    let channel = holder
        .open_channel(issuer_addr, [eth(10), U256::zero()])
        .await
        .unwrap();
    let pending = channel.request_credential(DOC, eth(5)).await.unwrap();

    let err = pending
        .wait_timeout(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));
    // Only the waiting was abandoned; the channel is untouched.
    assert_eq!(channel.phase(), Phase::Open);
    drop(issuer_task.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn channel_proposal_can_be_declined() {
    let (holder, issuer, _adjudicator) = setup(4).await;
    let issuer_addr = issuer.address();

    let issuer_task = tokio::spawn(async move {
        let request = issuer.next_channel_request().await.unwrap();
        request.reject("not accepting channels right now").await.unwrap();
    });

    let err = holder
        .open_channel(issuer_addr, [eth(10), U256::zero()])
        .await
        .unwrap_err();
    match err {
        Error::Declined { reason } => assert_eq!(reason, "not accepting channels right now"),
        other => panic!("expected a decline, got {other:?}"),
    }
    issuer_task.await.unwrap();
}
