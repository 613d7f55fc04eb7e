use std::sync::Arc;
use std::time::Duration;

use bus_channel::{Delivery, DeliveryStatus, FailureKind};
use bus_router::broker::mock::MockBroker;
use bus_router::{ConnectivityState, Router, RouterConfig, RouterHandle};
use bytes::Bytes;
use tokio::time::{sleep, timeout};

async fn setup() -> (MockBroker, RouterHandle) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let broker = MockBroker::new();
    let cfg = RouterConfig::default()
        .with_target("mock")
        .with_retry_interval(Duration::from_millis(20));
    let (router, handle) = Router::connect(cfg, Arc::new(broker.clone()))
        .await
        .expect("connect ok");
    tokio::spawn(router.run());
    (broker, handle)
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_delivery(handle: &mut RouterHandle) -> Delivery {
    timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("delivery within 5s")
        .expect("result queue open")
}

#[tokio::test]
async fn initial_dial_failure_surfaces() {
    let broker = MockBroker::new();
    broker.refuse_dial(true);
    let cfg = RouterConfig::default().with_target("mock");
    assert!(Router::connect(cfg, Arc::new(broker)).await.is_err());
}

#[tokio::test]
async fn end_to_end_failover_and_recovery() {
    let (broker, mut handle) = setup().await;

    handle.create_sender("hw/events").await.expect("submit ok");
    handle
        .publish_event("hw/events", Bytes::from_static(b"p1"))
        .await
        .expect("submit ok");
    let delivery = next_delivery(&mut handle).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);

    // Drop the connection; keep the broker undialable so the episode spins.
    broker.refuse_dial(true);
    broker.sever();

    handle
        .publish_event("hw/events", Bytes::from_static(b"p2"))
        .await
        .expect("submit ok");
    let delivery = next_delivery(&mut handle).await;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.reason, Some(FailureKind::ConnectionReset));
    wait_for(|| handle.reconnect_episodes() == 1, "episode start").await;
    assert_eq!(handle.state(), ConnectivityState::Connecting);

    // While disconnected, deliveries fail fast with no publish attempt.
    let attempts = broker.publish_attempts();
    handle
        .publish_event("hw/events", Bytes::from_static(b"p3"))
        .await
        .expect("submit ok");
    let delivery = next_delivery(&mut handle).await;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.reason, Some(FailureKind::ConnectionReset));
    assert_eq!(broker.publish_attempts(), attempts);

    // Let the episode finish: sender replayed, state restored.
    broker.refuse_dial(false);
    wait_for(|| handle.state() == ConnectivityState::Connected, "recovery").await;
    wait_for(|| broker.sender_attach_count("hw/events") == 2, "sender replay").await;

    handle
        .publish_event("hw/events", Bytes::from_static(b"p4"))
        .await
        .expect("submit ok");
    let delivery = next_delivery(&mut handle).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(handle.reconnect_episodes(), 1);
}

#[tokio::test]
async fn concurrent_failures_start_one_episode() {
    let (broker, mut handle) = setup().await;

    let addresses = ["hw/a", "hw/b", "hw/c", "hw/d", "hw/e"];
    for address in addresses {
        handle.create_sender(address).await.expect("submit ok");
    }
    wait_for(
        || addresses.iter().all(|a| broker.sender_attach_count(a) == 1),
        "senders",
    )
    .await;

    broker.refuse_dial(true);
    broker.sever();
    for address in addresses {
        handle
            .publish_event(address, Bytes::from_static(b"p"))
            .await
            .expect("submit ok");
    }
    for _ in addresses {
        let delivery = next_delivery(&mut handle).await;
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.reason, Some(FailureKind::ConnectionReset));
    }
    assert_eq!(handle.reconnect_episodes(), 1);

    broker.refuse_dial(false);
    wait_for(|| handle.state() == ConnectivityState::Connected, "recovery").await;
    wait_for(
        || addresses.iter().all(|a| broker.sender_attach_count(a) == 2),
        "sender replay",
    )
    .await;
    assert_eq!(handle.reconnect_episodes(), 1);
}

#[tokio::test]
async fn replay_recreates_receivers_without_duplicates() {
    let (broker, mut handle) = setup().await;

    handle.create_listener("hw/a").await.expect("submit ok");
    handle.create_listener("hw/b").await.expect("submit ok");
    wait_for(
        || broker.live_receiver_count("hw/a") == 1 && broker.live_receiver_count("hw/b") == 1,
        "receivers",
    )
    .await;

    broker.sever();
    wait_for(
        || {
            broker.receiver_attach_count("hw/a") >= 2
                && broker.receiver_attach_count("hw/b") >= 2
                && broker.live_receiver_count("hw/a") == 1
                && broker.live_receiver_count("hw/b") == 1
        },
        "receiver replay",
    )
    .await;
    wait_for(|| handle.state() == ConnectivityState::Connected, "recovery").await;

    // Exactly one live receiver per address, and it still receives.
    assert_eq!(broker.live_receiver_count("hw/a"), 1);
    assert_eq!(broker.live_receiver_count("hw/b"), 1);
    broker.inject("hw/a", Bytes::from_static(b"m1"));
    let delivery = next_delivery(&mut handle).await;
    assert_eq!(delivery.address, "hw/a");
    assert_eq!(delivery.payload.as_deref(), Some(b"m1".as_slice()));
}

#[tokio::test]
async fn deleted_receiver_is_not_replayed() {
    let (broker, handle) = setup().await;

    handle.create_listener("hw/a").await.expect("submit ok");
    wait_for(|| broker.live_receiver_count("hw/a") == 1, "receiver").await;

    // Deleting and severing in quick succession: the replay entry from the
    // dying loop must not resurrect the deleted address.
    handle.delete_listener("hw/a").await.expect("submit ok");
    wait_for(|| broker.live_receiver_count("hw/a") == 0, "delete").await;
    broker.sever();
    wait_for(|| handle.state() == ConnectivityState::Connected, "recovery").await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.live_receiver_count("hw/a"), 0);
    assert_eq!(broker.receiver_attach_count("hw/a"), 1);
}
