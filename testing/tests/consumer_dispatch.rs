//! Behavior tests for the typed dispatch loop, driven through the
//! in-memory event bus.
//!
//! Covers dispatch completeness, skip semantics for unregistered and
//! malformed messages, handler failure isolation, acknowledgement
//! policies, worker-pool backpressure, and loop termination.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use eventmesh_core::bus::EventBusError;
use eventmesh_core::consumer::{AckPolicy, ConsumerConfig, EventConsumer};
use eventmesh_core::event::Event;
use eventmesh_core::registry::Subscriptions;
use eventmesh_testing::InMemoryEventBus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct CustomerCreated {
    customer_id: String,
}

impl Event for CustomerCreated {
    const EVENT_TYPE: &'static str = "CustomerCreated";
    const TOPIC: &'static str = "customer-events";
}

/// Poll `condition` every 10ms until it holds or two seconds elapse.
async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait for the consumer's read loop to subscribe to the topic.
async fn wait_for_subscription(bus: &Arc<InMemoryEventBus>, topic: &'static str) {
    let bus = Arc::clone(bus);
    assert!(
        wait_until(move || bus.subscriber_count(topic) > 0).await,
        "consumer never subscribed to {topic}"
    );
}

#[tokio::test]
async fn every_registered_handler_fires_once_per_delivery() {
    let bus = Arc::new(InMemoryEventBus::new());
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let first_counter = Arc::clone(&first);
    let second_counter = Arc::clone(&second);
    let subscriptions = Subscriptions::new()
        .on::<CustomerCreated, _, _>(move |event| {
            let counter = Arc::clone(&first_counter);
            async move {
                assert_eq!(event.customer_id, "abc");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .on::<CustomerCreated, _, _>(move |_event| {
            let counter = Arc::clone(&second_counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

    let (consumer, shutdown) = EventConsumer::new(
        Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>,
        Arc::new(subscriptions),
        ConsumerConfig::default(),
    );
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;
    let mut acks = bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"abc"}"#);

    acks.remove(0)
        .await
        .expect("message should be acknowledged after dispatch");

    let first_probe = Arc::clone(&first);
    let second_probe = Arc::clone(&second);
    assert!(
        wait_until(move || {
            first_probe.load(Ordering::SeqCst) == 1 && second_probe.load(Ordering::SeqCst) == 1
        })
        .await
    );

    shutdown.send(true).expect("signal shutdown");
    handle
        .await
        .expect("consumer task completes")
        .expect("clean shutdown");

    // Exactly once per delivery: no extra invocations after shutdown.
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unregistered_event_type_is_acked_and_skipped() {
    let bus = Arc::new(InMemoryEventBus::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let subscriptions = Subscriptions::new().on::<CustomerCreated, _, _>(move |_event| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let (consumer, shutdown) = EventConsumer::new(
        Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>,
        Arc::new(subscriptions),
        ConsumerConfig::default(),
    );
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;

    // A legacy type nobody registered arrives on the same topic.
    let mut acks = bus.deliver("customer-events", "LegacyEvent", b"{}");
    acks.remove(0)
        .await
        .expect("unknown type should still be acknowledged");

    // The loop is still alive and dispatching registered types.
    let mut acks = bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"x"}"#);
    acks.remove(0).await.expect("ack after dispatch");

    let probe = Arc::clone(&calls);
    assert!(wait_until(move || probe.load(Ordering::SeqCst) == 1).await);

    shutdown.send(true).expect("signal shutdown");
    handle
        .await
        .expect("consumer task completes")
        .expect("clean shutdown");
}

#[tokio::test]
async fn malformed_payload_is_acked_and_skipped() {
    let bus = Arc::new(InMemoryEventBus::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let subscriptions = Subscriptions::new().on::<CustomerCreated, _, _>(move |_event| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let (consumer, shutdown) = EventConsumer::new(
        Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>,
        Arc::new(subscriptions),
        ConsumerConfig::default(),
    );
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;

    let mut acks = bus.deliver("customer-events", "CustomerCreated", b"not json at all");
    acks.remove(0)
        .await
        .expect("malformed payload should still be acknowledged");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    shutdown.send(true).expect("signal shutdown");
    handle
        .await
        .expect("consumer task completes")
        .expect("clean shutdown");
}

#[tokio::test]
async fn handler_failure_is_isolated_and_message_still_acks() {
    let bus = Arc::new(InMemoryEventBus::new());
    let succeeded = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&succeeded);
    let subscriptions = Subscriptions::new()
        .on::<CustomerCreated, _, _>(|_event| async move {
            Err("search index unavailable".into())
        })
        .on::<CustomerCreated, _, _>(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

    let (consumer, shutdown) = EventConsumer::new(
        Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>,
        Arc::new(subscriptions),
        ConsumerConfig::default(),
    );
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;

    let mut acks = bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"x"}"#);
    acks.remove(0)
        .await
        .expect("message counts as dispatched despite the failing handler");

    let probe = Arc::clone(&succeeded);
    assert!(wait_until(move || probe.load(Ordering::SeqCst) == 1).await);

    // The loop keeps consuming after the failure.
    let mut acks = bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"y"}"#);
    acks.remove(0).await.expect("ack after dispatch");

    shutdown.send(true).expect("signal shutdown");
    handle
        .await
        .expect("consumer task completes")
        .expect("clean shutdown");
}

#[tokio::test]
async fn after_dispatch_ack_waits_for_worker_pool_slot() {
    let bus = Arc::new(InMemoryEventBus::new());
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    let blocker = Arc::clone(&release_rx);
    let subscriptions = Subscriptions::new().on::<CustomerCreated, _, _>(move |_event| {
        let blocker = Arc::clone(&blocker);
        async move {
            // The first invocation parks until the test releases it; later
            // invocations pass straight through.
            let waiter = blocker.lock().await.take();
            if let Some(waiter) = waiter {
                let _ = waiter.await;
            }
            Ok(())
        }
    });

    let config = ConsumerConfig {
        worker_pool_size: 1,
        ack_policy: AckPolicy::AfterDispatch,
    };
    let (consumer, shutdown) =
        EventConsumer::new(Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>, Arc::new(subscriptions), config);
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;

    // First message occupies the only pool slot.
    let mut first_acks = bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"a"}"#);
    first_acks
        .remove(0)
        .await
        .expect("first message acks once dispatched");

    // Second message cannot be dispatched while the slot is held, so its
    // ack must not arrive yet.
    let mut second_acks =
        bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"b"}"#);
    let pending_ack = second_acks.remove(0);
    let waited =
        tokio::time::timeout(Duration::from_millis(100), pending_ack).await;
    assert!(waited.is_err(), "ack should be blocked by the full pool");

    // Releasing the stuck handler frees the slot; cannot await the same
    // receiver twice, so observe progress via a third delivery instead.
    release_tx.send(()).expect("release the blocked handler");
    let mut third_acks =
        bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"c"}"#);
    third_acks
        .remove(0)
        .await
        .expect("pool drains after release");

    shutdown.send(true).expect("signal shutdown");
    handle
        .await
        .expect("consumer task completes")
        .expect("clean shutdown");
}

#[tokio::test]
async fn before_dispatch_acks_before_handler_completion() {
    let bus = Arc::new(InMemoryEventBus::new());

    let subscriptions = Subscriptions::new().on::<CustomerCreated, _, _>(|_event| async move {
        // Park forever; BeforeDispatch must not wait on handler progress.
        futures::future::pending::<()>().await;
        Ok(())
    });

    let config = ConsumerConfig {
        worker_pool_size: 1,
        ack_policy: AckPolicy::BeforeDispatch,
    };
    let (consumer, shutdown) =
        EventConsumer::new(Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>, Arc::new(subscriptions), config);
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;

    let mut acks = bus.deliver("customer-events", "CustomerCreated", br#"{"customer_id":"a"}"#);
    acks.remove(0)
        .await
        .expect("BeforeDispatch acks on receipt");

    shutdown.send(true).expect("signal shutdown");
    // The parked handler holds the drain, so abort rather than join.
    handle.abort();
}

#[tokio::test]
async fn transport_error_ends_the_consumer() {
    let bus = Arc::new(InMemoryEventBus::new());

    let subscriptions =
        Subscriptions::new().on::<CustomerCreated, _, _>(|_event| async move { Ok(()) });

    let (consumer, _shutdown) = EventConsumer::new(
        Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>,
        Arc::new(subscriptions),
        ConsumerConfig::default(),
    );
    let handle = tokio::spawn(consumer.run());

    wait_for_subscription(&bus, "customer-events").await;
    bus.emit_error(
        "customer-events",
        EventBusError::TransportError("connection reset".to_string()),
    );

    let result = handle.await.expect("consumer task completes");
    assert!(matches!(result, Err(EventBusError::TransportError(_))));
}

#[tokio::test]
async fn consumer_without_registrations_returns_immediately() {
    let bus = Arc::new(InMemoryEventBus::new());
    let (consumer, _shutdown) = EventConsumer::new(
        Arc::clone(&bus) as Arc<dyn eventmesh_core::bus::EventBus>,
        Arc::new(Subscriptions::new()),
        ConsumerConfig::default(),
    );

    consumer.run().await.expect("nothing to consume is not an error");
}
