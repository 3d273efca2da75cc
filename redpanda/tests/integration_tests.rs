//! Integration tests for [`RedpandaEventBus`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up a real Kafka instance and
//! validate:
//! - Raw publish/subscribe round-trip with the event type as message key
//! - Acknowledgement-gated offset commits (at-least-once)
//! - Envelope publishing through the trait's provided `publish`
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//! - Can be flaky due to Kafka's distributed nature and timing
//!
//! To run explicitly:
//! ```bash
//! cargo test -p eventmesh-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use eventmesh_core::bus::EventBus;
use eventmesh_core::event::EventEnvelope;
use eventmesh_redpanda::RedpandaEventBus;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Helper to wait for Kafka to accept writes.
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = RedpandaEventBus::builder()
            .brokers(brokers)
            .auto_offset_reset("earliest")
            .build()
        {
            if bus
                .publish_raw("warmup-topic", "Warmup", b"{}")
                .await
                .is_ok()
            {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        if attempt == max_attempts {
            panic!("Kafka did not become ready after {max_attempts} attempts");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn setup_kafka() -> (testcontainers::ContainerAsync<Kafka>, String) {
    let container = Kafka::default()
        .start()
        .await
        .expect("Failed to start kafka container");
    let port = container
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get kafka port");
    let brokers = format!("127.0.0.1:{port}");
    wait_for_kafka_ready(&brokers).await;
    (container, brokers)
}

#[tokio::test]
#[ignore = "requires Docker; slow Kafka startup"]
async fn publish_raw_roundtrip_preserves_key_and_payload() {
    let (_container, brokers) = setup_kafka().await;

    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .consumer_group("roundtrip-test")
        .build()
        .expect("build bus");

    let payload = br#"{"customer_id":"abc"}"#;
    bus.publish_raw("customer-events", "CustomerCreated", payload)
        .await
        .expect("publish");

    let mut stream = bus.subscribe(&["customer-events"]).await.expect("subscribe");

    let message = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended")
        .expect("transport error");

    assert_eq!(message.topic, "customer-events");
    assert_eq!(message.event_type, "CustomerCreated");
    assert_eq!(message.payload, payload);
    message.ack.ack();
}

#[tokio::test]
#[ignore = "requires Docker; slow Kafka startup"]
async fn unacked_message_is_redelivered_to_new_consumer() {
    let (_container, brokers) = setup_kafka().await;

    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .consumer_group("redelivery-test")
        .build()
        .expect("build bus");

    bus.publish_raw("order-events", "OrderPlaced", br#"{"order_id":"1"}"#)
        .await
        .expect("publish");

    // First consumer receives the message but never acks it; its offset is
    // never committed.
    {
        let mut stream = bus.subscribe(&["order-events"]).await.expect("subscribe");
        let message = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("transport error");
        assert_eq!(message.event_type, "OrderPlaced");
        drop(message); // ack token dropped without firing
    }

    // A fresh subscription in the same group starts from the uncommitted
    // offset and sees the message again.
    let mut stream = bus.subscribe(&["order-events"]).await.expect("resubscribe");
    let message = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("timed out waiting for redelivery")
        .expect("stream ended")
        .expect("transport error");

    assert_eq!(message.event_type, "OrderPlaced");
    message.ack.ack();
}

#[tokio::test]
#[ignore = "requires Docker; slow Kafka startup"]
async fn publish_envelope_serializes_payload() {
    let (_container, brokers) = setup_kafka().await;

    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .consumer_group("envelope-test")
        .build()
        .expect("build bus");

    let envelope = EventEnvelope::new(
        "CustomerCreated".to_string(),
        "customer-events".to_string(),
        serde_json::json!({ "customer_id": "abc" }),
    );
    bus.publish(&envelope).await.expect("publish envelope");

    let mut stream = bus.subscribe(&["customer-events"]).await.expect("subscribe");
    let message = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended")
        .expect("transport error");

    let value: serde_json::Value =
        serde_json::from_slice(&message.payload).expect("payload is JSON");
    assert_eq!(value["customer_id"], "abc");
    message.ack.ack();
}
