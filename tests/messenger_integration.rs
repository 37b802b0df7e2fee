use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use redis_messenger::{
    listener_fn, ConnectionState, Listener, MemoryTransport, Message, MessengerConfig,
    MessengerError, RedisMessenger,
};

/// Opt-in log output for debugging: RUST_LOG=debug cargo test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config(instance_id: &str) -> MessengerConfig {
    let mut config = MessengerConfig::default();
    config.instance_id = instance_id.to_string();
    config.reconnect.initial_delay_ms = 10;
    config.reconnect.max_delay_ms = 50;
    config
}

async fn messenger_on(transport: &MemoryTransport, instance_id: &str) -> RedisMessenger {
    RedisMessenger::with_transport(test_config(instance_id), Arc::new(transport.clone()))
        .await
        .expect("messenger should connect")
}

/// Listener that forwards every delivery into a channel the test can await.
fn capture() -> (Arc<dyn Listener>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = listener_fn(move |message: &Message| {
        tx.send(message.clone()).map_err(|_| anyhow!("capture closed"))
    });
    (listener, rx)
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Message>, limit: Duration) -> Message {
    timeout(limit, rx.recv())
        .await
        .expect("no message within the time window")
        .expect("capture channel closed")
}

/// The subscribe call records the listener immediately; the transport
/// subscription follows asynchronously.
async fn wait_subscribed(transport: &MemoryTransport, channel: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while transport.subscriber_count(channel) != count {
        assert!(
            Instant::now() < deadline,
            "channel '{}' never reached {} transport subscribers",
            channel,
            count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_publish_is_delivered_to_listener() {
    let transport = MemoryTransport::new();
    let publisher = messenger_on(&transport, "node-a").await;
    let subscriber = messenger_on(&transport, "node-b").await;

    let (listener, mut inbox) = capture();
    subscriber.subscribe("alerts", listener).await.unwrap();
    wait_subscribed(&transport, "alerts", 1).await;

    publisher
        .publish("alerts", &json!({"level": "high"}))
        .await
        .unwrap();

    let message = recv_within(&mut inbox, Duration::from_secs(2)).await;
    assert_eq!(message.channel(), "alerts");
    assert_eq!(message.sender(), "node-a");
    assert_eq!(message.envelope.payload, json!({"level": "high"}));

    assert_eq!(publisher.stats().await.messages_published, 1);
    // The dispatched counter is updated after the listener returns.
    let deadline = Instant::now() + Duration::from_secs(2);
    while subscriber.stats().await.messages_dispatched < 1 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_per_channel_delivery_order() {
    let transport = MemoryTransport::new();
    let publisher = messenger_on(&transport, "node-a").await;
    let subscriber = messenger_on(&transport, "node-b").await;

    let (listener, mut inbox) = capture();
    subscriber.subscribe("metrics", listener).await.unwrap();
    wait_subscribed(&transport, "metrics", 1).await;

    for n in 0..50u32 {
        publisher.publish("metrics", &json!({"seq": n})).await.unwrap();
    }

    for n in 0..50u32 {
        let message = recv_within(&mut inbox, Duration::from_secs(2)).await;
        assert_eq!(message.envelope.payload, json!({"seq": n}));
    }

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_listener_does_not_starve_others() {
    let transport = MemoryTransport::new();
    let publisher = messenger_on(&transport, "node-a").await;
    let subscriber = messenger_on(&transport, "node-b").await;

    // The first listener fails on every message.
    subscriber
        .subscribe("alerts", listener_fn(|_| Err(anyhow!("always broken"))))
        .await
        .unwrap();
    let (listener, mut inbox) = capture();
    subscriber.subscribe("alerts", listener).await.unwrap();
    wait_subscribed(&transport, "alerts", 1).await;

    publisher.publish("alerts", &json!({"n": 1})).await.unwrap();
    publisher.publish("alerts", &json!({"n": 2})).await.unwrap();

    assert_eq!(
        recv_within(&mut inbox, Duration::from_secs(2)).await.envelope.payload,
        json!({"n": 1})
    );
    assert_eq!(
        recv_within(&mut inbox, Duration::from_secs(2)).await.envelope.payload,
        json!({"n": 2})
    );
    assert_eq!(subscriber.stats().await.listener_errors, 2);

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_replays_all_subscriptions() {
    init_tracing();
    let transport = MemoryTransport::new();
    let subscriber = messenger_on(&transport, "node-a").await;

    let mut inboxes = Vec::new();
    for channel in ["orders", "alerts", "metrics"] {
        let (listener, inbox) = capture();
        subscriber.subscribe(channel, listener).await.unwrap();
        wait_subscribed(&transport, channel, 1).await;
        inboxes.push((channel, inbox));
    }

    // Keep the connection down long enough to register a fourth channel
    // while reconnecting.
    transport.fail_connects(10_000);
    transport.drop_connections();
    subscriber
        .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2))
        .await
        .unwrap();

    let (listener, inbox) = capture();
    subscriber.subscribe("audit", listener).await.unwrap();
    inboxes.push(("audit", inbox));

    transport.fail_connects(0);
    subscriber
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
        .await
        .unwrap();

    // All four channels are transport-subscribed again, exactly once each.
    for channel in ["orders", "alerts", "metrics", "audit"] {
        wait_subscribed(&transport, channel, 1).await;
    }
    assert_eq!(transport.subscriber_count("unrelated"), 0);
    assert_eq!(subscriber.stats().await.reconnects, 1);

    // The replayed subscriptions are live.
    let publisher = messenger_on(&transport, "node-b").await;
    for (channel, inbox) in inboxes.iter_mut() {
        publisher
            .publish(channel, &json!({"after": "reconnect"}))
            .await
            .unwrap();
        let message = recv_within(inbox, Duration::from_secs(2)).await;
        assert_eq!(message.channel(), *channel);
    }

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_fail_fast_publish_without_buffer() {
    let transport = MemoryTransport::new();
    let messenger = messenger_on(&transport, "node-a").await;

    transport.fail_connects(10_000);
    transport.drop_connections();
    messenger
        .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2))
        .await
        .unwrap();

    let started = Instant::now();
    let outcome = messenger.publish("alerts", &json!({"n": 1})).await;
    assert!(matches!(outcome, Err(MessengerError::NotConnected)));
    assert!(started.elapsed() < Duration::from_millis(500), "publish hung");

    messenger.close().await.unwrap();
}

#[tokio::test]
async fn test_buffered_publishes_flush_in_order_after_reconnect() {
    init_tracing();
    let transport = MemoryTransport::new();

    let mut config = test_config("node-a");
    config.publish.buffer_size = 8;
    let publisher = RedisMessenger::with_transport(config, Arc::new(transport.clone()))
        .await
        .unwrap();

    let subscriber = messenger_on(&transport, "node-b").await;
    let (listener, mut inbox) = capture();
    subscriber.subscribe("alerts", listener).await.unwrap();
    wait_subscribed(&transport, "alerts", 1).await;

    // Sever only the publisher's connection; the subscriber stays up.
    transport.fail_connects(10_000);
    transport.drop_oldest(1);
    publisher
        .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2))
        .await
        .unwrap();

    for n in 0..3u32 {
        publisher.publish("alerts", &json!({"seq": n})).await.unwrap();
    }

    transport.fail_connects(0);
    publisher
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
        .await
        .unwrap();

    for n in 0..3u32 {
        let message = recv_within(&mut inbox, Duration::from_secs(2)).await;
        assert_eq!(message.envelope.payload, json!({"seq": n}));
    }

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_to_reaches_only_addressed_instances() {
    let transport = MemoryTransport::new();
    let publisher = messenger_on(&transport, "node-a").await;
    let addressed = messenger_on(&transport, "node-b").await;
    let bystander = messenger_on(&transport, "node-c").await;

    let (listener, mut addressed_inbox) = capture();
    addressed.subscribe("alerts", listener).await.unwrap();
    let (listener, mut bystander_inbox) = capture();
    bystander.subscribe("alerts", listener).await.unwrap();
    wait_subscribed(&transport, "alerts", 2).await;

    publisher
        .publish_to("alerts", &["node-b"], &json!({"secret": true}))
        .await
        .unwrap();

    let message = recv_within(&mut addressed_inbox, Duration::from_secs(2)).await;
    assert_eq!(message.envelope.payload, json!({"secret": true}));

    let quiet = timeout(Duration::from_millis(100), bystander_inbox.recv()).await;
    assert!(quiet.is_err(), "bystander received a targeted message");

    publisher.close().await.unwrap();
    addressed.close().await.unwrap();
    bystander.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_acked_round_trip() {
    let transport = MemoryTransport::new();
    let publisher = messenger_on(&transport, "node-a").await;
    let subscriber = messenger_on(&transport, "node-b").await;

    // Acks come back on the same channel, so the publisher listens too.
    publisher
        .subscribe("alerts", listener_fn(|_| Ok(())))
        .await
        .unwrap();
    subscriber
        .subscribe("alerts", listener_fn(|_| Ok(())))
        .await
        .unwrap();
    wait_subscribed(&transport, "alerts", 2).await;

    publisher
        .publish_acked("alerts", &json!({"n": 1}), Duration::from_secs(2))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while subscriber.stats().await.acks_sent < 1 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_acked_times_out_without_receivers() {
    let transport = MemoryTransport::new();
    let publisher = messenger_on(&transport, "node-a").await;

    // Only the publisher itself listens; loopback never acks.
    publisher
        .subscribe("alerts", listener_fn(|_| Ok(())))
        .await
        .unwrap();
    wait_subscribed(&transport, "alerts", 1).await;

    let outcome = publisher
        .publish_acked("alerts", &json!({"n": 1}), Duration::from_millis(150))
        .await;
    assert!(matches!(outcome, Err(MessengerError::Timeout(_))));

    publisher.close().await.unwrap();
}

struct StatusResponder {
    messenger: RedisMessenger,
}

#[async_trait]
impl Listener for StatusResponder {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        if message.expects_reply() {
            self.messenger
                .reply(message, &json!({"status": "idle"}))
                .await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let transport = MemoryTransport::new();
    let requester = messenger_on(&transport, "node-a").await;
    let responder = messenger_on(&transport, "node-b").await;

    responder
        .subscribe(
            "jobs",
            Arc::new(StatusResponder {
                messenger: responder.clone(),
            }),
        )
        .await
        .unwrap();
    // Replies come back on the same channel, so the requester listens too.
    requester
        .subscribe("jobs", listener_fn(|_| Ok(())))
        .await
        .unwrap();
    wait_subscribed(&transport, "jobs", 2).await;

    let reply = requester
        .request("jobs", &json!({"op": "status"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.sender(), "node-b");
    assert_eq!(reply.envelope.payload, json!({"status": "idle"}));

    requester.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let transport = MemoryTransport::new();
    let requester = messenger_on(&transport, "node-a").await;

    requester
        .subscribe("jobs", listener_fn(|_| Ok(())))
        .await
        .unwrap();
    wait_subscribed(&transport, "jobs", 1).await;

    let outcome = requester
        .request("jobs", &json!({"op": "status"}), Duration::from_millis(150))
        .await;
    assert!(matches!(outcome, Err(MessengerError::Timeout(_))));

    requester.close().await.unwrap();
}

#[tokio::test]
async fn test_close_interrupts_reconnect_backoff() {
    let transport = MemoryTransport::new();
    let mut config = test_config("node-a");
    // A long backoff window that close() must cut short.
    config.reconnect.initial_delay_ms = 5_000;
    config.reconnect.max_delay_ms = 10_000;
    let messenger = RedisMessenger::with_transport(config, Arc::new(transport.clone()))
        .await
        .unwrap();

    transport.fail_connects(10_000);
    transport.drop_connections();
    messenger
        .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2))
        .await
        .unwrap();

    let started = Instant::now();
    messenger.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "close was stuck in backoff");
    assert_eq!(messenger.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_messengers_on_separate_transports_are_isolated() {
    let transport_a = MemoryTransport::new();
    let transport_b = MemoryTransport::new();
    let sender = messenger_on(&transport_a, "node-a").await;
    let other = messenger_on(&transport_b, "node-b").await;

    let (listener, mut inbox) = capture();
    other.subscribe("alerts", listener).await.unwrap();
    wait_subscribed(&transport_b, "alerts", 1).await;

    sender.publish("alerts", &json!({"n": 1})).await.unwrap();

    let quiet = timeout(Duration::from_millis(100), inbox.recv()).await;
    assert!(quiet.is_err(), "message crossed isolated messenger instances");

    sender.close().await.unwrap();
    other.close().await.unwrap();
}
