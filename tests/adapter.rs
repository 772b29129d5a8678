//! End-to-end scenarios driving the adapter through its connection surface,
//! with the in-memory broker behind it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

use mqgate::amqp::{AmqpBackend, InMemoryBroker, QueueSpec};
use mqgate::{
    Adapter, AdapterConfig, AdapterError, ConnectOptions, DeliverySink, LossCause,
    OutboundMessage, QoS, WillMessage,
};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const SILENCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct TestSink {
    messages: mpsc::UnboundedSender<OutboundMessage>,
    losses: mpsc::UnboundedSender<LossCause>,
    fail: AtomicBool,
}

#[async_trait]
impl DeliverySink for TestSink {
    async fn deliver(&self, msg: OutboundMessage) -> Result<(), AdapterError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AdapterError::Delivery);
        }
        self.messages.send(msg).map_err(|_| AdapterError::Delivery)
    }

    fn connection_lost(&self, cause: LossCause) {
        let _ = self.losses.send(cause);
    }
}

#[derive(Debug)]
struct TestClient {
    handle: mqgate::SessionHandle,
    messages: mpsc::UnboundedReceiver<OutboundMessage>,
    losses: mpsc::UnboundedReceiver<LossCause>,
    sink: Arc<TestSink>,
}

fn setup() -> (Arc<InMemoryBroker>, Adapter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let broker = Arc::new(InMemoryBroker::new());
    let adapter = Adapter::new(broker.clone(), AdapterConfig::default());
    (broker, adapter)
}

fn opts(client_id: &str, clean: bool) -> ConnectOptions {
    ConnectOptions {
        client_id: client_id.to_string(),
        clean_session: clean,
        username: Some("guest".to_string()),
        password: Some(b"guest".to_vec()),
        will: None,
    }
}

async fn connect_with(
    adapter: &Adapter,
    options: ConnectOptions,
) -> Result<TestClient, AdapterError> {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (loss_tx, loss_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(TestSink {
        messages: msg_tx,
        losses: loss_tx,
        fail: AtomicBool::new(false),
    });
    let handle = adapter.on_connect(options, sink.clone()).await?;
    Ok(TestClient {
        handle,
        messages: msg_rx,
        losses: loss_rx,
        sink,
    })
}

async fn connect(adapter: &Adapter, client_id: &str, clean: bool) -> TestClient {
    connect_with(adapter, opts(client_id, clean))
        .await
        .expect("connect failed")
}

async fn recv(client: &mut TestClient) -> OutboundMessage {
    timeout(RECV_TIMEOUT, client.messages.recv())
        .await
        .expect("no message within timeout")
        .expect("sink channel closed")
}

async fn assert_silence(client: &mut TestClient) {
    match timeout(SILENCE_WINDOW, client.messages.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(msg)) => panic!("unexpected message on {}: {:?}", msg.topic, msg.payload),
    }
}

async fn recv_loss(client: &mut TestClient) -> LossCause {
    timeout(RECV_TIMEOUT, client.losses.recv())
        .await
        .expect("no loss event within timeout")
        .expect("loss channel closed")
}

async fn publish(adapter: &Adapter, client: &TestClient, topic: &str, payload: &str, qos: QoS) {
    adapter
        .on_publish(
            &client.handle,
            topic,
            Bytes::copy_from_slice(payload.as_bytes()),
            qos,
            false,
        )
        .await
        .expect("publish failed");
}

#[tokio::test]
async fn subscribe_qos0_downgrades_everything() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "sub0", true).await;
    let publisher = connect(&adapter, "pub", true).await;

    let granted = adapter
        .on_subscribe(&sub.handle, "test-topic", QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(granted, QoS::AtMostOnce);

    publish(&adapter, &publisher, "test-topic", "at-zero", QoS::AtMostOnce).await;
    publish(&adapter, &publisher, "test-topic", "at-one", QoS::AtLeastOnce).await;

    let first = recv(&mut sub).await;
    assert_eq!(first.payload.as_ref(), b"at-zero");
    assert_eq!(first.qos, QoS::AtMostOnce);
    assert_eq!(first.delivery_id, None);

    let second = recv(&mut sub).await;
    assert_eq!(second.payload.as_ref(), b"at-one");
    assert_eq!(second.qos, QoS::AtMostOnce);
    assert_eq!(second.delivery_id, None);
}

#[tokio::test]
async fn subscribe_qos1_delivers_at_publish_qos() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "sub1", true).await;
    let publisher = connect(&adapter, "pub", true).await;

    adapter
        .on_subscribe(&sub.handle, "test-topic", QoS::AtLeastOnce)
        .await
        .unwrap();

    publish(&adapter, &publisher, "test-topic", "at-zero", QoS::AtMostOnce).await;
    publish(&adapter, &publisher, "test-topic", "at-one", QoS::AtLeastOnce).await;

    let first = recv(&mut sub).await;
    assert_eq!(first.qos, QoS::AtMostOnce);
    assert_eq!(first.delivery_id, None);

    let second = recv(&mut sub).await;
    assert_eq!(second.qos, QoS::AtLeastOnce);
    let id = second.delivery_id.expect("qos1 delivery needs an id");
    tokio_test::assert_ok!(adapter.on_puback(&sub.handle, id).await);
}

#[tokio::test]
async fn deliveries_arrive_in_publish_order() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "ordered", true).await;
    let publisher = connect(&adapter, "pub", true).await;

    adapter
        .on_subscribe(&sub.handle, "seq", QoS::AtLeastOnce)
        .await
        .unwrap();

    for payload in ["one", "two", "three"] {
        publish(&adapter, &publisher, "seq", payload, QoS::AtLeastOnce).await;
    }

    for expected in ["one", "two", "three"] {
        assert_eq!(recv(&mut sub).await.payload.as_ref(), expected.as_bytes());
    }
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "unsub", true).await;
    let publisher = connect(&adapter, "pub", true).await;

    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();
    publish(&adapter, &publisher, "t", "before", QoS::AtLeastOnce).await;
    assert_eq!(recv(&mut sub).await.payload.as_ref(), b"before");

    adapter.on_unsubscribe(&sub.handle, "t").await.unwrap();
    publish(&adapter, &publisher, "t", "after", QoS::AtLeastOnce).await;
    assert_silence(&mut sub).await;
}

#[tokio::test]
async fn changing_subscription_qos_does_not_duplicate() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "upgrade", true).await;
    let publisher = connect(&adapter, "pub", true).await;

    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtMostOnce)
        .await
        .unwrap();
    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();

    publish(&adapter, &publisher, "t", "once", QoS::AtLeastOnce).await;
    let msg = recv(&mut sub).await;
    assert_eq!(msg.qos, QoS::AtLeastOnce);
    assert_silence(&mut sub).await;
}

#[tokio::test]
async fn retained_message_reaches_late_subscriber() {
    let (_, adapter) = setup();
    let publisher = connect(&adapter, "pub", true).await;

    adapter
        .on_publish(
            &publisher.handle,
            "status",
            Bytes::from_static(b"retained message"),
            QoS::AtLeastOnce,
            true,
        )
        .await
        .unwrap();

    // QoS 0 subscriber gets it downgraded
    let mut sub0 = connect(&adapter, "late0", true).await;
    adapter
        .on_subscribe(&sub0.handle, "status", QoS::AtMostOnce)
        .await
        .unwrap();
    let msg = recv(&mut sub0).await;
    assert_eq!(msg.payload.as_ref(), b"retained message");
    assert_eq!(msg.qos, QoS::AtMostOnce);

    // QoS 1 subscriber gets it at the stored QoS, with a delivery id
    let mut sub1 = connect(&adapter, "late1", true).await;
    adapter
        .on_subscribe(&sub1.handle, "status", QoS::AtLeastOnce)
        .await
        .unwrap();
    let msg = recv(&mut sub1).await;
    assert_eq!(msg.qos, QoS::AtLeastOnce);
    let id = msg.delivery_id.unwrap();
    adapter.on_puback(&sub1.handle, id).await.unwrap();
}

#[tokio::test]
async fn retained_last_write_wins_and_empty_clears() {
    let (_, adapter) = setup();
    let publisher = connect(&adapter, "pub", true).await;

    for payload in ["first", "second"] {
        adapter
            .on_publish(
                &publisher.handle,
                "status",
                Bytes::copy_from_slice(payload.as_bytes()),
                QoS::AtMostOnce,
                true,
            )
            .await
            .unwrap();
    }

    let mut sub = connect(&adapter, "late", true).await;
    adapter
        .on_subscribe(&sub.handle, "status", QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(recv(&mut sub).await.payload.as_ref(), b"second");
    assert_silence(&mut sub).await;

    // Empty retained payload clears the slot
    adapter
        .on_publish(&publisher.handle, "status", Bytes::new(), QoS::AtMostOnce, true)
        .await
        .unwrap();

    let mut later = connect(&adapter, "later", true).await;
    adapter
        .on_subscribe(&later.handle, "status", QoS::AtMostOnce)
        .await
        .unwrap();
    assert_silence(&mut later).await;
}

#[tokio::test]
async fn persistent_session_receives_messages_published_while_away() {
    let (_, adapter) = setup();
    let sub = connect(&adapter, "durable", false).await;
    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();
    adapter.on_disconnect(&sub.handle, true).await.unwrap();

    let publisher = connect(&adapter, "pub", true).await;
    publish(&adapter, &publisher, "t", "while away", QoS::AtLeastOnce).await;

    // Reconnect without resubscribing; the binding survived
    let mut sub = connect(&adapter, "durable", false).await;
    let msg = recv(&mut sub).await;
    assert_eq!(msg.payload.as_ref(), b"while away");
    assert_eq!(msg.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn unacked_qos1_redelivered_after_reconnect() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "redeliver", false).await;
    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();

    let publisher = connect(&adapter, "pub", true).await;
    publish(&adapter, &publisher, "t", "needs ack", QoS::AtLeastOnce).await;

    // Receive but never acknowledge
    let msg = recv(&mut sub).await;
    assert!(msg.delivery_id.is_some());
    adapter.on_disconnect(&sub.handle, true).await.unwrap();

    let mut sub = connect(&adapter, "redeliver", false).await;
    let again = recv(&mut sub).await;
    assert_eq!(again.payload.as_ref(), b"needs ack");
    let id = again.delivery_id.unwrap();
    adapter.on_puback(&sub.handle, id).await.unwrap();
    adapter.on_disconnect(&sub.handle, true).await.unwrap();

    // Acked for real this time; nothing left on the next resume
    let mut sub = connect(&adapter, "redeliver", false).await;
    assert_silence(&mut sub).await;
}

#[tokio::test]
async fn retained_not_replayed_on_resume() {
    let (_, adapter) = setup();
    let publisher = connect(&adapter, "pub", true).await;
    adapter
        .on_publish(
            &publisher.handle,
            "status",
            Bytes::from_static(b"sticky"),
            QoS::AtLeastOnce,
            true,
        )
        .await
        .unwrap();

    let mut sub = connect(&adapter, "resume", false).await;
    adapter
        .on_subscribe(&sub.handle, "status", QoS::AtLeastOnce)
        .await
        .unwrap();
    let msg = recv(&mut sub).await;
    adapter
        .on_puback(&sub.handle, msg.delivery_id.unwrap())
        .await
        .unwrap();
    adapter.on_disconnect(&sub.handle, true).await.unwrap();

    // Resuming is not subscribing; the retained message stays put
    let mut sub = connect(&adapter, "resume", false).await;
    assert_silence(&mut sub).await;
}

#[tokio::test]
async fn clean_reconnect_discards_session_state() {
    let (broker, adapter) = setup();
    let sub = connect(&adapter, "wiped", false).await;
    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();
    adapter.on_disconnect(&sub.handle, true).await.unwrap();

    let publisher = connect(&adapter, "pub", true).await;
    publish(&adapter, &publisher, "t", "lost", QoS::AtLeastOnce).await;

    let mut sub = connect(&adapter, "wiped", true).await;
    assert_silence(&mut sub).await;
    assert!(!broker.has_queue("mqtt-subscription-wipedqos1"));
}

#[tokio::test]
async fn second_connect_evicts_the_first() {
    let (_, adapter) = setup();
    let mut first = connect(&adapter, "dup", true).await;
    let second = connect(&adapter, "dup", true).await;

    assert_eq!(recv_loss(&mut first).await, LossCause::SessionTakenOver);
    assert_eq!(adapter.session_count(), 1);
    assert_eq!(second.handle.client_id(), "dup");

    // The old handle is stale now
    let err = adapter
        .on_subscribe(&first.handle, "t", QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::ProtocolViolation(_)));

    // And its late disconnect must not tear down the new connection
    adapter.on_disconnect(&first.handle, false).await.unwrap();
    assert_eq!(adapter.session_count(), 1);
    adapter
        .on_subscribe(&second.handle, "t", QoS::AtMostOnce)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_settle_on_one_session() {
    let (_, adapter) = setup();
    let adapter = Arc::new(adapter);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let adapter = adapter.clone();
        tasks.push(tokio::spawn(
            async move { connect(&adapter, "contested", true).await },
        ));
    }
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    assert_eq!(adapter.session_count(), 1);

    // Every connection but one was taken over, and exactly one handle
    // is still good for anything
    let mut survivors = 0;
    let mut evicted = 0;
    for mut client in clients {
        match timeout(SILENCE_WINDOW, client.losses.recv()).await {
            Ok(Some(LossCause::SessionTakenOver)) => evicted += 1,
            _ => {
                adapter
                    .on_subscribe(&client.handle, "t", QoS::AtMostOnce)
                    .await
                    .unwrap();
                survivors += 1;
            }
        }
    }
    assert_eq!(survivors, 1);
    assert_eq!(evicted, 15);
}

#[tokio::test]
async fn unsubscribe_leaves_enqueued_messages_to_drain() {
    let (_, adapter) = setup();
    let sub = connect(&adapter, "drainer", false).await;
    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();
    adapter.on_disconnect(&sub.handle, true).await.unwrap();

    let publisher = connect(&adapter, "pub", true).await;
    publish(&adapter, &publisher, "t", "queued", QoS::AtLeastOnce).await;

    // Unsubscribing removes the binding but not what the queue already holds
    let mut sub = connect(&adapter, "drainer", false).await;
    adapter.on_unsubscribe(&sub.handle, "t").await.unwrap();
    let msg = recv(&mut sub).await;
    assert_eq!(msg.payload.as_ref(), b"queued");

    publish(&adapter, &publisher, "t", "after", QoS::AtLeastOnce).await;
    assert_silence(&mut sub).await;
}

#[tokio::test]
async fn will_fires_on_ungraceful_disconnect_only() {
    let (_, adapter) = setup();
    let mut watcher = connect(&adapter, "watcher", true).await;
    adapter
        .on_subscribe(&watcher.handle, "wills/here", QoS::AtLeastOnce)
        .await
        .unwrap();

    let will = WillMessage {
        topic: "wills/here".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtLeastOnce,
        retain: false,
    };

    // Graceful disconnect disarms
    let mut options = opts("mortal", true);
    options.will = Some(will.clone());
    let client = connect_with(&adapter, options).await.unwrap();
    adapter.on_disconnect(&client.handle, true).await.unwrap();
    assert_silence(&mut watcher).await;

    // Ungraceful fires
    let mut options = opts("mortal", true);
    options.will = Some(will);
    let client = connect_with(&adapter, options).await.unwrap();
    adapter.on_disconnect(&client.handle, false).await.unwrap();
    let msg = recv(&mut watcher).await;
    assert_eq!(msg.topic, "wills/here");
    assert_eq!(msg.payload.as_ref(), b"gone");
    assert_eq!(msg.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn takeover_fires_the_old_will() {
    let (_, adapter) = setup();
    let mut watcher = connect(&adapter, "watcher", true).await;
    adapter
        .on_subscribe(&watcher.handle, "wills/takeover", QoS::AtMostOnce)
        .await
        .unwrap();

    let mut options = opts("shared", true);
    options.will = Some(WillMessage {
        topic: "wills/takeover".to_string(),
        payload: Bytes::from_static(b"usurped"),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let _first = connect_with(&adapter, options).await.unwrap();

    let _second = connect(&adapter, "shared", true).await;
    assert_eq!(recv(&mut watcher).await.payload.as_ref(), b"usurped");
}

#[tokio::test]
async fn wildcard_filters_route_like_the_exchange() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "wild", true).await;
    let publisher = connect(&adapter, "pub", true).await;

    adapter
        .on_subscribe(&sub.handle, "/+/mid/#", QoS::AtMostOnce)
        .await
        .unwrap();

    publish(&adapter, &publisher, "/a/mid/b/c/d", "deep", QoS::AtMostOnce).await;
    publish(&adapter, &publisher, "/frob/mid", "flush", QoS::AtMostOnce).await;
    publish(&adapter, &publisher, "/pre/mid2", "miss", QoS::AtMostOnce).await;
    publish(&adapter, &publisher, "/mid", "miss", QoS::AtMostOnce).await;

    assert_eq!(recv(&mut sub).await.payload.as_ref(), b"deep");
    assert_eq!(recv(&mut sub).await.payload.as_ref(), b"flush");
    assert_silence(&mut sub).await;
}

#[tokio::test]
async fn delivery_failure_closes_and_preserves_messages() {
    let (_, adapter) = setup();
    let mut sub = connect(&adapter, "flaky", false).await;
    adapter
        .on_subscribe(&sub.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();
    sub.sink.fail.store(true, Ordering::SeqCst);

    let publisher = connect(&adapter, "pub", true).await;
    publish(&adapter, &publisher, "t", "kept", QoS::AtLeastOnce).await;

    assert_eq!(recv_loss(&mut sub).await, LossCause::DeliveryFailure);
    adapter.on_disconnect(&sub.handle, false).await.unwrap();

    let mut sub = connect(&adapter, "flaky", false).await;
    assert_eq!(recv(&mut sub).await.payload.as_ref(), b"kept");
}

#[tokio::test]
async fn authentication_failures() {
    let (_, adapter) = setup();

    let mut bad_pass = opts("auth", true);
    bad_pass.password = Some(b"wrong".to_vec());
    assert!(matches!(
        connect_with(&adapter, bad_pass).await.unwrap_err(),
        AdapterError::Authentication
    ));

    let mut bad_user = opts("auth", true);
    bad_user.username = Some("nobody".to_string());
    assert!(matches!(
        connect_with(&adapter, bad_user).await.unwrap_err(),
        AdapterError::Authentication
    ));

    let mut anonymous = opts("auth", true);
    anonymous.username = None;
    anonymous.password = None;
    assert!(matches!(
        connect_with(&adapter, anonymous).await.unwrap_err(),
        AdapterError::Authentication
    ));

    assert_eq!(adapter.session_count(), 0);
}

#[tokio::test]
async fn invalid_packets_are_protocol_violations() {
    let (_, adapter) = setup();

    assert!(matches!(
        connect_with(&adapter, opts("", true)).await.unwrap_err(),
        AdapterError::ProtocolViolation(_)
    ));

    let client = connect(&adapter, "strict", true).await;
    assert!(matches!(
        adapter
            .on_subscribe(&client.handle, "bad+filter", QoS::AtMostOnce)
            .await
            .unwrap_err(),
        AdapterError::ProtocolViolation(_)
    ));
    assert!(matches!(
        adapter
            .on_publish(
                &client.handle,
                "has/#/wildcard",
                Bytes::new(),
                QoS::AtMostOnce,
                false
            )
            .await
            .unwrap_err(),
        AdapterError::ProtocolViolation(_)
    ));
    assert!(matches!(
        adapter.on_puback(&client.handle, 999).await.unwrap_err(),
        AdapterError::ProtocolViolation(_)
    ));
}

#[tokio::test]
async fn session_queues_carry_the_expected_arguments() {
    let (broker, adapter) = setup();

    let durable = connect(&adapter, "keeper", false).await;
    adapter
        .on_subscribe(&durable.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(
        broker.queue_spec("mqtt-subscription-keeperqos1"),
        Some(QueueSpec {
            durable: true,
            auto_delete: false,
            expires: Some(Duration::from_secs(86400)),
        })
    );

    let transient = connect(&adapter, "drifter", true).await;
    adapter
        .on_subscribe(&transient.handle, "t", QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(
        broker.queue_spec("mqtt-subscription-drifterqos0"),
        Some(QueueSpec {
            durable: false,
            auto_delete: true,
            expires: None,
        })
    );

    // A clean session's queue disappears with its connection
    adapter.on_disconnect(&transient.handle, true).await.unwrap();
    assert!(!broker.has_queue("mqtt-subscription-drifterqos0"));
}

#[tokio::test]
async fn conflicting_queue_is_a_session_collision() {
    let (broker, adapter) = setup();
    broker
        .declare_queue(
            "mqtt-subscription-squatqos1",
            QueueSpec {
                durable: false,
                auto_delete: false,
                expires: None,
            },
        )
        .await
        .unwrap();

    let client = connect(&adapter, "squat", false).await;
    let err = adapter
        .on_subscribe(&client.handle, "t", QoS::AtLeastOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::SessionCollision(q) if q.contains("squat")));
}
