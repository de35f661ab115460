#![allow(dead_code)]

//! In-process broker harness: drives the same decoded-method surface the
//! transport collaborator uses and observes the frames the broker queues
//! for the client.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::mpsc;
use warren_core::{
    connection::{
        Channel, ChannelNum, ConEventReceiver, Connection, ConnectionEvent, ContentHeader,
    },
    error::ProtocolError,
    message::Properties,
    methods::{
        class, BasicConsume, BasicDeliver, BasicPublish, Method, QueueDeclare, Table,
    },
    SingleVec,
};
use warren_messaging::{AllowAll, Broker, BrokerConfig};
use warren_storage::MemoryKv;

pub const RECV_DEADLINE: Duration = Duration::from_secs(1);

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        auto_delete_grace: Duration::from_millis(20),
        ..BrokerConfig::default()
    }
}

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub kv: Arc<MemoryKv>,
}

impl TestBroker {
    pub fn start() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let kv = Arc::new(MemoryKv::new());
        let broker = Broker::new(config, kv.clone(), Arc::new(AllowAll)).expect("broker boots");
        Self { broker, kv }
    }

    /// Restarts the broker on the same storage, as if the process had been
    /// stopped and started again.
    pub async fn restart(self) -> Self {
        self.broker.shutdown().await;
        let broker =
            Broker::new(test_config(), self.kv.clone(), Arc::new(AllowAll)).expect("broker reboots");
        Self {
            broker,
            kv: self.kv,
        }
    }

    pub fn connect(&self) -> TestClient {
        let peer: SocketAddr = "127.0.0.1:49152".parse().unwrap();
        let (sender, events) = mpsc::channel(64);
        let connection = self
            .broker
            .open_connection(peer, "guest", "guest", "/", sender)
            .expect("connection opens");
        TestClient {
            broker: self.broker.clone(),
            connection,
            events,
            next_channel: AtomicU16::new(1),
        }
    }
}

pub struct TestClient {
    pub broker: Arc<Broker>,
    pub connection: Connection,
    pub events: ConEventReceiver,
    next_channel: AtomicU16,
}

impl TestClient {
    pub fn channel(&self) -> Channel {
        let num = self.next_channel.fetch_add(1, Ordering::Relaxed);
        self.broker
            .open_channel(&self.connection, ChannelNum::new(num))
            .expect("channel opens")
    }

    pub fn close(&self) {
        self.broker.close_connection(&self.connection);
    }
}

pub fn declare_queue(queue: &str, durable: bool, exclusive: bool, auto_delete: bool) -> Method {
    Method::QueueDeclare(QueueDeclare {
        queue: queue.to_owned(),
        passive: false,
        durable,
        exclusive,
        auto_delete,
        no_wait: false,
        arguments: Table::new(),
    })
}

pub fn declare_queue_passive(queue: &str) -> Method {
    Method::QueueDeclare(QueueDeclare {
        queue: queue.to_owned(),
        passive: true,
        durable: false,
        exclusive: false,
        auto_delete: false,
        no_wait: false,
        arguments: Table::new(),
    })
}

pub fn consume(queue: &str, consumer_tag: &str, no_ack: bool) -> Method {
    Method::BasicConsume(BasicConsume {
        queue: queue.to_owned(),
        consumer_tag: consumer_tag.to_owned(),
        no_local: false,
        no_ack,
        exclusive: false,
        no_wait: false,
        arguments: Table::new(),
    })
}

pub fn persistent() -> Properties {
    Properties {
        delivery_mode: Some(warren_core::message::DELIVERY_MODE_PERSISTENT),
        ..Properties::default()
    }
}

/// Publishes one message: the method frame, the content header and (unless
/// empty) a single body frame.
pub fn publish_full(
    broker: &Broker,
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    mandatory: bool,
    properties: Properties,
    body: &[u8],
) {
    broker
        .handle_method(
            channel.clone(),
            Method::BasicPublish(BasicPublish {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                mandatory,
                immediate: false,
            }),
        )
        .expect("publish method accepted");
    broker
        .handle_content_header(
            channel,
            ContentHeader {
                class_id: class::BASIC,
                weight: 0,
                body_size: body.len() as u64,
                properties,
            },
        )
        .expect("content header accepted");
    if !body.is_empty() {
        broker
            .handle_content_body(channel, Bytes::copy_from_slice(body))
            .expect("content body accepted");
    }
}

pub fn publish(broker: &Broker, channel: &Channel, exchange: &str, routing_key: &str, body: &[u8]) {
    publish_full(
        broker,
        channel,
        exchange,
        routing_key,
        false,
        Properties::default(),
        body,
    );
}

/// Waits for the next `basic.deliver` with its content, skipping unrelated
/// outbound frames.
pub async fn expect_delivery(
    events: &mut ConEventReceiver,
) -> (BasicDeliver, ContentHeader, SingleVec<Bytes>) {
    loop {
        let event = tokio::time::timeout(RECV_DEADLINE, events.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("event channel closed");
        if let ConnectionEvent::MethodContent(_, method, header, body) = event {
            if let Method::BasicDeliver(deliver) = *method {
                return (deliver, header, body);
            }
        }
    }
}

/// Waits for the next outbound frame that carries content, whatever the
/// method (deliver, get-ok, return).
pub async fn expect_content(
    events: &mut ConEventReceiver,
) -> (Method, ContentHeader, SingleVec<Bytes>) {
    loop {
        let event = tokio::time::timeout(RECV_DEADLINE, events.recv())
            .await
            .expect("timed out waiting for content")
            .expect("event channel closed");
        if let ConnectionEvent::MethodContent(_, method, header, body) = event {
            return (*method, header, body);
        }
    }
}

/// Waits for the next content-less outbound method (acks, cancels).
pub async fn expect_method(events: &mut ConEventReceiver) -> Method {
    loop {
        let event = tokio::time::timeout(RECV_DEADLINE, events.recv())
            .await
            .expect("timed out waiting for a method")
            .expect("event channel closed");
        if let ConnectionEvent::Method(_, method) = event {
            return *method;
        }
    }
}

/// Asserts that no delivery shows up within `window`.
pub async fn assert_no_delivery(events: &mut ConEventReceiver, window: Duration) {
    let outcome = tokio::time::timeout(window, async {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::MethodContent(_, method, _, _)) => {
                    if let Method::BasicDeliver(deliver) = *method {
                        break deliver;
                    }
                }
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(deliver) = outcome {
        panic!("expected silence but got a delivery: {deliver:?}");
    }
}

pub fn expect_channel_error<T: std::fmt::Debug>(
    result: Result<T, ProtocolError>,
    reply_code: u16,
) {
    match result {
        Err(ProtocolError::ChannelException(ex)) => assert_eq!(
            ex.reply_code(),
            reply_code,
            "wrong reply code: {ex:?}"
        ),
        other => panic!("expected channel exception {reply_code}, got {other:?}"),
    }
}

/// Polls until `predicate` holds or the deadline passes.
pub async fn wait_until(mut predicate: impl FnMut() -> bool, deadline: Duration) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
