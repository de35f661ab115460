//! Restart-boundary scenarios: durable topology and persistent messages
//! must come back, everything else must not.

mod common;

use common::*;
use warren_core::{
    exchange::ExchangeKind,
    methods::{BasicAck, ExchangeDeclare, Method, QueueBind, Table},
};

fn declare_durable_exchange(name: &str, kind: &str) -> Method {
    Method::ExchangeDeclare(ExchangeDeclare {
        exchange: name.to_owned(),
        kind: kind.to_owned(),
        passive: false,
        durable: true,
        auto_delete: false,
        internal: false,
        no_wait: false,
        arguments: Table::new(),
    })
}

fn bind(queue: &str, exchange: &str, routing_key: &str) -> Method {
    Method::QueueBind(QueueBind {
        queue: queue.to_owned(),
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
        no_wait: false,
        arguments: Table::new(),
    })
}

#[tokio::test]
async fn durable_topology_and_messages_survive_a_restart() {
    let server = TestBroker::start();
    {
        let client = server.connect();
        let channel = client.channel();

        client
            .broker
            .handle_method(channel.clone(), declare_durable_exchange("orders", "direct"))
            .unwrap();
        client
            .broker
            .handle_method(channel.clone(), declare_queue("inbox", true, false, false))
            .unwrap();
        client
            .broker
            .handle_method(channel.clone(), bind("inbox", "orders", "new"))
            .unwrap();

        for i in 0..5u8 {
            publish_full(
                &client.broker,
                &channel,
                "orders",
                "new",
                false,
                persistent(),
                &[i],
            );
        }
        client.close();
    }

    let server = server.restart().await;

    let vhost = server.broker.vhost("/").unwrap();
    let exchange = vhost.exchange("orders").expect("exchange recovered");
    assert_eq!(exchange.kind, ExchangeKind::Direct);
    assert!(exchange.durable);
    assert!(exchange
        .bindings()
        .iter()
        .any(|b| b.queue.as_str() == "inbox" && b.routing_key == "new"));

    let queue = vhost.queue("inbox").expect("queue recovered");
    assert!(queue.durable);
    assert_eq!(queue.length(), 5);

    // replayed messages arrive in original publish order
    let mut client = server.connect();
    let channel = client.channel();
    client
        .broker
        .handle_method(channel, consume("inbox", "tag1", true))
        .unwrap();
    for i in 0..5u8 {
        let (_, _, body) = expect_delivery(&mut client.events).await;
        assert_eq!(&body[0][..], &[i]);
    }
}

#[tokio::test]
async fn acked_messages_are_not_recovered() {
    let server = TestBroker::start();
    {
        let mut client = server.connect();
        let channel = client.channel();

        client
            .broker
            .handle_method(channel.clone(), declare_queue("inbox", true, false, false))
            .unwrap();
        for i in 0..3u8 {
            publish_full(&client.broker, &channel, "", "inbox", false, persistent(), &[i]);
        }

        client
            .broker
            .handle_method(channel.clone(), consume("inbox", "tag1", false))
            .unwrap();
        let (deliver, _, body) = expect_delivery(&mut client.events).await;
        assert_eq!(&body[0][..], &[0]);
        client
            .broker
            .handle_method(
                channel,
                Method::BasicAck(BasicAck {
                    delivery_tag: deliver.delivery_tag,
                    multiple: false,
                }),
            )
            .unwrap();
        client.close();
    }

    let server = server.restart().await;

    let queue = server.broker.vhost("/").unwrap().queue("inbox").unwrap();
    assert_eq!(queue.length(), 2, "only the unsettled messages come back");
}

#[tokio::test]
async fn transient_state_does_not_survive() {
    let server = TestBroker::start();
    {
        let client = server.connect();
        let channel = client.channel();

        // non-durable queue holding persistent messages
        client
            .broker
            .handle_method(channel.clone(), declare_queue("fleeting", false, false, false))
            .unwrap();
        publish_full(&client.broker, &channel, "", "fleeting", false, persistent(), b"x");

        // durable queue holding a transient message
        client
            .broker
            .handle_method(channel.clone(), declare_queue("keeper", true, false, false))
            .unwrap();
        publish(&client.broker, &channel, "", "keeper", b"y");
        client.close();
    }

    let server = server.restart().await;

    let vhost = server.broker.vhost("/").unwrap();
    assert!(vhost.queue("fleeting").is_none());

    let keeper = vhost.queue("keeper").expect("durable queue recovered");
    assert_eq!(keeper.length(), 0, "transient messages are not recovered");
}

#[tokio::test]
async fn exclusive_queues_are_never_persisted() {
    let server = TestBroker::start();
    {
        let client = server.connect();
        client
            .broker
            .handle_method(client.channel(), declare_queue("private", true, true, false))
            .unwrap();
        client.close();
    }

    let server = server.restart().await;
    assert!(server.broker.vhost("/").unwrap().queue("private").is_none());
}

#[tokio::test]
async fn redelivery_state_survives_a_restart() {
    let server = TestBroker::start();
    {
        let mut client = server.connect();
        let channel = client.channel();

        client
            .broker
            .handle_method(channel.clone(), declare_queue("inbox", true, false, false))
            .unwrap();
        publish_full(&client.broker, &channel, "", "inbox", false, persistent(), b"job");

        client
            .broker
            .handle_method(channel.clone(), consume("inbox", "tag1", false))
            .unwrap();
        let (deliver, _, _) = expect_delivery(&mut client.events).await;
        assert!(!deliver.redelivered);

        // requeue through channel close, like a crashing consumer would
        client.broker.close_channel(&channel);
        client.close();
    }

    let server = server.restart().await;

    let mut client = server.connect();
    let channel = client.channel();
    client
        .broker
        .handle_method(channel, consume("inbox", "tag1", true))
        .unwrap();
    let (deliver, _, _) = expect_delivery(&mut client.events).await;
    assert!(
        deliver.redelivered,
        "a once-delivered message must come back flagged as redelivered"
    );
}
