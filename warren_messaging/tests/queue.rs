//! Topology scenarios: queue declare/bind/purge/delete semantics, exclusive
//! ownership and the auto-delete lifecycle.

mod common;

use std::time::Duration;

use common::*;
use warren_core::methods::{
    BasicCancel, Method, QueueBind, QueueDelete, QueuePurge, QueueUnbind, Table,
};
use warren_storage::TopologyStore;

fn bind(queue: &str, exchange: &str, routing_key: &str) -> Method {
    Method::QueueBind(QueueBind {
        queue: queue.to_owned(),
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
        no_wait: false,
        arguments: Table::new(),
    })
}

fn unbind(queue: &str, exchange: &str, routing_key: &str) -> Method {
    Method::QueueUnbind(QueueUnbind {
        queue: queue.to_owned(),
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
        arguments: Table::new(),
    })
}

fn declare_direct_exchange(name: &str) -> Method {
    Method::ExchangeDeclare(warren_core::methods::ExchangeDeclare {
        exchange: name.to_owned(),
        kind: "direct".to_owned(),
        passive: false,
        durable: false,
        auto_delete: false,
        internal: false,
        no_wait: false,
        arguments: Table::new(),
    })
}

fn delete_queue(queue: &str, if_unused: bool, if_empty: bool) -> Method {
    Method::QueueDelete(QueueDelete {
        queue: queue.to_owned(),
        if_unused,
        if_empty,
        no_wait: false,
    })
}

#[tokio::test]
async fn declare_creates_queue() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel, declare_queue("test", false, false, false))
        .unwrap();

    let vhost = server.broker.vhost("/").unwrap();
    assert!(vhost.queue("test").is_some());
}

#[tokio::test]
async fn declare_durable_reaches_storage() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel, declare_queue("test", true, false, false))
        .unwrap();

    let stored = TopologyStore::new(server.kv.clone()).queues("/").unwrap();
    assert!(stored.iter().any(|q| q.name == "test"));
}

#[tokio::test]
async fn declare_installs_default_binding() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel, declare_queue("test", false, false, false))
        .unwrap();

    let vhost = server.broker.vhost("/").unwrap();
    let default_exchange = vhost.exchange("").unwrap();
    assert!(default_exchange
        .bindings()
        .iter()
        .any(|b| b.queue.as_str() == "test" && b.routing_key == "test"));
}

#[tokio::test]
async fn redeclare_with_equal_properties_is_idempotent() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    for _ in 0..2 {
        client
            .broker
            .handle_method(channel.clone(), declare_queue("test", false, false, false))
            .unwrap();
    }

    assert_eq!(server.broker.vhost("/").unwrap().queue_count(), 1);
}

#[tokio::test]
async fn redeclare_with_different_properties_fails() {
    let server = TestBroker::start();
    let client = server.connect();

    client
        .broker
        .handle_method(client.channel(), declare_queue("test", false, false, false))
        .unwrap();

    let result = client
        .broker
        .handle_method(client.channel(), declare_queue("test", true, false, false));
    expect_channel_error(result, 406);

    // the original queue is untouched
    let queue = server.broker.vhost("/").unwrap().queue("test").unwrap();
    assert!(!queue.durable);
}

#[tokio::test]
async fn declare_empty_name_generates_one() {
    let server = TestBroker::start();
    let client = server.connect();

    let reply = client
        .broker
        .handle_method(client.channel(), declare_queue("", false, false, false))
        .unwrap();

    let Some(Method::QueueDeclareOk(ok)) = reply else {
        panic!("expected queue.declare-ok, got {reply:?}");
    };
    assert!(ok.queue.starts_with("amq.gen-"), "got {:?}", ok.queue);
    assert!(server.broker.vhost("/").unwrap().queue(&ok.queue).is_some());
}

#[tokio::test]
async fn declare_reserved_name_is_refused() {
    let server = TestBroker::start();
    let client = server.connect();

    let result = client
        .broker
        .handle_method(client.channel(), declare_queue("amq.sneaky", false, false, false));
    expect_channel_error(result, 403);
    assert!(server.broker.vhost("/").unwrap().queue("amq.sneaky").is_none());
}

#[tokio::test]
async fn passive_declare_checks_existence() {
    let server = TestBroker::start();
    let client = server.connect();

    client
        .broker
        .handle_method(client.channel(), declare_queue("test", false, false, false))
        .unwrap();

    let reply = client
        .broker
        .handle_method(client.channel(), declare_queue_passive("test"))
        .unwrap();
    assert!(matches!(reply, Some(Method::QueueDeclareOk(_))));

    let result = client
        .broker
        .handle_method(client.channel(), declare_queue_passive("missing"));
    expect_channel_error(result, 404);
}

#[tokio::test]
async fn exclusive_queue_locks_out_other_connections() {
    let server = TestBroker::start();
    let owner = server.connect();
    let other = server.connect();

    owner
        .broker
        .handle_method(owner.channel(), declare_queue("test", false, true, false))
        .unwrap();

    // every operation from the other connection is refused
    expect_channel_error(
        other
            .broker
            .handle_method(other.channel(), declare_queue("test", false, false, false)),
        405,
    );
    expect_channel_error(
        other
            .broker
            .handle_method(other.channel(), declare_queue_passive("test")),
        405,
    );
    expect_channel_error(
        other
            .broker
            .handle_method(other.channel(), bind("test", "amq.direct", "key")),
        405,
    );
    expect_channel_error(
        other
            .broker
            .handle_method(other.channel(), unbind("test", "amq.direct", "key")),
        405,
    );
    expect_channel_error(
        other.broker.handle_method(
            other.channel(),
            Method::QueuePurge(QueuePurge {
                queue: "test".to_owned(),
                no_wait: false,
            }),
        ),
        405,
    );
    expect_channel_error(
        other
            .broker
            .handle_method(other.channel(), delete_queue("test", false, false)),
        405,
    );
}

#[tokio::test]
async fn exclusive_queue_dies_with_its_connection() {
    let server = TestBroker::start();
    let owner = server.connect();

    owner
        .broker
        .handle_method(owner.channel(), declare_queue("test", false, true, false))
        .unwrap();
    assert!(server.broker.vhost("/").unwrap().queue("test").is_some());

    owner.close();

    let vhost = server.broker.vhost("/").unwrap();
    let gone = wait_until(|| vhost.queue("test").is_none(), Duration::from_millis(100)).await;
    assert!(gone, "exclusive queue must vanish when its owner disconnects");
}

#[tokio::test]
async fn non_exclusive_queue_is_shared() {
    let server = TestBroker::start();
    let first = server.connect();
    let second = server.connect();

    first
        .broker
        .handle_method(first.channel(), declare_queue("test", false, false, false))
        .unwrap();
    second
        .broker
        .handle_method(second.channel(), declare_queue("test", false, false, false))
        .unwrap();
}

#[tokio::test]
async fn bind_creates_the_binding() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_direct_exchange("testEx"))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), declare_queue("testQu", false, false, false))
        .unwrap();
    client
        .broker
        .handle_method(channel, bind("testQu", "testEx", "key"))
        .unwrap();

    let exchange = server.broker.vhost("/").unwrap().exchange("testEx").unwrap();
    assert!(exchange
        .bindings()
        .iter()
        .any(|b| b.queue.as_str() == "testQu" && b.routing_key == "key"));
}

#[tokio::test]
async fn rebinding_the_same_tuple_does_not_duplicate() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_direct_exchange("testEx"))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), declare_queue("testQu", false, false, false))
        .unwrap();
    for _ in 0..2 {
        client
            .broker
            .handle_method(channel.clone(), bind("testQu", "testEx", "key"))
            .unwrap();
    }

    let exchange = server.broker.vhost("/").unwrap().exchange("testEx").unwrap();
    let matching = exchange
        .bindings()
        .iter()
        .filter(|b| b.queue.as_str() == "testQu" && b.routing_key == "key")
        .count();
    assert_eq!(matching, 1);
}

#[tokio::test]
async fn bind_to_missing_endpoints_fails() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_direct_exchange("testEx"))
        .unwrap();
    client
        .broker
        .handle_method(channel, declare_queue("testQu", false, false, false))
        .unwrap();

    expect_channel_error(
        client
            .broker
            .handle_method(client.channel(), bind("testQu", "missingEx", "key")),
        404,
    );
    expect_channel_error(
        client
            .broker
            .handle_method(client.channel(), bind("missingQu", "testEx", "key")),
        404,
    );
}

#[tokio::test]
async fn unbind_removes_the_binding() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_direct_exchange("testEx"))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), declare_queue("testQu", false, false, false))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), bind("testQu", "testEx", "key"))
        .unwrap();
    client
        .broker
        .handle_method(channel, unbind("testQu", "testEx", "key"))
        .unwrap();

    let exchange = server.broker.vhost("/").unwrap().exchange("testEx").unwrap();
    assert!(!exchange
        .bindings()
        .iter()
        .any(|b| b.queue.as_str() == "testQu" && b.routing_key == "key"));
}

#[tokio::test]
async fn unbind_missing_endpoints_fails() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_direct_exchange("testEx"))
        .unwrap();
    client
        .broker
        .handle_method(channel, declare_queue("testQu", false, false, false))
        .unwrap();

    expect_channel_error(
        client
            .broker
            .handle_method(client.channel(), unbind("testQu", "missingEx", "key")),
        404,
    );
    expect_channel_error(
        client
            .broker
            .handle_method(client.channel(), unbind("missingQu", "testEx", "key")),
        404,
    );
}

#[tokio::test]
async fn purge_drops_queued_messages() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("test", false, false, false))
        .unwrap();
    for _ in 0..10 {
        publish(&client.broker, &channel, "", "test", b"test");
    }

    let vhost = server.broker.vhost("/").unwrap();
    assert_eq!(vhost.queue("test").unwrap().length(), 10);

    let reply = client
        .broker
        .handle_method(
            channel,
            Method::QueuePurge(QueuePurge {
                queue: "test".to_owned(),
                no_wait: false,
            }),
        )
        .unwrap();
    let Some(Method::QueuePurgeOk(ok)) = reply else {
        panic!("expected queue.purge-ok, got {reply:?}");
    };
    assert_eq!(ok.message_count, 10);
    assert_eq!(vhost.queue("test").unwrap().length(), 0);
}

#[tokio::test]
async fn delete_if_empty_refuses_a_non_empty_queue() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("test", false, false, false))
        .unwrap();
    for _ in 0..10 {
        publish(&client.broker, &channel, "", "test", b"test");
    }

    expect_channel_error(
        client
            .broker
            .handle_method(client.channel(), delete_queue("test", false, true)),
        406,
    );

    // refused delete leaves the queue intact
    let queue = server.broker.vhost("/").unwrap().queue("test").unwrap();
    assert_eq!(queue.length(), 10);
}

#[tokio::test]
async fn delete_if_unused_refuses_a_consumed_queue() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("test", false, false, false))
        .unwrap();
    client
        .broker
        .handle_method(channel, consume("test", "tag1", true))
        .unwrap();

    expect_channel_error(
        client
            .broker
            .handle_method(client.channel(), delete_queue("test", true, false)),
        406,
    );
    assert!(server.broker.vhost("/").unwrap().queue("test").is_some());
}

#[tokio::test]
async fn delete_reports_the_purged_count() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("test", false, false, false))
        .unwrap();
    for _ in 0..10 {
        publish(&client.broker, &channel, "", "test", b"test");
    }

    let reply = client
        .broker
        .handle_method(channel, delete_queue("test", false, false))
        .unwrap();
    let Some(Method::QueueDeleteOk(ok)) = reply else {
        panic!("expected queue.delete-ok, got {reply:?}");
    };
    assert_eq!(ok.message_count, 10);
    assert!(server.broker.vhost("/").unwrap().queue("test").is_none());
}

#[tokio::test]
async fn delete_durable_queue_erases_storage() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("test", true, false, false))
        .unwrap();
    client
        .broker
        .handle_method(channel, delete_queue("test", false, false))
        .unwrap();

    let stored = TopologyStore::new(server.kv.clone()).queues("/").unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn delete_notifies_consumers() {
    let server = TestBroker::start();
    let mut client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("test", false, false, false))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), consume("test", "tag1", true))
        .unwrap();
    client
        .broker
        .handle_method(channel, delete_queue("test", false, false))
        .unwrap();

    let notification = expect_method(&mut client.events).await;
    assert_eq!(
        notification,
        Method::BasicCancel(BasicCancel {
            consumer_tag: "tag1".to_owned(),
            no_wait: true,
        })
    );
}

#[tokio::test]
async fn auto_delete_fires_after_the_last_cancel() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel.clone(), declare_queue("testQu", false, false, true))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), consume("testQu", "tag1", true))
        .unwrap();
    client
        .broker
        .handle_method(channel.clone(), consume("testQu", "tag2", true))
        .unwrap();

    client
        .broker
        .handle_method(
            channel.clone(),
            Method::BasicCancel(BasicCancel {
                consumer_tag: "tag2".to_owned(),
                no_wait: false,
            }),
        )
        .unwrap();

    // one consumer left, the queue stays
    tokio::time::sleep(Duration::from_millis(50)).await;
    let vhost = server.broker.vhost("/").unwrap();
    assert!(vhost.queue("testQu").is_some());

    client
        .broker
        .handle_method(
            channel,
            Method::BasicCancel(BasicCancel {
                consumer_tag: "tag1".to_owned(),
                no_wait: false,
            }),
        )
        .unwrap();

    let gone = wait_until(|| vhost.queue("testQu").is_none(), Duration::from_secs(1)).await;
    assert!(gone, "auto-delete queue must vanish after its last cancel");
}

#[tokio::test]
async fn auto_delete_waits_for_the_first_consumer() {
    let server = TestBroker::start();
    let client = server.connect();
    let channel = client.channel();

    client
        .broker
        .handle_method(channel, declare_queue("testQu", false, false, true))
        .unwrap();

    // never consumed from: the queue stays up
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.broker.vhost("/").unwrap().queue("testQu").is_some());
}
