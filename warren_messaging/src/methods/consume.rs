use std::ops::Not;

use tracing::info;
use warren_core::{
    connection::{Channel, ConnectionEvent, UnackedDelivery},
    consumer::Consumer,
    error::{ChannelException, ConException},
    method_unsupported,
    methods::{
        BasicCancel, BasicCancelOk, BasicConsume, BasicConsumeOk, BasicGet, BasicGetEmpty,
        BasicGetOk, BasicQos, BasicQosOk, Method,
    },
    queue::Queue,
    random_uuid,
};

use crate::{methods::MethodResponse, queue_worker::content_header_for, server::Broker};

pub(crate) fn consume(channel: &Channel, consume: BasicConsume) -> MethodResponse {
    if consume.no_local {
        method_unsupported!();
    }

    let queue = channel
        .vhost
        .queue(&consume.queue)
        .ok_or(ChannelException::NotFound)?;
    queue.ensure_usable_from(channel.connection.id)?;

    let consumer_tag = if consume.consumer_tag.is_empty() {
        format!("ctag-{}", random_uuid())
    } else {
        consume.consumer_tag.clone()
    };

    {
        let queue_state = queue.state();
        if queue_state.exclusive_consumer
            || (consume.exclusive && !queue_state.consumers.is_empty())
        {
            return Err(ChannelException::AccessRefused.into());
        }
    }

    let consumer = {
        let mut state = channel.state();
        if state.consumers.contains_key(&consumer_tag) {
            return Err(ChannelException::NotAllowed.into());
        }
        let consumer = Consumer::new(
            consumer_tag.clone(),
            channel.clone(),
            queue.clone(),
            consume.no_ack,
            consume.exclusive,
            state.consumer_prefetch_count,
            state.consumer_prefetch_size,
        );
        state.consumers.insert(consumer_tag.clone(), consumer.clone());
        consumer
    };
    queue.add_consumer(consumer);

    info!(queue = %queue.name, %consumer_tag, "Consumer started consuming");

    Ok(consume
        .no_wait
        .not()
        .then(|| Method::BasicConsumeOk(BasicConsumeOk { consumer_tag })))
}

pub(crate) fn cancel(channel: &Channel, cancel: BasicCancel) -> MethodResponse {
    let consumer = channel.state().consumers.remove(&cancel.consumer_tag);
    // 1.8.3.4 - a cancel for an unknown tag is not an error
    if let Some(consumer) = consumer {
        consumer.queue.remove_consumer(&cancel.consumer_tag);
        info!(queue = %consumer.queue.name, consumer_tag = %cancel.consumer_tag, "Consumer cancelled");
    }

    let consumer_tag = cancel.consumer_tag;
    Ok(cancel
        .no_wait
        .not()
        .then(|| Method::BasicCancelOk(BasicCancelOk { consumer_tag })))
}

/// `basic.get`: synchronous pop past the dispatch loop.
pub(crate) fn get(broker: &Broker, channel: &Channel, get: BasicGet) -> MethodResponse {
    let queue: Queue = channel
        .vhost
        .queue(&get.queue)
        .ok_or(ChannelException::NotFound)?;
    queue.ensure_usable_from(channel.connection.id)?;

    let Some(queued) = queue.messages.try_get() else {
        return Ok(Some(Method::BasicGetEmpty(BasicGetEmpty)));
    };

    let redelivered = queued.redelivered();
    let delivery_tag = {
        let mut state = channel.state();
        let tag = state.next_delivery_tag();
        if !get.no_ack {
            state.record_delivery(
                tag,
                UnackedDelivery {
                    queue: queue.clone(),
                    message: queued.message.clone(),
                    delivery_count: queued.delivery_count + 1,
                    consumer: None,
                },
            );
        }
        tag
    };

    if get.no_ack && queue.durable && queued.message.is_persistent() {
        broker
            .stores()
            .messages
            .del_queue_ref(channel.vhost.name.as_str(), &queue.name, queued.message.id)
            .map_err(|_| ChannelException::InternalError)?;
    }

    let reply = Method::BasicGetOk(BasicGetOk {
        delivery_tag,
        redelivered,
        exchange: queued.message.exchange.clone(),
        routing_key: queued.message.routing_key.clone(),
        message_count: u32::try_from(queue.length()).unwrap_or(u32::MAX),
    });
    channel
        .event_sender
        .try_send(ConnectionEvent::MethodContent(
            channel.num,
            Box::new(reply),
            content_header_for(&queued.message),
            queued.message.body.clone(),
        ))
        .map_err(|_| ConException::InternalError)?;
    Ok(None)
}

pub(crate) fn qos(channel: &Channel, qos: BasicQos) -> MethodResponse {
    let queues: Vec<Queue> = {
        let mut state = channel.state();
        if qos.global {
            state.prefetch_count = qos.prefetch_count;
            state.prefetch_size = qos.prefetch_size;
        } else {
            state.consumer_prefetch_count = qos.prefetch_count;
            state.consumer_prefetch_size = qos.prefetch_size;
        }
        state.consumers.values().map(|c| c.queue.clone()).collect()
    };

    // a raised window may unblock parked dispatchers
    for queue in queues {
        queue.wake();
    }

    Ok(Some(Method::BasicQosOk(BasicQosOk)))
}
