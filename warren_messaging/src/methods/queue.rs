use std::ops::Not;

use warren_core::{
    connection::Channel,
    error::ChannelException,
    methods::{
        Method, QueueBind, QueueBindOk, QueueDeclare, QueueDeclareOk, QueueDelete, QueueDeleteOk,
        QueuePurge, QueuePurgeOk, QueueUnbind, QueueUnbindOk,
    },
    queue::Queue,
};

use crate::{methods::MethodResponse, server::Broker, topology};

pub(crate) fn declare(broker: &Broker, channel: &Channel, declare: QueueDeclare) -> MethodResponse {
    if declare.passive {
        // 1.7.2.2 - passive declare only asserts existence, it never mutates
        let queue = channel
            .vhost
            .queue(&declare.queue)
            .ok_or(ChannelException::NotFound)?;
        queue.ensure_usable_from(channel.connection.id)?;
        return declare_ok(declare.no_wait, &queue);
    }

    let queue = topology::declare_queue(broker, &channel.connection, &declare)?;
    declare_ok(declare.no_wait, &queue)
}

fn declare_ok(no_wait: bool, queue: &Queue) -> MethodResponse {
    Ok(no_wait.not().then(|| {
        Method::QueueDeclareOk(QueueDeclareOk {
            queue: queue.name.to_string(),
            message_count: u32::try_from(queue.length()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(queue.consumer_count()).unwrap_or(u32::MAX),
        })
    }))
}

pub(crate) fn bind(broker: &Broker, channel: &Channel, bind: QueueBind) -> MethodResponse {
    topology::bind_queue(&channel.vhost, broker.stores(), channel.connection.id, &bind)?;
    Ok(bind.no_wait.not().then(|| Method::QueueBindOk(QueueBindOk)))
}

pub(crate) fn unbind(broker: &Broker, channel: &Channel, unbind: QueueUnbind) -> MethodResponse {
    topology::unbind_queue(&channel.vhost, broker.stores(), channel.connection.id, &unbind)?;
    Ok(Some(Method::QueueUnbindOk(QueueUnbindOk)))
}

pub(crate) fn purge(broker: &Broker, channel: &Channel, purge: QueuePurge) -> MethodResponse {
    let queue = channel
        .vhost
        .queue(&purge.queue)
        .ok_or(ChannelException::NotFound)?;
    queue.ensure_usable_from(channel.connection.id)?;

    let message_count = topology::purge_queue(&channel.vhost, broker.stores(), &queue)?;
    Ok(purge
        .no_wait
        .not()
        .then(|| Method::QueuePurgeOk(QueuePurgeOk { message_count })))
}

pub(crate) fn delete(broker: &Broker, channel: &Channel, delete: QueueDelete) -> MethodResponse {
    let queue = channel
        .vhost
        .queue(&delete.queue)
        .ok_or(ChannelException::NotFound)?;
    queue.ensure_usable_from(channel.connection.id)?;

    let message_count = topology::delete_queue(
        &channel.vhost,
        broker.stores(),
        &queue,
        delete.if_unused,
        delete.if_empty,
    )?;
    Ok(delete
        .no_wait
        .not()
        .then(|| Method::QueueDeleteOk(QueueDeleteOk { message_count })))
}
