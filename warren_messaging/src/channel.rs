//! Channel lifecycle and the claim half of dispatch: reserving prefetch
//! budget and a delivery tag for one message on one consumer.

use tracing::{info, warn};
use warren_core::{
    connection::{
        Channel, ChannelInner, ChannelNum, ChannelStatus, Connection, PublishAssembly,
        UnackedDelivery,
    },
    consumer::Consumer,
    error::ConException,
    methods::DeliveryTag,
    queue::QueuedMessage,
};

use crate::{methods::requeue_deliveries, server::Broker};

pub fn open_channel(broker: &Broker, connection: &Connection, num: ChannelNum) -> crate::Result<Channel> {
    if num.is_zero() {
        return Err(ConException::ChannelError.into());
    }

    let mut channels = connection.channels.lock();
    if channels.contains_key(&num) {
        return Err(ConException::ChannelError.into());
    }
    let channel = ChannelInner::new(num, connection.clone());
    channels.insert(num, channel.clone());
    drop(channels);

    broker
        .global()
        .lock()
        .channels
        .insert(channel.id, channel.clone());

    info!(%num, "Opened new channel");
    Ok(channel)
}

/// Tears a channel down: cancels its consumers, requeues everything it had
/// in flight and unregisters it. Safe to call more than once.
pub fn close_channel(broker: &Broker, channel: &Channel) {
    let (consumers, unacked) = {
        let mut state = channel.state();
        if state.status != ChannelStatus::Open {
            return;
        }
        state.status = ChannelStatus::Closing;
        state.assembly = PublishAssembly::Idle;
        (
            std::mem::take(&mut state.consumers),
            state.take_all_unacked(),
        )
    };

    for (tag, consumer) in consumers {
        consumer.queue.remove_consumer(&tag);
    }

    if let Err(err) = requeue_deliveries(broker, &channel.vhost, unacked) {
        warn!(%err, channel = %channel.num, "Failed to requeue in-flight deliveries");
    }

    channel.state().status = ChannelStatus::Closed;
    channel.connection.channels.lock().remove(&channel.num);
    broker.global().lock().channels.remove(&channel.id);
}

/// Handles `channel.flow`: a paused channel's consumers drop out of
/// dispatch until flow is re-enabled.
pub fn set_flow(channel: &Channel, active: bool) {
    let consumers: Vec<Consumer> = {
        let mut state = channel.state();
        state.flow_active = active;
        state.consumers.values().cloned().collect()
    };
    if active {
        for consumer in consumers {
            consumer.queue.wake();
        }
    }
}

/// Reserves one delivery on `consumer` if its channel is able to take it:
/// channel open, flow active, and (unless the consumer is no-ack) both the
/// channel-wide and the per-consumer prefetch windows have room.
///
/// On success the delivery tag is allocated and the unacked bookkeeping
/// already counts the message, so a crashing send must [`undo_claim`].
pub(crate) fn try_claim(consumer: &Consumer, queued: &QueuedMessage) -> Option<DeliveryTag> {
    if consumer.channel.connection.is_closing() {
        return None;
    }

    let mut state = consumer.channel.state();
    if state.status != ChannelStatus::Open || !state.flow_active {
        return None;
    }

    let body_size = queued.message.body_size();
    if !consumer.no_ack && (!state.fits_prefetch(body_size) || !consumer.fits_prefetch(body_size)) {
        return None;
    }

    let tag = state.next_delivery_tag();
    if !consumer.no_ack {
        state.record_delivery(
            tag,
            UnackedDelivery {
                queue: consumer.queue.clone(),
                message: queued.message.clone(),
                delivery_count: queued.delivery_count + 1,
                consumer: Some(consumer.clone()),
            },
        );
        consumer.record_delivery(body_size);
    }
    Some(tag)
}

/// Rolls back a claim whose delivery never reached the wire.
pub(crate) fn undo_claim(consumer: &Consumer, tag: DeliveryTag) {
    if consumer.no_ack {
        return;
    }
    let mut state = consumer.channel.state();
    if let Ok(settled) = state.take_settled(tag, false) {
        for (_, delivery) in settled {
            consumer.record_settlement(delivery.message.body_size());
        }
    }
}
