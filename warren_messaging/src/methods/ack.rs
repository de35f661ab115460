//! The acknowledgement path: ack, nack, reject and recover, plus the
//! settlement bookkeeping shared with channel teardown.

use tracing::error;
use warren_core::{
    connection::{AckOutcome, Channel, ChannelMode, PendingAck, UnackedDelivery},
    error::ChannelException,
    method_unsupported,
    methods::{
        BasicAck, BasicNack, BasicRecover, BasicRecoverOk, BasicReject, DeliveryTag, Method,
    },
    queue::{Queue, QueuedMessage},
    vhost::Vhost,
};

use crate::{methods::MethodResponse, server::Broker};

pub(crate) fn ack(broker: &Broker, channel: &Channel, ack: BasicAck) -> MethodResponse {
    settle(broker, channel, ack.delivery_tag, ack.multiple, AckOutcome::Ack)
}

pub(crate) fn nack(broker: &Broker, channel: &Channel, nack: BasicNack) -> MethodResponse {
    let outcome = if nack.requeue {
        AckOutcome::Requeue
    } else {
        AckOutcome::Drop
    };
    settle(broker, channel, nack.delivery_tag, nack.multiple, outcome)
}

pub(crate) fn reject(broker: &Broker, channel: &Channel, reject: BasicReject) -> MethodResponse {
    let outcome = if reject.requeue {
        AckOutcome::Requeue
    } else {
        AckOutcome::Drop
    };
    settle(broker, channel, reject.delivery_tag, false, outcome)
}

/// `basic.recover`: puts every outstanding delivery of the channel back on
/// its queue. Redelivering to the same consumer (`requeue=false`) is not
/// supported.
pub(crate) fn recover(broker: &Broker, channel: &Channel, recover: BasicRecover) -> MethodResponse {
    if !recover.requeue {
        method_unsupported!();
    }

    let outstanding = channel.state().take_all_unacked();
    requeue_deliveries(broker, &channel.vhost, outstanding)?;
    Ok(Some(Method::BasicRecoverOk(BasicRecoverOk)))
}

fn settle(
    broker: &Broker,
    channel: &Channel,
    delivery_tag: DeliveryTag,
    multiple: bool,
    outcome: AckOutcome,
) -> MethodResponse {
    let mut state = channel.state();

    if matches!(state.mode, ChannelMode::Tx(_)) {
        // validate now, apply at commit
        let known = (multiple && delivery_tag == 0) || state.unacked.contains_key(&delivery_tag);
        if !known {
            return Err(ChannelException::PreconditionFailed.into());
        }
        if let ChannelMode::Tx(tx) = &mut state.mode {
            tx.pending_acks.push(PendingAck {
                delivery_tag,
                multiple,
                outcome,
            });
        }
        return Ok(None);
    }

    let settled = state.take_settled(delivery_tag, multiple)?;
    drop(state);

    apply_settlement(broker, &channel.vhost, settled, outcome)?;
    Ok(None)
}

/// Applies a settlement outcome outside any channel lock. Prefetch windows
/// open before the queues are woken, so dispatch sees the new budget.
pub(crate) fn apply_settlement(
    broker: &Broker,
    vhost: &Vhost,
    entries: Vec<(DeliveryTag, UnackedDelivery)>,
    outcome: AckOutcome,
) -> crate::Result<()> {
    if let AckOutcome::Requeue = outcome {
        return requeue_deliveries(broker, vhost, entries);
    }

    for (_, delivery) in entries {
        if let Some(consumer) = &delivery.consumer {
            consumer.record_settlement(delivery.message.body_size());
        }
        if delivery.queue.durable && delivery.message.is_persistent() {
            broker
                .stores()
                .messages
                .del_queue_ref(vhost.name.as_str(), &delivery.queue.name, delivery.message.id)
                .map_err(|err| {
                    error!(%err, "Failed to drop storage ref of settled delivery");
                    ChannelException::InternalError
                })?;
        }
        delivery.queue.wake();
    }
    Ok(())
}

/// Puts settled deliveries back at the head of their queues, preserving the
/// original FIFO order within this one operation.
pub(crate) fn requeue_deliveries(
    broker: &Broker,
    vhost: &Vhost,
    entries: Vec<(DeliveryTag, UnackedDelivery)>,
) -> crate::Result<()> {
    // entries ascend by delivery tag, which is original delivery order
    let mut by_queue: Vec<(Queue, Vec<QueuedMessage>)> = Vec::new();

    for (_, delivery) in entries {
        let UnackedDelivery {
            queue,
            message,
            delivery_count,
            consumer,
        } = delivery;

        if let Some(consumer) = &consumer {
            consumer.record_settlement(message.body_size());
        }
        if queue.durable && message.is_persistent() {
            // keep this queue's stored redelivery counter current
            broker
                .stores()
                .messages
                .update_queue_ref(vhost.name.as_str(), &queue.name, message.id, delivery_count)
                .map_err(|err| {
                    error!(%err, "Failed to update stored queue ref on requeue");
                    ChannelException::InternalError
                })?;
        }

        let queued = QueuedMessage {
            message,
            delivery_count,
        };
        match by_queue.iter().position(|(q, _)| q.id == queue.id) {
            Some(idx) => by_queue[idx].1.push(queued),
            None => by_queue.push((queue, vec![queued])),
        }
    }

    for (queue, batch) in by_queue {
        queue.messages.requeue_all(batch);
        queue.wake();
    }
    Ok(())
}
