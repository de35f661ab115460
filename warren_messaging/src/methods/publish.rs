//! Publish assembly and routing: `basic.publish` followed by a content
//! header and body frames, then fan-out through the exchange to the target
//! queues, honoring confirm and tx modes.

use std::cmp::Ordering;

use bytes::Bytes;
use tracing::{debug, error};
use warren_core::{
    connection::{Channel, ChannelMode, ConnectionEvent, ContentHeader, PublishAssembly},
    error::{ChannelException, ConException, ProtocolError},
    message::{Message, MessageInner},
    methods::{class, BasicAck, BasicNack, BasicPublish, BasicReturn, Method},
    queue::{Queue, QueuedMessage},
    vhost::Vhost,
    SingleVec,
};

use crate::{methods::MethodResponse, queue_worker::content_header_for, routing, server::Broker};

/// `basic.return` reply code for an unroutable mandatory message.
const REPLY_NO_ROUTE: u16 = 312;

/// `basic.publish`: starts content assembly on the channel.
pub(crate) fn start(channel: &Channel, publish: BasicPublish) -> MethodResponse {
    if publish.immediate {
        // deprecated in 0-9-1, clients must not rely on it
        return Err(ConException::NotImplemented("the immediate publish flag").into());
    }

    // surface routing problems before accepting the body
    let exchange = channel
        .vhost
        .exchange(&publish.exchange)
        .ok_or(ChannelException::NotFound)?;
    if exchange.internal {
        return Err(ChannelException::AccessRefused.into());
    }

    channel.state().assembly = PublishAssembly::HaveMethod(publish);
    Ok(None)
}

/// The content header following `basic.publish`.
pub(crate) fn content_header(
    broker: &Broker,
    channel: &Channel,
    header: ContentHeader,
) -> crate::Result<()> {
    let ready = {
        let mut state = channel.state();
        match state.assembly.take() {
            PublishAssembly::HaveMethod(publish) => {
                if header.class_id != class::BASIC {
                    return Err(ConException::UnexpectedFrame.into());
                }
                if header.body_size == 0 {
                    Some((publish, header, SingleVec::new()))
                } else {
                    state.assembly = PublishAssembly::HaveHeader { publish, header };
                    None
                }
            }
            _ => return Err(ConException::UnexpectedFrame.into()),
        }
    };

    match ready {
        Some((publish, header, body)) => finish(broker, channel, publish, header, body),
        None => Ok(()),
    }
}

/// One content body frame. The message completes once the accumulated
/// length reaches the size announced in the header.
pub(crate) fn content_body(broker: &Broker, channel: &Channel, chunk: Bytes) -> crate::Result<()> {
    let ready = {
        let mut state = channel.state();
        let (publish, header, mut body, received) = match state.assembly.take() {
            PublishAssembly::HaveHeader { publish, header } => {
                (publish, header, SingleVec::new(), 0)
            }
            PublishAssembly::Accumulating {
                publish,
                header,
                body,
                received,
            } => (publish, header, body, received),
            _ => return Err(ConException::UnexpectedFrame.into()),
        };

        let received = received + chunk.len() as u64;
        body.push(chunk);

        match received.cmp(&header.body_size) {
            Ordering::Less => {
                state.assembly = PublishAssembly::Accumulating {
                    publish,
                    header,
                    body,
                    received,
                };
                None
            }
            Ordering::Equal => Some((publish, header, body)),
            Ordering::Greater => return Err(ConException::FrameError.into()),
        }
    };

    match ready {
        Some((publish, header, body)) => finish(broker, channel, publish, header, body),
        None => Ok(()),
    }
}

enum PublishPath {
    Direct,
    Confirm(u64),
}

fn finish(
    broker: &Broker,
    channel: &Channel,
    publish: BasicPublish,
    header: ContentHeader,
    body: SingleVec<Bytes>,
) -> crate::Result<()> {
    let message = MessageInner::new(
        channel.vhost.next_message_id(),
        publish.exchange,
        publish.routing_key,
        publish.mandatory,
        publish.immediate,
        header.properties,
        body,
    );
    debug!(id = %message.id, exchange = %message.exchange, routing_key = %message.routing_key, "Publishing message");

    let path = {
        let mut state = channel.state();
        match &mut state.mode {
            ChannelMode::Tx(tx) => {
                tx.pending_publishes.push(message);
                return Ok(());
            }
            ChannelMode::Confirm { next_publish_seq } => {
                let seq = *next_publish_seq;
                *next_publish_seq += 1;
                PublishPath::Confirm(seq)
            }
            ChannelMode::Normal => PublishPath::Direct,
        }
    };

    match path {
        PublishPath::Direct => route_and_deliver(broker, channel, &message),
        PublishPath::Confirm(seq) => match route_and_deliver(broker, channel, &message) {
            // the durable targets have committed by now, the confirm is truthful
            Ok(()) => send_to_client(
                channel,
                Method::BasicAck(BasicAck {
                    delivery_tag: seq,
                    multiple: false,
                }),
            ),
            Err(ProtocolError::ChannelException(ChannelException::InternalError)) => send_to_client(
                channel,
                Method::BasicNack(BasicNack {
                    delivery_tag: seq,
                    multiple: false,
                    requeue: false,
                }),
            ),
            Err(other) => Err(other),
        },
    }
}

/// Routes an assembled message: snapshot the bindings, resolve the target
/// queues through the vhost, persist if needed, push everywhere.
pub(crate) fn route_and_deliver(
    broker: &Broker,
    channel: &Channel,
    message: &Message,
) -> crate::Result<()> {
    let vhost = &channel.vhost;
    let exchange = vhost
        .exchange(&message.exchange)
        .ok_or(ChannelException::NotFound)?;
    if exchange.internal {
        return Err(ChannelException::AccessRefused.into());
    }

    let targets: Vec<Queue> = routing::route_message(&exchange, message)
        .iter()
        .filter_map(|name| vhost.queue(name))
        .collect();

    if targets.is_empty() {
        debug!(exchange = %message.exchange, routing_key = %message.routing_key, "Message is unroutable");
        if message.mandatory {
            return return_unroutable(channel, message);
        }
        return Ok(());
    }

    let persist = message.is_persistent() && targets.iter().any(|queue| queue.durable);
    if persist {
        broker
            .stores()
            .messages
            .add(vhost.name.as_str(), message)
            .map_err(|err| {
                error!(%err, "Failed to persist message payload");
                ProtocolError::from(ChannelException::InternalError)
            })?;
    }

    for queue in &targets {
        push_message(broker, vhost, queue, message)?;
    }

    if persist {
        // every durable target may have been shutting down concurrently
        broker
            .stores()
            .messages
            .release_if_unreferenced(vhost.name.as_str(), message.id)
            .map_err(|err| {
                error!(%err, "Failed to release unreferenced payload");
                ProtocolError::from(ChannelException::InternalError)
            })?;
    }
    Ok(())
}

/// Appends a message to one queue's FIFO, persisting the queue reference
/// first for durable targets. A queue that is already shutting down
/// silently discards the push.
fn push_message(
    broker: &Broker,
    vhost: &Vhost,
    queue: &Queue,
    message: &Message,
) -> crate::Result<()> {
    let state = queue.state();
    if state.shutting_down {
        return Ok(());
    }

    if queue.durable && message.is_persistent() {
        broker
            .stores()
            .messages
            .add_queue_ref(vhost.name.as_str(), &queue.name, message.id)
            .map_err(|err| {
                error!(%err, queue = %queue.name, "Failed to persist queue reference");
                ProtocolError::from(ChannelException::InternalError)
            })?;
    }
    queue.messages.append(QueuedMessage::fresh(message.clone()));
    drop(state);

    queue.wake();
    Ok(())
}

fn return_unroutable(channel: &Channel, message: &Message) -> crate::Result<()> {
    let method = Method::BasicReturn(BasicReturn {
        reply_code: REPLY_NO_ROUTE,
        reply_text: "NO_ROUTE".to_owned(),
        exchange: message.exchange.clone(),
        routing_key: message.routing_key.clone(),
    });
    channel
        .event_sender
        .try_send(ConnectionEvent::MethodContent(
            channel.num,
            Box::new(method),
            content_header_for(message),
            message.body.clone(),
        ))
        .map_err(|err| {
            error!(?err, "Failed to queue basic.return");
            ProtocolError::from(ConException::InternalError)
        })
}

fn send_to_client(channel: &Channel, method: Method) -> crate::Result<()> {
    channel
        .event_sender
        .try_send(ConnectionEvent::Method(channel.num, Box::new(method)))
        .map_err(|err| {
            error!(?err, "Failed to queue outbound method");
            ProtocolError::from(ConException::InternalError)
        })
}
