use std::time::Duration;

use tracing::{debug, info, warn};
use warren_core::{
    connection::{ConnectionEvent, ContentHeader},
    consumer::Consumer,
    message::Message,
    methods::{class, BasicDeliver, DeliveryTag, Method},
    queue::{Queue, QueueEvent, QueueEventReceiver, QueuedMessage},
    vhost::Vhost,
};

use crate::{channel, server::Stores, topology};

/// The dispatch task owned by one queue.
///
/// It alone pops messages for consumer delivery: it drains the FIFO while
/// some consumer can take a message, then parks on the event channel until
/// a push, an ack, a consumer change or shutdown wakes it up.
pub(crate) struct QueueTask {
    queue: Queue,
    vhost: Vhost,
    stores: Stores,
    event_recv: QueueEventReceiver,
    auto_delete_grace: Duration,
}

struct ClaimedDelivery {
    consumer: Consumer,
    queued: QueuedMessage,
    delivery_tag: DeliveryTag,
    redelivered: bool,
}

pub(crate) fn content_header_for(message: &Message) -> ContentHeader {
    ContentHeader {
        class_id: class::BASIC,
        weight: 0,
        body_size: message.body_size(),
        properties: message.properties.clone(),
    }
}

impl QueueTask {
    pub(crate) fn new(
        queue: Queue,
        vhost: Vhost,
        stores: Stores,
        event_recv: QueueEventReceiver,
        auto_delete_grace: Duration,
    ) -> Self {
        Self {
            queue,
            vhost,
            stores,
            event_recv,
            auto_delete_grace,
        }
    }

    #[tracing::instrument(skip(self), fields(queue = %self.queue.name))]
    pub(crate) async fn start(mut self) {
        info!("Started queue dispatch task");

        loop {
            self.drain_deliveries().await;

            // Events coalesce when the channel is full, so the conditions
            // they signal are re-checked here rather than trusted per-event.
            if self.queue.state().shutting_down {
                break;
            }
            if self.queue.ready_for_auto_delete() {
                self.maybe_auto_delete().await;
                continue;
            }

            match self.event_recv.recv().await {
                Some(QueueEvent::Wake | QueueEvent::ConsumerCancelled) => {}
                Some(QueueEvent::Shutdown) | None => break,
            }
        }

        debug!("Queue dispatch task finished");
    }

    async fn drain_deliveries(&mut self) {
        while let Some(delivery) = self.claim_next() {
            self.deliver(delivery).await;
        }
    }

    /// One round-robin pass: pops the head message and offers it to the
    /// consumers starting at the cursor. The first whose channel accepts the
    /// claim wins and the cursor moves past it. If nobody is eligible the
    /// message goes back to the head and the task parks.
    fn claim_next(&self) -> Option<ClaimedDelivery> {
        let (consumers, cursor) = {
            let state = self.queue.state();
            if state.shutting_down || state.consumers.is_empty() {
                return None;
            }
            (state.consumers.clone(), state.cursor)
        };

        let queued = self.queue.messages.try_get()?;

        for step in 0..consumers.len() {
            let idx = (cursor + step) % consumers.len();
            let consumer = &consumers[idx];
            if let Some(delivery_tag) = channel::try_claim(consumer, &queued) {
                self.queue.state().cursor = (idx + 1) % consumers.len();
                let redelivered = queued.redelivered();
                return Some(ClaimedDelivery {
                    consumer: consumer.clone(),
                    queued,
                    delivery_tag,
                    redelivered,
                });
            }
        }

        self.queue.messages.requeue(queued);
        None
    }

    async fn deliver(&self, delivery: ClaimedDelivery) {
        let ClaimedDelivery {
            consumer,
            queued,
            delivery_tag,
            redelivered,
        } = delivery;

        let method = Box::new(Method::BasicDeliver(BasicDeliver {
            consumer_tag: consumer.tag.clone(),
            delivery_tag,
            redelivered,
            exchange: queued.message.exchange.clone(),
            routing_key: queued.message.routing_key.clone(),
        }));
        let header = content_header_for(&queued.message);
        let body = queued.message.body.clone();

        let sent = consumer
            .channel
            .event_sender
            .send(ConnectionEvent::MethodContent(
                consumer.channel.num,
                method,
                header,
                body,
            ))
            .await;

        match sent {
            Ok(()) => {
                if consumer.no_ack && self.queue.durable && queued.message.is_persistent() {
                    // settled on delivery, the stored copy is no longer needed
                    if let Err(err) = self.stores.messages.del_queue_ref(
                        self.vhost.name.as_str(),
                        &self.queue.name,
                        queued.message.id,
                    ) {
                        warn!(%err, "Failed to drop storage ref of a no-ack delivery");
                    }
                }
            }
            Err(_) => {
                // the connection is gone; put the message back for others,
                // with its pre-claim delivery count
                channel::undo_claim(&consumer, delivery_tag);
                self.queue.messages.requeue(queued);
            }
        }
    }

    /// Runs the auto-delete grace period after a consumer cancel. The queue
    /// is only removed if it is still consumer-less when the grace expires.
    async fn maybe_auto_delete(&mut self) {
        if !self.queue.ready_for_auto_delete() {
            return;
        }

        tokio::time::sleep(self.auto_delete_grace).await;

        if !self.queue.ready_for_auto_delete() {
            return;
        }

        info!("Removing auto-delete queue after its last consumer left");
        if let Err(err) = topology::delete_queue_unchecked(&self.vhost, &self.stores, &self.queue) {
            warn!(%err, "Failed to auto-delete queue");
        }
    }
}
