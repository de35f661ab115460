use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::{
    connection::ConnectionId,
    consumer::Consumer,
    error::ChannelException,
    message::Message,
    methods::{ConsumerTag, Table},
    name_newtype, newtype_id,
};

pub type Queue = Arc<QueueInner>;

/// Wakeup reasons for a queue's dispatch task.
#[derive(Debug)]
pub enum QueueEvent {
    /// Something changed that may make a delivery possible: a message was
    /// pushed, an ack freed prefetch budget, a consumer appeared or flow
    /// was re-enabled.
    Wake,
    /// A consumer went away; the task re-checks the auto-delete condition.
    ConsumerCancelled,
    Shutdown,
}

pub type QueueEventSender = mpsc::Sender<QueueEvent>;
pub type QueueEventReceiver = mpsc::Receiver<QueueEvent>;

newtype_id!(pub QueueId);

name_newtype!(pub QueueName);

/// One FIFO entry: the shared payload plus this queue's own delivery
/// bookkeeping. A message fanned out to several queues has an independent
/// count on each of them.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    /// Deliveries this queue has already made of this message.
    pub delivery_count: u32,
}

impl QueuedMessage {
    pub fn fresh(message: Message) -> Self {
        Self {
            message,
            delivery_count: 0,
        }
    }

    /// Whether the next delivery from this queue is a redelivery.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 0
    }
}

#[derive(Debug)]
pub struct QueueInner {
    pub id: QueueId,
    /// The visible name of the queue.
    pub name: QueueName,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// The connection owning this queue. All operations from other
    /// connections are refused, and the queue dies with the owner.
    pub exclusive_owner: Option<ConnectionId>,
    /// Whether the queue deletes itself once its last consumer is gone,
    /// provided it had a consumer at least once.
    pub auto_delete: bool,
    pub arguments: Table,
    pub messages: warren_datastructure::MessageQueue<QueuedMessage>,
    state: Mutex<QueueState>,
    event_send: QueueEventSender,
}

/// Consumer registry and lifecycle flags, all behind one lock.
#[derive(Debug, Default)]
pub struct QueueState {
    /// Registration order is dispatch order; `cursor` rotates through it.
    pub consumers: Vec<Consumer>,
    pub cursor: usize,
    pub exclusive_consumer: bool,
    pub consumed_at_least_once: bool,
    pub shutting_down: bool,
}

impl QueueInner {
    pub fn new(
        name: QueueName,
        durable: bool,
        exclusive_owner: Option<ConnectionId>,
        auto_delete: bool,
        arguments: Table,
        event_send: QueueEventSender,
    ) -> Queue {
        Arc::new(Self {
            id: QueueId::random(),
            name,
            durable,
            exclusive_owner,
            auto_delete,
            arguments,
            messages: warren_datastructure::MessageQueue::new(),
            state: Mutex::new(QueueState::default()),
            event_send,
        })
    }

    pub fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    pub fn length(&self) -> usize {
        self.messages.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Fails with 405 when `connection` is not the exclusive owner.
    pub fn ensure_usable_from(&self, connection: ConnectionId) -> Result<(), ChannelException> {
        match self.exclusive_owner {
            Some(owner) if owner != connection => Err(ChannelException::ResourceLocked),
            _ => Ok(()),
        }
    }

    pub fn add_consumer(&self, consumer: Consumer) {
        let mut state = self.state.lock();
        state.exclusive_consumer |= consumer.exclusive;
        state.consumers.push(consumer);
        state.consumed_at_least_once = true;
        drop(state);
        self.wake();
    }

    /// Unregisters a consumer and reports whether the auto-delete condition
    /// now holds.
    pub fn remove_consumer(&self, tag: &ConsumerTag) -> bool {
        let mut state = self.state.lock();
        if let Some(pos) = state.consumers.iter().position(|c| &c.tag == tag) {
            let removed = state.consumers.remove(pos);
            state.exclusive_consumer &= !removed.exclusive;
            if pos < state.cursor && state.cursor > 0 {
                state.cursor -= 1;
            }
            if !state.consumers.is_empty() {
                state.cursor %= state.consumers.len();
            } else {
                state.cursor = 0;
            }
        }
        let auto_delete_ready =
            self.auto_delete && state.consumers.is_empty() && state.consumed_at_least_once;
        drop(state);
        let _ = self.event_send.try_send(QueueEvent::ConsumerCancelled);
        auto_delete_ready
    }

    pub fn ready_for_auto_delete(&self) -> bool {
        let state = self.state.lock();
        self.auto_delete
            && state.consumers.is_empty()
            && state.consumed_at_least_once
            && !state.shutting_down
    }

    /// Nudges the dispatch task. Wakes coalesce, so a full event channel
    /// means a wakeup is already pending.
    pub fn wake(&self) {
        let _ = self.event_send.try_send(QueueEvent::Wake);
    }

    /// Marks the queue as going away and stops its dispatch task. Returns
    /// false if it was already shutting down.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down {
            return false;
        }
        state.shutting_down = true;
        drop(state);
        let _ = self.event_send.try_send(QueueEvent::Shutdown);
        true
    }
}
