use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::{
    exchange::{default_exchanges, Exchange, ExchangeName},
    message::MessageId,
    name_newtype,
    queue::{Queue, QueueName},
};

name_newtype!(pub VhostName);

pub type Vhost = Arc<VhostInner>;

/// An isolated namespace of exchanges, queues and bindings.
///
/// Structural mutations (declare/delete) take the registry write locks;
/// lookups take read locks. The locks are never held across storage calls
/// or awaits.
#[derive(Debug)]
pub struct VhostInner {
    pub name: VhostName,
    exchanges: RwLock<HashMap<ExchangeName, Exchange>>,
    queues: RwLock<HashMap<QueueName, Queue>>,
    next_message_id: AtomicU64,
}

impl VhostInner {
    pub fn new(name: VhostName) -> Vhost {
        let exchanges = default_exchanges()
            .into_iter()
            .map(|exchange| (exchange.name.clone(), exchange))
            .collect();

        Arc::new(Self {
            name,
            exchanges: RwLock::new(exchanges),
            queues: RwLock::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
        })
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.exchanges.read().get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.queues.read().get(name).cloned()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.read().values().cloned().collect()
    }

    pub fn queues(&self) -> Vec<Queue> {
        self.queues.read().values().cloned().collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.read().len()
    }

    /// Registers a queue. Returns the existing queue instead if the name is
    /// already taken, so concurrent declares converge on one instance.
    pub fn insert_queue(&self, queue: Queue) -> Result<Queue, Queue> {
        let mut queues = self.queues.write();
        match queues.get(queue.name.as_str()) {
            Some(existing) => Err(existing.clone()),
            None => {
                queues.insert(queue.name.clone(), queue.clone());
                Ok(queue)
            }
        }
    }

    pub fn remove_queue(&self, name: &str) -> Option<Queue> {
        self.queues.write().remove(name)
    }

    pub fn insert_exchange(&self, exchange: Exchange) -> Result<Exchange, Exchange> {
        let mut exchanges = self.exchanges.write();
        match exchanges.get(exchange.name.as_str()) {
            Some(existing) => Err(existing.clone()),
            None => {
                exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(exchange)
            }
        }
    }

    pub fn remove_exchange(&self, name: &str) -> Option<Exchange> {
        self.exchanges.write().remove(name)
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Moves the id counter past ids seen in storage, so recovered and new
    /// messages never collide.
    pub fn bump_message_id_floor(&self, seen: u64) {
        self.next_message_id.fetch_max(seen + 1, Ordering::Relaxed);
    }
}
