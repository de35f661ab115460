use std::{
    collections::HashMap,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use warren_core::message::{Message, MessageId, MessageInner, Properties};

use crate::{tables, KvStore};

/// Persisted form of a message payload. Delivery bookkeeping is per queue
/// and lives with the queue references, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<Bytes>,
}

impl StoredMessage {
    pub fn from_message(message: &MessageInner) -> Self {
        Self {
            id: message.id.0,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            properties: message.properties.clone(),
            body: message.body.iter().cloned().collect(),
        }
    }

    /// Rebuilds the live message. The mandatory/immediate publish flags are
    /// delivery-time concerns and do not survive the restart boundary.
    pub fn into_message(self) -> Message {
        MessageInner::new(
            MessageId(self.id),
            self.exchange,
            self.routing_key,
            false,
            false,
            self.properties,
            self.body.into_iter().collect(),
        )
    }
}

/// Durable message payloads plus the per-queue reference index that decides
/// when a payload may go away.
///
/// A payload is stored once per message and referenced once per durable
/// queue holding it; the blob is erased when the last reference is deleted.
/// Reference counts live in memory and are rebuilt from the `qrefs` table
/// during recovery.
#[derive(Clone)]
pub struct MessageStore {
    kv: Arc<dyn KvStore>,
    refs: Arc<Mutex<HashMap<String, HashMap<u64, usize>>>>,
}

fn message_key(vhost: &str, id: u64) -> String {
    format!("{vhost}/{id:020}")
}

fn qref_key(vhost: &str, queue: &str, id: u64) -> String {
    format!("{vhost}/{queue}/{id:020}")
}

fn id_from_key(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.parse().ok()
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            refs: Arc::default(),
        }
    }

    /// Persists the payload. Returns only after the engine committed, so a
    /// publisher confirm sent afterwards is truthful.
    pub fn add(&self, vhost: &str, message: &MessageInner) -> crate::Result<()> {
        let raw = serde_json::to_vec(&StoredMessage::from_message(message))?;
        let mut refs = self.refs.lock();
        self.kv
            .put(tables::MESSAGES, &message_key(vhost, message.id.0), &raw)?;
        refs.entry(vhost.to_owned())
            .or_default()
            .entry(message.id.0)
            .or_insert(0);
        Ok(())
    }

    /// Overwrites a stored payload in place. Skipped when the message is no
    /// longer referenced.
    pub fn update(&self, vhost: &str, message: &MessageInner) -> crate::Result<()> {
        let refs = self.refs.lock();
        let live = refs
            .get(vhost)
            .and_then(|ids| ids.get(&message.id.0))
            .is_some_and(|count| *count > 0);
        if !live {
            return Ok(());
        }
        let raw = serde_json::to_vec(&StoredMessage::from_message(message))?;
        self.kv
            .put(tables::MESSAGES, &message_key(vhost, message.id.0), &raw)
    }

    pub fn del(&self, vhost: &str, id: MessageId) -> crate::Result<()> {
        let mut refs = self.refs.lock();
        if let Some(ids) = refs.get_mut(vhost) {
            ids.remove(&id.0);
        }
        self.kv.delete(tables::MESSAGES, &message_key(vhost, id.0))
    }

    /// Records one queue's claim on a payload. The reference value carries
    /// the queue's own delivery count for the message, starting at zero.
    pub fn add_queue_ref(&self, vhost: &str, queue: &str, id: MessageId) -> crate::Result<()> {
        let mut refs = self.refs.lock();
        self.kv.put(
            tables::QREFS,
            &qref_key(vhost, queue, id.0),
            &serde_json::to_vec(&0u32)?,
        )?;
        *refs
            .entry(vhost.to_owned())
            .or_default()
            .entry(id.0)
            .or_insert(0) += 1;
        Ok(())
    }

    /// Re-records one queue's delivery count for a message it requeued.
    /// A reference that no longer exists (the queue was purged or deleted
    /// concurrently) is left alone.
    pub fn update_queue_ref(
        &self,
        vhost: &str,
        queue: &str,
        id: MessageId,
        delivery_count: u32,
    ) -> crate::Result<()> {
        let _refs = self.refs.lock();
        let key = qref_key(vhost, queue, id.0);
        if self.kv.get(tables::QREFS, &key)?.is_none() {
            return Ok(());
        }
        self.kv
            .put(tables::QREFS, &key, &serde_json::to_vec(&delivery_count)?)
    }

    /// Drops one queue's claim on a payload, erasing the payload itself
    /// once no queue references it anymore. Idempotent.
    pub fn del_queue_ref(&self, vhost: &str, queue: &str, id: MessageId) -> crate::Result<()> {
        let mut refs = self.refs.lock();
        self.kv
            .delete(tables::QREFS, &qref_key(vhost, queue, id.0))?;

        let remaining = match refs.get_mut(vhost).and_then(|ids| ids.get_mut(&id.0)) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            if let Some(ids) = refs.get_mut(vhost) {
                ids.remove(&id.0);
            }
            self.kv.delete(tables::MESSAGES, &message_key(vhost, id.0))?;
        }
        Ok(())
    }

    /// Erases a payload nothing ever referenced (e.g. a persistent publish
    /// that routed to no durable queue).
    pub fn release_if_unreferenced(&self, vhost: &str, id: MessageId) -> crate::Result<()> {
        let mut refs = self.refs.lock();
        let unreferenced = refs
            .get(vhost)
            .and_then(|ids| ids.get(&id.0))
            .map_or(true, |count| *count == 0);
        if unreferenced {
            if let Some(ids) = refs.get_mut(vhost) {
                ids.remove(&id.0);
            }
            self.kv.delete(tables::MESSAGES, &message_key(vhost, id.0))?;
        }
        Ok(())
    }

    /// The (id, delivery-count) pairs queued on `queue`, in original FIFO
    /// (= id) order.
    pub fn list_queue_refs(
        &self,
        vhost: &str,
        queue: &str,
    ) -> crate::Result<Vec<(MessageId, u32)>> {
        Ok(self
            .kv
            .iter_prefix(tables::QREFS, &format!("{vhost}/{queue}/"))?
            .iter()
            .filter_map(|(key, value)| {
                let id = id_from_key(key)?;
                let delivery_count = serde_json::from_slice(value).unwrap_or(0);
                Some((MessageId(id), delivery_count))
            })
            .collect())
    }

    /// Removes every reference a queue holds, e.g. on purge or delete.
    pub fn purge_queue_refs(&self, vhost: &str, queue: &str) -> crate::Result<()> {
        for (id, _) in self.list_queue_refs(vhost, queue)? {
            self.del_queue_ref(vhost, queue, id)?;
        }
        Ok(())
    }

    /// All payloads of a vhost, keyed by id.
    pub fn load_messages(&self, vhost: &str) -> crate::Result<HashMap<u64, Message>> {
        let mut messages = HashMap::new();
        for (key, raw) in self.kv.iter_prefix(tables::MESSAGES, &format!("{vhost}/"))? {
            match serde_json::from_slice::<StoredMessage>(&raw) {
                Ok(stored) => {
                    messages.insert(stored.id, stored.into_message());
                }
                Err(err) => warn!(%key, %err, "Skipping undecodable stored message"),
            }
        }
        Ok(messages)
    }

    /// Rebuilds the in-memory reference counts from the `qrefs` table and
    /// drops payloads no queue references anymore (e.g. a crash between the
    /// payload write and its first reference). Returns the highest message
    /// id seen, for the vhost's id counter.
    pub fn recover_ref_counts(&self, vhost: &str) -> crate::Result<u64> {
        let mut counts: HashMap<u64, usize> = HashMap::new();
        let mut max_id = 0;
        for (key, _) in self.kv.iter_prefix(tables::QREFS, &format!("{vhost}/"))? {
            if let Some(id) = id_from_key(&key) {
                *counts.entry(id).or_insert(0) += 1;
                max_id = max_id.max(id);
            }
        }
        for (key, _) in self.kv.iter_prefix(tables::MESSAGES, &format!("{vhost}/"))? {
            if let Some(id) = id_from_key(&key) {
                max_id = max_id.max(id);
                if !counts.contains_key(&id) {
                    warn!(%id, "Dropping stored payload without queue references");
                    self.kv.delete(tables::MESSAGES, &message_key(vhost, id))?;
                }
            }
        }
        self.refs.lock().insert(vhost.to_owned(), counts);
        Ok(max_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use warren_core::message::{MessageId, MessageInner, Properties, DELIVERY_MODE_PERSISTENT};

    use super::MessageStore;
    use crate::MemoryKv;

    fn persistent_message(id: u64) -> warren_core::message::Message {
        MessageInner::new(
            MessageId(id),
            "".to_owned(),
            "jobs".to_owned(),
            false,
            false,
            Properties {
                delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
                ..Properties::default()
            },
            [bytes::Bytes::from_static(b"payload")].into_iter().collect(),
        )
    }

    #[test]
    fn payload_lives_until_last_ref_is_gone() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let message = persistent_message(1);

        store.add("/", &message).unwrap();
        store.add_queue_ref("/", "a", message.id).unwrap();
        store.add_queue_ref("/", "b", message.id).unwrap();

        store.del_queue_ref("/", "a", message.id).unwrap();
        assert_eq!(store.load_messages("/").unwrap().len(), 1);

        store.del_queue_ref("/", "b", message.id).unwrap();
        assert!(store.load_messages("/").unwrap().is_empty());
    }

    #[test]
    fn unreferenced_payload_is_released() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let message = persistent_message(7);

        store.add("/", &message).unwrap();
        store.release_if_unreferenced("/", message.id).unwrap();
        assert!(store.load_messages("/").unwrap().is_empty());
    }

    #[test]
    fn queue_refs_keep_fifo_order() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        for id in [3, 1, 2] {
            let message = persistent_message(id);
            store.add("/", &message).unwrap();
            store.add_queue_ref("/", "jobs", message.id).unwrap();
        }

        let ids: Vec<u64> = store
            .list_queue_refs("/", "jobs")
            .unwrap()
            .into_iter()
            .map(|(id, _)| id.0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn delivery_counts_are_tracked_per_queue_ref() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let message = persistent_message(4);

        store.add("/", &message).unwrap();
        store.add_queue_ref("/", "a", message.id).unwrap();
        store.add_queue_ref("/", "b", message.id).unwrap();

        store.update_queue_ref("/", "a", message.id, 2).unwrap();

        let count_of = |queue: &str| {
            store.list_queue_refs("/", queue).unwrap()[0].1
        };
        assert_eq!(count_of("a"), 2);
        assert_eq!(count_of("b"), 0);

        // updating a reference that is gone must not resurrect it
        store.del_queue_ref("/", "b", message.id).unwrap();
        store.update_queue_ref("/", "b", message.id, 5).unwrap();
        assert!(store.list_queue_refs("/", "b").unwrap().is_empty());
    }

    #[test]
    fn ref_counts_survive_recovery() {
        let kv = Arc::new(MemoryKv::new());
        {
            let store = MessageStore::new(kv.clone());
            let message = persistent_message(5);
            store.add("/", &message).unwrap();
            store.add_queue_ref("/", "jobs", message.id).unwrap();
        }

        let store = MessageStore::new(kv);
        let max_id = store.recover_ref_counts("/").unwrap();
        assert_eq!(max_id, 5);

        store.del_queue_ref("/", "jobs", MessageId(5)).unwrap();
        assert!(store.load_messages("/").unwrap().is_empty());
    }
}
