use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use warren_core::methods::Table;

use crate::{tables, KvStore};

/// Persisted form of a durable exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExchange {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: Table,
}

/// Persisted form of a durable queue. Exclusive queues are never stored;
/// they die with their connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredQueue {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: Table,
}

/// Persisted form of a binding between two durable endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub arguments: Table,
}

impl StoredBinding {
    fn key(&self, vhost: &str) -> String {
        format!(
            "{vhost}/{}/{}/{}/{:016x}",
            self.exchange,
            self.queue,
            self.routing_key,
            args_fingerprint(&self.arguments)
        )
    }
}

/// Distinguishes bindings that differ only in their arguments (headers
/// exchanges). Canonicalized through a sorted JSON rendering.
fn args_fingerprint(arguments: &Table) -> u64 {
    let sorted: BTreeMap<&String, &warren_core::methods::FieldValue> = arguments.iter().collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

/// Durable topology, mirrored on declare/bind and erased on delete/unbind.
#[derive(Clone)]
pub struct TopologyStore {
    kv: Arc<dyn KvStore>,
}

impl TopologyStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn put_exchange(&self, vhost: &str, exchange: &StoredExchange) -> crate::Result<()> {
        let raw = serde_json::to_vec(exchange)?;
        self.kv
            .put(tables::EXCHANGES, &format!("{vhost}/{}", exchange.name), &raw)
    }

    pub fn delete_exchange(&self, vhost: &str, name: &str) -> crate::Result<()> {
        self.kv.delete(tables::EXCHANGES, &format!("{vhost}/{name}"))
    }

    pub fn exchanges(&self, vhost: &str) -> crate::Result<Vec<StoredExchange>> {
        self.kv
            .iter_prefix(tables::EXCHANGES, &format!("{vhost}/"))?
            .iter()
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Into::into))
            .collect()
    }

    pub fn put_queue(&self, vhost: &str, queue: &StoredQueue) -> crate::Result<()> {
        let raw = serde_json::to_vec(queue)?;
        self.kv
            .put(tables::QUEUES, &format!("{vhost}/{}", queue.name), &raw)
    }

    pub fn delete_queue(&self, vhost: &str, name: &str) -> crate::Result<()> {
        self.kv.delete(tables::QUEUES, &format!("{vhost}/{name}"))
    }

    pub fn queues(&self, vhost: &str) -> crate::Result<Vec<StoredQueue>> {
        self.kv
            .iter_prefix(tables::QUEUES, &format!("{vhost}/"))?
            .iter()
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Into::into))
            .collect()
    }

    pub fn put_binding(&self, vhost: &str, binding: &StoredBinding) -> crate::Result<()> {
        let raw = serde_json::to_vec(binding)?;
        self.kv.put(tables::BINDINGS, &binding.key(vhost), &raw)
    }

    pub fn delete_binding(&self, vhost: &str, binding: &StoredBinding) -> crate::Result<()> {
        self.kv.delete(tables::BINDINGS, &binding.key(vhost))
    }

    pub fn bindings(&self, vhost: &str) -> crate::Result<Vec<StoredBinding>> {
        self.kv
            .iter_prefix(tables::BINDINGS, &format!("{vhost}/"))?
            .iter()
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use warren_core::methods::{FieldValue, Table};

    use super::{StoredBinding, StoredExchange, StoredQueue, TopologyStore};
    use crate::MemoryKv;

    fn store() -> TopologyStore {
        TopologyStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn exchange_round_trip() {
        let topology = store();
        let exchange = StoredExchange {
            name: "logs".to_owned(),
            kind: "fanout".to_owned(),
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: Table::new(),
        };

        topology.put_exchange("/", &exchange).unwrap();
        assert_eq!(topology.exchanges("/").unwrap(), vec![exchange]);

        topology.delete_exchange("/", "logs").unwrap();
        assert!(topology.exchanges("/").unwrap().is_empty());
    }

    #[test]
    fn vhosts_are_isolated() {
        let topology = store();
        let queue = StoredQueue {
            name: "jobs".to_owned(),
            durable: true,
            auto_delete: false,
            arguments: Table::new(),
        };

        topology.put_queue("/", &queue).unwrap();
        assert_eq!(topology.queues("/").unwrap().len(), 1);
        assert!(topology.queues("other").unwrap().is_empty());
    }

    #[test]
    fn bindings_differing_only_in_arguments_coexist() {
        let topology = store();
        let mut args = Table::new();
        args.insert("format".to_owned(), FieldValue::LongString("pdf".to_owned()));

        let plain = StoredBinding {
            exchange: "docs".to_owned(),
            queue: "all".to_owned(),
            routing_key: "".to_owned(),
            arguments: Table::new(),
        };
        let with_args = StoredBinding {
            arguments: args,
            ..plain.clone()
        };

        topology.put_binding("/", &plain).unwrap();
        topology.put_binding("/", &with_args).unwrap();
        assert_eq!(topology.bindings("/").unwrap().len(), 2);

        topology.delete_binding("/", &plain).unwrap();
        assert_eq!(topology.bindings("/").unwrap(), vec![with_args]);
    }
}
