use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::RwLock;

use crate::{methods::Table, name_newtype, queue::QueueName};

/// One parsed word of a topic binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSegment {
    Word(String),
    /// `*`, exactly one word.
    SingleWildcard,
    /// `#`, zero or more words.
    MultiWildcard,
}

pub fn parse_topic_pattern(pattern: &str) -> Vec<TopicSegment> {
    pattern
        .split('.')
        .map(|segment| match segment {
            "*" => TopicSegment::SingleWildcard,
            "#" => TopicSegment::MultiWildcard,
            word => TopicSegment::Word(word.to_owned()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    Direct,
    /// Routes to every bound queue, key ignored.
    Fanout,
    /// Routes on `.`-separated patterns with `*`/`#` wildcards.
    Topic,
    /// Routes on message header values against binding arguments.
    Headers,
}

impl ExchangeKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "direct" => Some(ExchangeKind::Direct),
            "fanout" => Some(ExchangeKind::Fanout),
            "topic" => Some(ExchangeKind::Topic),
            "headers" => Some(ExchangeKind::Headers),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

name_newtype!(pub ExchangeName);

/// A routing rule from an exchange to a queue, held by value. Queues are
/// referenced by name and resolved through the vhost registry at publish
/// time, so no entity points back at another.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub queue: QueueName,
    pub routing_key: String,
    pub arguments: Table,
    /// Pre-parsed routing key, populated for topic exchanges.
    pub pattern: Vec<TopicSegment>,
}

impl Binding {
    pub fn new(kind: ExchangeKind, queue: QueueName, routing_key: String, arguments: Table) -> Self {
        let pattern = match kind {
            ExchangeKind::Topic => parse_topic_pattern(&routing_key),
            _ => Vec::new(),
        };
        Self {
            queue,
            routing_key,
            arguments,
            pattern,
        }
    }

    /// Bindings are identified by the full (queue, key, arguments) tuple.
    fn same_tuple(&self, queue: &str, routing_key: &str, arguments: &Table) -> bool {
        self.queue.as_str() == queue
            && self.routing_key == routing_key
            && &self.arguments == arguments
    }
}

pub type Exchange = Arc<ExchangeInner>;

#[derive(Debug)]
pub struct ExchangeInner {
    pub name: ExchangeName,
    pub kind: ExchangeKind,
    pub durable: bool,
    /// Whether the exchange deletes itself once its last binding is removed,
    /// provided it was bound at least once.
    pub auto_delete: bool,
    /// Internal exchanges refuse direct publishes from clients.
    pub internal: bool,
    pub arguments: Table,
    bindings: RwLock<Vec<Binding>>,
    bound_at_least_once: AtomicBool,
}

impl ExchangeInner {
    pub fn new(
        name: ExchangeName,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        arguments: Table,
    ) -> Exchange {
        Arc::new(Self {
            name,
            kind,
            durable,
            auto_delete,
            internal,
            arguments,
            bindings: RwLock::new(Vec::new()),
            bound_at_least_once: AtomicBool::new(false),
        })
    }

    /// Snapshot of the current bindings, taken under the read lock.
    pub fn bindings(&self) -> Vec<Binding> {
        self.bindings.read().clone()
    }

    pub fn has_bindings(&self) -> bool {
        !self.bindings.read().is_empty()
    }

    /// Adds a binding. Re-binding the identical tuple is a no-op; returns
    /// whether the binding was actually inserted.
    pub fn bind(&self, binding: Binding) -> bool {
        let mut bindings = self.bindings.write();
        if bindings
            .iter()
            .any(|b| b.same_tuple(&binding.queue, &binding.routing_key, &binding.arguments))
        {
            return false;
        }
        bindings.push(binding);
        self.bound_at_least_once.store(true, Ordering::Release);
        true
    }

    /// Removes the binding with the given tuple; returns whether it existed.
    pub fn unbind(&self, queue: &str, routing_key: &str, arguments: &Table) -> bool {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| !b.same_tuple(queue, routing_key, arguments));
        bindings.len() != before
    }

    /// Drops every binding towards `queue`; returns the removed bindings.
    pub fn remove_bindings_for_queue(&self, queue: &str) -> Vec<Binding> {
        let mut bindings = self.bindings.write();
        let mut removed = Vec::new();
        bindings.retain(|b| {
            if b.queue.as_str() == queue {
                removed.push(b.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn was_bound(&self) -> bool {
        self.bound_at_least_once.load(Ordering::Acquire)
    }

    /// Auto-delete fires only for exchanges that lost their last binding
    /// after having had one.
    pub fn ready_for_auto_delete(&self) -> bool {
        self.auto_delete && self.was_bound() && !self.has_bindings()
    }
}

/// Reserved names: the default (nameless) exchange and the `amq.` namespace.
pub fn is_reserved_exchange_name(name: &str) -> bool {
    name.is_empty() || name.starts_with("amq.")
}

/// The exchanges every vhost starts with: the default direct exchange and
/// one pre-declared exchange per type in the `amq.` namespace.
pub fn default_exchanges() -> Vec<Exchange> {
    let server_exchange = |name: &str, kind| {
        ExchangeInner::new(
            ExchangeName::new(name),
            kind,
            true,
            false,
            false,
            Table::new(),
        )
    };

    vec![
        server_exchange("", ExchangeKind::Direct),
        server_exchange("amq.direct", ExchangeKind::Direct),
        server_exchange("amq.fanout", ExchangeKind::Fanout),
        server_exchange("amq.topic", ExchangeKind::Topic),
        server_exchange("amq.headers", ExchangeKind::Headers),
    ]
}
