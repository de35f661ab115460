//! Vhost-level structural operations: declaring and deleting exchanges and
//! queues, binding and unbinding, and replaying the durable topology at
//! boot. Durable mutations are mirrored to storage as they happen.

use tracing::{error, info, warn};
use warren_core::{
    connection::{Connection, ConnectionEvent, ConnectionId},
    consumer::Consumer,
    error::{ChannelException, ConException, ProtocolError},
    exchange::{
        is_reserved_exchange_name, Binding, Exchange, ExchangeInner, ExchangeKind, ExchangeName,
    },
    methods::{BasicCancel, ExchangeDeclare, Method, QueueBind, QueueDeclare, QueueUnbind, Table},
    queue::{Queue, QueueName, QueuedMessage},
    random_uuid,
    vhost::Vhost,
};
use warren_storage::{StoredBinding, StoredExchange, StoredQueue};

use crate::server::{Broker, Stores};

fn storage_err(err: warren_storage::StorageError) -> ProtocolError {
    error!(%err, "Storage failure");
    ChannelException::InternalError.into()
}

fn stored_exchange(exchange: &Exchange) -> StoredExchange {
    StoredExchange {
        name: exchange.name.to_string(),
        kind: exchange.kind.as_str().to_owned(),
        durable: exchange.durable,
        auto_delete: exchange.auto_delete,
        internal: exchange.internal,
        arguments: exchange.arguments.clone(),
    }
}

fn stored_queue(queue: &Queue) -> StoredQueue {
    StoredQueue {
        name: queue.name.to_string(),
        durable: queue.durable,
        auto_delete: queue.auto_delete,
        arguments: queue.arguments.clone(),
    }
}

fn stored_binding(exchange: &ExchangeName, binding: &Binding) -> StoredBinding {
    StoredBinding {
        exchange: exchange.to_string(),
        queue: binding.queue.to_string(),
        routing_key: binding.routing_key.clone(),
        arguments: binding.arguments.clone(),
    }
}

pub fn declare_exchange(
    vhost: &Vhost,
    stores: &Stores,
    declare: &ExchangeDeclare,
) -> crate::Result<Exchange> {
    if declare.passive {
        return vhost
            .exchange(&declare.exchange)
            .ok_or_else(|| ChannelException::NotFound.into());
    }

    if is_reserved_exchange_name(&declare.exchange) {
        return Err(ChannelException::AccessRefused.into());
    }
    let kind = ExchangeKind::parse(&declare.kind).ok_or(ConException::CommandInvalid)?;

    if let Some(existing) = vhost.exchange(&declare.exchange) {
        ensure_exchange_equivalent(&existing, kind, declare)?;
        return Ok(existing);
    }

    info!(exchange = %declare.exchange, kind = %declare.kind, "Creating exchange");
    let exchange = ExchangeInner::new(
        ExchangeName::new(declare.exchange.as_str()),
        kind,
        declare.durable,
        declare.auto_delete,
        declare.internal,
        declare.arguments.clone(),
    );
    let exchange = match vhost.insert_exchange(exchange) {
        Ok(exchange) => exchange,
        Err(existing) => {
            // raced another declare; converge on the winner
            ensure_exchange_equivalent(&existing, kind, declare)?;
            return Ok(existing);
        }
    };

    if exchange.durable {
        stores
            .topology
            .put_exchange(vhost.name.as_str(), &stored_exchange(&exchange))
            .map_err(storage_err)?;
    }
    Ok(exchange)
}

/// Redeclaring an exchange requires every property to match the live one.
fn ensure_exchange_equivalent(
    existing: &Exchange,
    kind: ExchangeKind,
    declare: &ExchangeDeclare,
) -> Result<(), ChannelException> {
    let equivalent = existing.kind == kind
        && existing.durable == declare.durable
        && existing.auto_delete == declare.auto_delete
        && existing.internal == declare.internal
        && existing.arguments == declare.arguments;
    if equivalent {
        Ok(())
    } else {
        Err(ChannelException::PreconditionFailed)
    }
}

pub fn delete_exchange(
    vhost: &Vhost,
    stores: &Stores,
    name: &str,
    if_unused: bool,
) -> crate::Result<()> {
    if is_reserved_exchange_name(name) {
        return Err(ChannelException::AccessRefused.into());
    }
    let exchange = vhost.exchange(name).ok_or(ChannelException::NotFound)?;
    if if_unused && exchange.has_bindings() {
        return Err(ChannelException::PreconditionFailed.into());
    }
    delete_exchange_unchecked(vhost, stores, &exchange)
}

pub(crate) fn delete_exchange_unchecked(
    vhost: &Vhost,
    stores: &Stores,
    exchange: &Exchange,
) -> crate::Result<()> {
    info!(exchange = %exchange.name, "Deleting exchange");
    vhost.remove_exchange(&exchange.name);

    let vhost_name = vhost.name.as_str();
    for binding in exchange.bindings() {
        stores
            .topology
            .delete_binding(vhost_name, &stored_binding(&exchange.name, &binding))
            .map_err(storage_err)?;
    }
    stores
        .topology
        .delete_exchange(vhost_name, &exchange.name)
        .map_err(storage_err)?;
    Ok(())
}

pub fn declare_queue(
    broker: &Broker,
    connection: &Connection,
    declare: &QueueDeclare,
) -> crate::Result<Queue> {
    let vhost = &connection.vhost;

    // 2.1.4.1 - If no queue name is given, chose a name
    let name = if declare.queue.is_empty() {
        format!("amq.gen-{}", random_uuid())
    } else {
        if declare.queue.starts_with("amq.") {
            return Err(ChannelException::AccessRefused.into());
        }
        declare.queue.clone()
    };

    if let Some(existing) = vhost.queue(&name) {
        existing.ensure_usable_from(connection.id)?;
        ensure_queue_equivalent(&existing, declare)?;
        return Ok(existing);
    }

    info!(queue = %name, "Creating queue");
    let owner = declare.exclusive.then_some(connection.id);
    let queue = match broker.spawn_queue(
        vhost,
        QueueName::new(name.as_str()),
        declare.durable,
        owner,
        declare.auto_delete,
        declare.arguments.clone(),
    ) {
        Ok(queue) => queue,
        Err(existing) => {
            // raced another declare; converge on the winner
            existing.ensure_usable_from(connection.id)?;
            ensure_queue_equivalent(&existing, declare)?;
            return Ok(existing);
        }
    };

    if declare.exclusive {
        connection.register_exclusive_queue(queue.clone());
    }

    if queue.durable && queue.exclusive_owner.is_none() {
        broker
            .stores()
            .topology
            .put_queue(vhost.name.as_str(), &stored_queue(&queue))
            .map_err(storage_err)?;
    }

    // every queue is reachable through the default exchange under its own name
    if let Some(default_exchange) = vhost.exchange("") {
        bind_unchecked(
            vhost,
            broker.stores(),
            &default_exchange,
            &queue,
            queue.name.to_string(),
            Table::new(),
            false,
        )?;
    }

    Ok(queue)
}

/// Redeclaring a queue requires the lifecycle properties to match.
fn ensure_queue_equivalent(existing: &Queue, declare: &QueueDeclare) -> Result<(), ChannelException> {
    let equivalent = existing.durable == declare.durable
        && existing.auto_delete == declare.auto_delete
        && existing.exclusive_owner.is_some() == declare.exclusive
        && existing.arguments == declare.arguments;
    if equivalent {
        Ok(())
    } else {
        Err(ChannelException::PreconditionFailed)
    }
}

pub fn bind_queue(
    vhost: &Vhost,
    stores: &Stores,
    connection: ConnectionId,
    bind: &QueueBind,
) -> crate::Result<()> {
    if bind.exchange.is_empty() {
        return Err(ChannelException::AccessRefused.into());
    }
    let exchange = vhost.exchange(&bind.exchange).ok_or(ChannelException::NotFound)?;
    let queue = vhost.queue(&bind.queue).ok_or(ChannelException::NotFound)?;
    queue.ensure_usable_from(connection)?;

    bind_unchecked(
        vhost,
        stores,
        &exchange,
        &queue,
        bind.routing_key.clone(),
        bind.arguments.clone(),
        true,
    )
}

fn bind_unchecked(
    vhost: &Vhost,
    stores: &Stores,
    exchange: &Exchange,
    queue: &Queue,
    routing_key: String,
    arguments: Table,
    persist: bool,
) -> crate::Result<()> {
    let binding = Binding::new(exchange.kind, queue.name.clone(), routing_key, arguments);
    let inserted = exchange.bind(binding.clone());

    if inserted && persist && exchange.durable && queue.durable {
        stores
            .topology
            .put_binding(vhost.name.as_str(), &stored_binding(&exchange.name, &binding))
            .map_err(storage_err)?;
    }
    Ok(())
}

pub fn unbind_queue(
    vhost: &Vhost,
    stores: &Stores,
    connection: ConnectionId,
    unbind: &QueueUnbind,
) -> crate::Result<()> {
    if unbind.exchange.is_empty() {
        return Err(ChannelException::AccessRefused.into());
    }
    let exchange = vhost
        .exchange(&unbind.exchange)
        .ok_or(ChannelException::NotFound)?;
    let queue = vhost.queue(&unbind.queue).ok_or(ChannelException::NotFound)?;
    queue.ensure_usable_from(connection)?;

    // removing a binding that does not exist is a no-op per 0-9-1
    let removed = exchange.unbind(&unbind.queue, &unbind.routing_key, &unbind.arguments);
    if removed {
        let binding = Binding::new(
            exchange.kind,
            queue.name.clone(),
            unbind.routing_key.clone(),
            unbind.arguments.clone(),
        );
        stores
            .topology
            .delete_binding(vhost.name.as_str(), &stored_binding(&exchange.name, &binding))
            .map_err(storage_err)?;

        if exchange.ready_for_auto_delete() {
            delete_exchange_unchecked(vhost, stores, &exchange)?;
        }
    }
    Ok(())
}

pub fn purge_queue(vhost: &Vhost, stores: &Stores, queue: &Queue) -> crate::Result<u32> {
    let drained = queue.messages.drain();
    if queue.durable {
        for queued in &drained {
            if queued.message.is_persistent() {
                stores
                    .messages
                    .del_queue_ref(vhost.name.as_str(), &queue.name, queued.message.id)
                    .map_err(storage_err)?;
            }
        }
    }
    Ok(drained.len() as u32)
}

pub fn delete_queue(
    vhost: &Vhost,
    stores: &Stores,
    queue: &Queue,
    if_unused: bool,
    if_empty: bool,
) -> crate::Result<u32> {
    if if_unused && queue.consumer_count() > 0 {
        return Err(ChannelException::PreconditionFailed.into());
    }
    if if_empty && queue.length() > 0 {
        return Err(ChannelException::PreconditionFailed.into());
    }
    delete_queue_unchecked(vhost, stores, queue)
}

/// Removes a queue without precondition checks: cancels its consumers,
/// purges it and erases every trace from the vhost and storage.
pub(crate) fn delete_queue_unchecked(
    vhost: &Vhost,
    stores: &Stores,
    queue: &Queue,
) -> crate::Result<u32> {
    if !queue.begin_shutdown() {
        return Ok(0);
    }
    info!(queue = %queue.name, "Deleting queue");

    let consumers: Vec<Consumer> = {
        let mut state = queue.state();
        state.cursor = 0;
        std::mem::take(&mut state.consumers)
    };
    for consumer in consumers {
        consumer.channel.state().consumers.remove(&consumer.tag);
        let notify = consumer.channel.event_sender.try_send(ConnectionEvent::Method(
            consumer.channel.num,
            Box::new(Method::BasicCancel(BasicCancel {
                consumer_tag: consumer.tag.clone(),
                no_wait: true,
            })),
        ));
        if notify.is_err() {
            warn!(consumer = %consumer.tag, "Could not notify consumer of queue deletion");
        }
    }

    let purged = queue.messages.drain().len() as u32;
    vhost.remove_queue(&queue.name);

    let vhost_name = vhost.name.as_str();
    stores
        .messages
        .purge_queue_refs(vhost_name, &queue.name)
        .map_err(storage_err)?;
    stores
        .topology
        .delete_queue(vhost_name, &queue.name)
        .map_err(storage_err)?;

    // retire the queue's bindings, which may fire exchange auto-delete
    for exchange in vhost.exchanges() {
        let removed = exchange.remove_bindings_for_queue(&queue.name);
        for binding in &removed {
            stores
                .topology
                .delete_binding(vhost_name, &stored_binding(&exchange.name, binding))
                .map_err(storage_err)?;
        }
        if !removed.is_empty() && exchange.ready_for_auto_delete() {
            delete_exchange_unchecked(vhost, stores, &exchange)?;
        }
    }

    Ok(purged)
}

/// Boot-time recovery: exchanges, then queues, then bindings, then the
/// stored messages replayed into each durable queue in original order.
pub(crate) fn recover(broker: &Broker, vhost: &Vhost) -> warren_storage::Result<()> {
    let stores = broker.stores();
    let vhost_name = vhost.name.as_str();

    for stored in stores.topology.exchanges(vhost_name)? {
        let Some(kind) = ExchangeKind::parse(&stored.kind) else {
            warn!(exchange = %stored.name, kind = %stored.kind, "Skipping stored exchange of unknown kind");
            continue;
        };
        let exchange = ExchangeInner::new(
            ExchangeName::new(stored.name.as_str()),
            kind,
            stored.durable,
            stored.auto_delete,
            stored.internal,
            stored.arguments,
        );
        // reserved exchanges are pre-created; everything else is new here
        let _ = vhost.insert_exchange(exchange);
    }

    for stored in stores.topology.queues(vhost_name)? {
        let queue = match broker.spawn_queue(
            vhost,
            QueueName::new(stored.name.as_str()),
            stored.durable,
            None,
            stored.auto_delete,
            stored.arguments,
        ) {
            Ok(queue) => queue,
            Err(_existing) => continue,
        };
        if let Some(default_exchange) = vhost.exchange("") {
            default_exchange.bind(Binding::new(
                default_exchange.kind,
                queue.name.clone(),
                queue.name.to_string(),
                Table::new(),
            ));
        }
    }

    for stored in stores.topology.bindings(vhost_name)? {
        let (Some(exchange), Some(_)) = (
            vhost.exchange(&stored.exchange),
            vhost.queue(&stored.queue),
        ) else {
            warn!(exchange = %stored.exchange, queue = %stored.queue, "Skipping stored binding with missing endpoint");
            continue;
        };
        exchange.bind(Binding::new(
            exchange.kind,
            QueueName::new(stored.queue.as_str()),
            stored.routing_key,
            stored.arguments,
        ));
    }

    let highest_id = stores.messages.recover_ref_counts(vhost_name)?;
    vhost.bump_message_id_floor(highest_id);

    let payloads = stores.messages.load_messages(vhost_name)?;
    for queue in vhost.queues() {
        let mut restored = 0usize;
        for (id, delivery_count) in stores.messages.list_queue_refs(vhost_name, &queue.name)? {
            if let Some(message) = payloads.get(&id.0) {
                queue.messages.append(QueuedMessage {
                    message: message.clone(),
                    delivery_count,
                });
                restored += 1;
            }
        }
        if restored > 0 {
            info!(queue = %queue.name, restored, "Restored persistent messages");
            queue.wake();
        }
    }

    Ok(())
}
