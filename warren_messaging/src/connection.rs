//! Connection lifecycle: registration, authentication and the close
//! cascade that cancels consumers and reaps exclusive queues.

use std::net::SocketAddr;

use tracing::{info, warn};
use warren_core::{
    connection::{ConEventSender, Connection, ConnectionId, ConnectionInner},
    error::ConException,
    queue::Queue,
    vhost::Vhost,
};

use crate::{channel, server::Broker, topology};

pub fn open_connection(
    broker: &Broker,
    peer_addr: SocketAddr,
    username: &str,
    password: &str,
    vhost_name: &str,
    event_sender: ConEventSender,
) -> crate::Result<Connection> {
    let vhost: Vhost = broker
        .vhost(vhost_name)
        .ok_or(ConException::InvalidPath)?;

    if !broker
        .authenticator()
        .authenticate(username, password, vhost_name)
    {
        return Err(ConException::AccessRefused.into());
    }

    let connection = ConnectionInner::new(
        ConnectionId::random(),
        peer_addr,
        username.to_owned(),
        vhost,
        event_sender,
    );
    broker
        .global()
        .lock()
        .connections
        .insert(connection.id, connection.clone());

    info!(id = %connection.id, %peer_addr, %username, vhost = %vhost_name, "Connection opened");
    Ok(connection)
}

/// The close cascade: consumers are cancelled and in-flight deliveries
/// requeued channel by channel, then the connection's exclusive queues are
/// deleted, then the channel state is dropped.
pub fn close_connection(broker: &Broker, connection: &Connection) {
    if !connection.begin_close() {
        return;
    }
    info!(id = %connection.id, "Closing connection");

    let channels: Vec<_> = connection.channels.lock().values().cloned().collect();
    for channel in &channels {
        channel::close_channel(broker, channel);
    }

    let exclusive: Vec<Queue> = std::mem::take(&mut *connection.exclusive_queues.lock());
    for queue in exclusive {
        if let Err(err) =
            topology::delete_queue_unchecked(&connection.vhost, broker.stores(), &queue)
        {
            warn!(%err, queue = %queue.name, "Failed to delete exclusive queue on close");
        }
    }

    connection.channels.lock().clear();
    broker.global().lock().connections.remove(&connection.id);
}
