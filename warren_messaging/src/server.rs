//! The broker façade the transport collaborator drives: vhost registry,
//! connection/channel lifecycle entry points, the decoded-method surface
//! and graceful shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};
use warren_core::{
    connection::{
        Channel, ChannelNum, ConEventSender, Connection, ConnectionEvent, ConnectionId,
        ContentHeader,
    },
    error::ProtocolError,
    methods::{Method, Table},
    queue::{Queue, QueueInner, QueueName},
    vhost::{Vhost, VhostInner, VhostName},
    GlobalData,
};
use warren_storage::{KvStore, MessageStore, TopologyStore};

use crate::{channel, connection, methods, queue_worker::QueueTask, topology};

/// The authentication backend collaborator: checks credentials and whether
/// they grant access to a vhost.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, username: &str, password: &str, vhost: &str) -> bool;
}

/// Accepts any credentials for any vhost.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _username: &str, _password: &str, _vhost: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// The vhosts created (and recovered) at boot.
    pub vhosts: Vec<String>,
    /// How long an auto-delete queue lingers after its last consumer is
    /// cancelled before it is removed. AMQP leaves this unspecified.
    pub auto_delete_grace: Duration,
    /// Capacity of each queue's dispatch event channel.
    pub queue_event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            vhosts: vec!["/".to_owned()],
            auto_delete_grace: Duration::from_millis(100),
            queue_event_capacity: 16,
        }
    }
}

/// The storage handles shared by every broker component.
#[derive(Clone)]
pub struct Stores {
    pub topology: TopologyStore,
    pub messages: MessageStore,
}

pub struct Broker {
    global: GlobalData,
    stores: Stores,
    config: BrokerConfig,
    auth: Arc<dyn Authenticator>,
}

impl Broker {
    /// Builds the broker and recovers every configured vhost from storage.
    /// Must run inside a Tokio runtime: recovered queues spawn their
    /// dispatch tasks immediately.
    pub fn new(
        config: BrokerConfig,
        kv: Arc<dyn KvStore>,
        auth: Arc<dyn Authenticator>,
    ) -> warren_storage::Result<Arc<Self>> {
        let stores = Stores {
            topology: TopologyStore::new(kv.clone()),
            messages: MessageStore::new(kv),
        };
        let broker = Arc::new(Self {
            global: GlobalData::default(),
            stores,
            config,
            auth,
        });

        for name in broker.config.vhosts.clone() {
            let vhost = VhostInner::new(VhostName::new(name.as_str()));
            broker
                .global
                .lock()
                .vhosts
                .insert(vhost.name.clone(), vhost.clone());
            topology::recover(&broker, &vhost)?;
            info!(vhost = %name, "Vhost ready");
        }

        Ok(broker)
    }

    pub fn global(&self) -> &GlobalData {
        &self.global
    }

    pub fn vhost(&self, name: &str) -> Option<Vhost> {
        self.global.lock().vhosts.get(name).cloned()
    }

    pub(crate) fn stores(&self) -> &Stores {
        &self.stores
    }

    pub(crate) fn authenticator(&self) -> &dyn Authenticator {
        &*self.auth
    }

    /// Registers a new client connection after authenticating it. The
    /// `event_sender` is the transport's outbound frame channel.
    pub fn open_connection(
        &self,
        peer_addr: SocketAddr,
        username: &str,
        password: &str,
        vhost: &str,
        event_sender: ConEventSender,
    ) -> crate::Result<Connection> {
        connection::open_connection(self, peer_addr, username, password, vhost, event_sender)
    }

    pub fn close_connection(&self, connection: &Connection) {
        connection::close_connection(self, connection);
    }

    pub fn open_channel(&self, connection: &Connection, num: ChannelNum) -> crate::Result<Channel> {
        channel::open_channel(self, connection, num)
    }

    pub fn close_channel(&self, channel: &Channel) {
        channel::close_channel(self, channel);
    }

    /// Handles one decoded method. `Ok(Some(_))` is the synchronous reply
    /// the transport sends back; channel exceptions have already torn the
    /// channel down when they are returned.
    pub fn handle_method(
        &self,
        channel: Channel,
        method: Method,
    ) -> crate::Result<Option<Method>> {
        self.surface_channel_errors(&channel, methods::handle_method(self, channel.clone(), method))
    }

    /// Handles the content header following `basic.publish`.
    pub fn handle_content_header(
        &self,
        channel: &Channel,
        header: ContentHeader,
    ) -> crate::Result<()> {
        self.surface_channel_errors(channel, methods::publish::content_header(self, channel, header))
    }

    /// Handles one content body frame following the header.
    pub fn handle_content_body(&self, channel: &Channel, chunk: Bytes) -> crate::Result<()> {
        self.surface_channel_errors(channel, methods::publish::content_body(self, channel, chunk))
    }

    /// A channel exception closes the channel server-side; the error still
    /// propagates so the transport can send the `channel.close` frame.
    fn surface_channel_errors<T>(
        &self,
        channel: &Channel,
        result: crate::Result<T>,
    ) -> crate::Result<T> {
        if let Err(ProtocolError::ChannelException(ex)) = &result {
            warn!(channel = %channel.num, %ex, "Channel exception");
            channel::close_channel(self, channel);
        }
        result
    }

    /// Creates a queue together with its dispatch task. Fails with the
    /// existing queue if the name is already taken.
    pub(crate) fn spawn_queue(
        &self,
        vhost: &Vhost,
        name: QueueName,
        durable: bool,
        exclusive_owner: Option<ConnectionId>,
        auto_delete: bool,
        arguments: Table,
    ) -> Result<Queue, Queue> {
        let (event_send, event_recv) = mpsc::channel(self.config.queue_event_capacity);
        let queue = QueueInner::new(
            name,
            durable,
            exclusive_owner,
            auto_delete,
            arguments,
            event_send,
        );
        let queue = vhost.insert_queue(queue)?;

        let task = QueueTask::new(
            queue.clone(),
            vhost.clone(),
            self.stores.clone(),
            event_recv,
            self.config.auto_delete_grace,
        );
        tokio::spawn(task.start());

        Ok(queue)
    }

    /// Graceful shutdown: every connection is told to close with
    /// `connection-forced` and every queue dispatch task is stopped after
    /// its pending storage writes completed.
    pub async fn shutdown(&self) {
        info!("Shutting down broker");

        let connections: Vec<Connection> =
            self.global.lock().connections.values().cloned().collect();
        for con in connections {
            if con.event_sender.try_send(ConnectionEvent::Shutdown).is_err() {
                warn!(id = %con.id, "Connection did not accept the shutdown event");
            }
            connection::close_connection(self, &con);
        }

        let vhosts: Vec<Vhost> = self.global.lock().vhosts.values().cloned().collect();
        for vhost in vhosts {
            for queue in vhost.queues() {
                queue.begin_shutdown();
            }
        }

        info!("Finished shutdown");
    }
}
