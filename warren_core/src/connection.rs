use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Formatter},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::{
    consumer::Consumer,
    error::ChannelException,
    message::{Message, Properties},
    methods::{BasicPublish, ConsumerTag, DeliveryTag, Method},
    newtype_id,
    queue::Queue,
    vhost::Vhost,
    SingleVec,
};

newtype_id!(pub ConnectionId);
newtype_id!(pub ChannelId);

/// The channel number on the wire, 1..=65535 within one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelNum(u16);

impl ChannelNum {
    #[must_use]
    pub fn new(num: u16) -> Self {
        Self(num)
    }

    #[must_use]
    pub fn num(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn zero() -> Self {
        Self(0)
    }
}

impl Display for ChannelNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A content frame header, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub weight: u16,
    pub body_size: u64,
    pub properties: Properties,
}

/// Frames the core asks the transport collaborator to put on the wire.
#[derive(Debug)]
pub enum ConnectionEvent {
    Shutdown,
    Method(ChannelNum, Box<Method>),
    MethodContent(ChannelNum, Box<Method>, ContentHeader, SingleVec<Bytes>),
}

pub type ConEventSender = mpsc::Sender<ConnectionEvent>;
pub type ConEventReceiver = mpsc::Receiver<ConnectionEvent>;

pub type Connection = Arc<ConnectionInner>;

#[derive(Debug)]
pub struct ConnectionInner {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub username: String,
    pub vhost: Vhost,
    pub channels: Mutex<HashMap<ChannelNum, Channel>>,
    /// Queues this connection owns exclusively; reaped when it closes.
    pub exclusive_queues: Mutex<Vec<Queue>>,
    closing: AtomicBool,
    pub event_sender: ConEventSender,
}

impl ConnectionInner {
    #[must_use]
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        username: String,
        vhost: Vhost,
        event_sender: ConEventSender,
    ) -> Connection {
        Arc::new(Self {
            id,
            peer_addr,
            username,
            vhost,
            channels: Mutex::default(),
            exclusive_queues: Mutex::default(),
            closing: AtomicBool::new(false),
            event_sender,
        })
    }

    /// Flags the connection as closing; returns false if it already was.
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn register_exclusive_queue(&self, queue: Queue) {
        self.exclusive_queues.lock().push(queue);
    }

    pub fn forget_exclusive_queue(&self, name: &str) {
        self.exclusive_queues
            .lock()
            .retain(|q| q.name.as_str() != name);
    }
}

pub type Channel = Arc<ChannelInner>;

#[derive(Debug)]
pub struct ChannelInner {
    pub id: ChannelId,
    pub num: ChannelNum,
    pub connection: Connection,
    pub vhost: Vhost,
    pub event_sender: ConEventSender,
    state: Mutex<ChannelState>,
}

impl ChannelInner {
    #[must_use]
    pub fn new(num: ChannelNum, connection: Connection) -> Channel {
        let vhost = connection.vhost.clone();
        let event_sender = connection.event_sender.clone();
        Arc::new(Self {
            id: ChannelId::random(),
            num,
            connection,
            vhost,
            event_sender,
            state: Mutex::new(ChannelState::new()),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().status == ChannelStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Closing,
    Closed,
}

/// Assembly of a `basic.publish` from its method, header and body frames.
#[derive(Debug, Default)]
pub enum PublishAssembly {
    #[default]
    Idle,
    HaveMethod(BasicPublish),
    HaveHeader {
        publish: BasicPublish,
        header: ContentHeader,
    },
    Accumulating {
        publish: BasicPublish,
        header: ContentHeader,
        body: SingleVec<Bytes>,
        received: u64,
    },
}

impl PublishAssembly {
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// An in-flight delivery awaiting acknowledgement.
#[derive(Debug)]
pub struct UnackedDelivery {
    pub queue: Queue,
    pub message: Message,
    /// Deliveries the queue has made of this message, this one included.
    /// Requeuing carries it back so the next delivery reads `redelivered`.
    pub delivery_count: u32,
    /// None for deliveries handed out through `basic.get`.
    pub consumer: Option<Consumer>,
}

/// Buffered outcome of an ack-class method inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Requeue,
    Drop,
}

#[derive(Debug)]
pub struct PendingAck {
    pub delivery_tag: DeliveryTag,
    pub multiple: bool,
    pub outcome: AckOutcome,
}

#[derive(Debug, Default)]
pub struct TxState {
    pub pending_publishes: Vec<Message>,
    pub pending_acks: Vec<PendingAck>,
}

/// Publisher-confirm and transaction modes are mutually exclusive per channel.
#[derive(Debug)]
pub enum ChannelMode {
    Normal,
    Confirm { next_publish_seq: u64 },
    Tx(TxState),
}

#[derive(Debug)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub assembly: PublishAssembly,
    pub consumers: HashMap<ConsumerTag, Consumer>,
    /// Channel-wide prefetch window (`basic.qos` with `global`).
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    /// Defaults applied to consumers registered after a non-global qos.
    pub consumer_prefetch_count: u16,
    pub consumer_prefetch_size: u32,
    pub unacked: BTreeMap<DeliveryTag, UnackedDelivery>,
    pub unacked_size: u64,
    next_delivery_tag: DeliveryTag,
    pub flow_active: bool,
    pub mode: ChannelMode,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            status: ChannelStatus::Open,
            assembly: PublishAssembly::Idle,
            consumers: HashMap::new(),
            prefetch_count: 0,
            prefetch_size: 0,
            consumer_prefetch_count: 0,
            consumer_prefetch_size: 0,
            unacked: BTreeMap::new(),
            unacked_size: 0,
            next_delivery_tag: 1,
            flow_active: true,
            mode: ChannelMode::Normal,
        }
    }

    pub fn next_delivery_tag(&mut self) -> DeliveryTag {
        let tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;
        tag
    }

    /// Whether one more delivery of `body_size` bytes fits the channel-wide
    /// prefetch window.
    pub fn fits_prefetch(&self, body_size: u64) -> bool {
        let count_ok =
            self.prefetch_count == 0 || self.unacked.len() < usize::from(self.prefetch_count);
        let size_ok = self.prefetch_size == 0
            || self.unacked_size + body_size <= u64::from(self.prefetch_size);
        count_ok && size_ok
    }

    pub fn record_delivery(&mut self, tag: DeliveryTag, delivery: UnackedDelivery) {
        self.unacked_size += delivery.message.body_size();
        self.unacked.insert(tag, delivery);
    }

    /// Removes the settled deliveries for an ack-class method.
    ///
    /// With `multiple`, everything up to and including `tag` is taken
    /// (everything outstanding for `tag == 0`). Without it, exactly `tag`.
    /// An unknown tag is a precondition failure.
    pub fn take_settled(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
    ) -> Result<Vec<(DeliveryTag, UnackedDelivery)>, ChannelException> {
        let settled: Vec<(DeliveryTag, UnackedDelivery)> = if multiple {
            if tag == 0 {
                std::mem::take(&mut self.unacked).into_iter().collect()
            } else {
                if !self.unacked.contains_key(&tag) {
                    return Err(ChannelException::PreconditionFailed);
                }
                let kept = self.unacked.split_off(&tag.saturating_add(1));
                std::mem::replace(&mut self.unacked, kept)
                    .into_iter()
                    .collect()
            }
        } else {
            match self.unacked.remove(&tag) {
                Some(delivery) => vec![(tag, delivery)],
                None => return Err(ChannelException::PreconditionFailed),
            }
        };

        for (_, delivery) in &settled {
            self.unacked_size -= delivery.message.body_size();
        }
        Ok(settled)
    }

    /// Removes every outstanding delivery, e.g. on channel close or
    /// `basic.recover`.
    pub fn take_all_unacked(&mut self) -> Vec<(DeliveryTag, UnackedDelivery)> {
        self.unacked_size = 0;
        std::mem::take(&mut self.unacked).into_iter().collect()
    }
}
