use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crate::{connection::Channel, methods::ConsumerTag, newtype_id, queue::Queue};

newtype_id!(pub ConsumerId);

/// A registration of a channel on a queue. Cheap to clone; the unacked
/// counters are shared between all clones.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: ConsumerId,
    pub tag: ConsumerTag,
    pub channel: Channel,
    pub queue: Queue,
    /// Deliveries to this consumer are considered acknowledged immediately.
    pub no_ack: bool,
    /// This consumer demanded sole access to the queue.
    pub exclusive: bool,
    /// Prefetch limits captured from the channel's qos at registration time.
    /// Zero means unlimited.
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pending: Arc<PendingCounters>,
}

#[derive(Debug, Default)]
struct PendingCounters {
    count: AtomicUsize,
    size: AtomicU64,
}

impl Consumer {
    pub fn new(
        tag: ConsumerTag,
        channel: Channel,
        queue: Queue,
        no_ack: bool,
        exclusive: bool,
        prefetch_count: u16,
        prefetch_size: u32,
    ) -> Self {
        Self {
            id: ConsumerId::random(),
            tag,
            channel,
            queue,
            no_ack,
            exclusive,
            prefetch_count,
            prefetch_size,
            pending: Arc::default(),
        }
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    pub fn unacked_size(&self) -> u64 {
        self.pending.size.load(Ordering::Acquire)
    }

    /// Whether one more delivery of `body_size` bytes fits this consumer's
    /// own prefetch window.
    pub fn fits_prefetch(&self, body_size: u64) -> bool {
        let count_ok = self.prefetch_count == 0
            || self.unacked_count() < usize::from(self.prefetch_count);
        let size_ok = self.prefetch_size == 0
            || self.unacked_size() + body_size <= u64::from(self.prefetch_size);
        count_ok && size_ok
    }

    pub fn record_delivery(&self, body_size: u64) {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        self.pending.size.fetch_add(body_size, Ordering::AcqRel);
    }

    pub fn record_settlement(&self, body_size: u64) {
        self.pending.count.fetch_sub(1, Ordering::AcqRel);
        self.pending.size.fetch_sub(body_size, Ordering::AcqRel);
    }
}
