#![warn(rust_2018_idioms)]

pub mod connection;
pub mod consumer;
pub mod error;
pub mod exchange;
mod macros;
pub mod message;
pub mod methods;
pub mod queue;
pub mod vhost;

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};

use connection::{ChannelId, ConnectionId};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    connection::{Channel, Connection},
    vhost::{Vhost, VhostName},
};

/// Message bodies usually arrive in a single frame; spill only for chunked
/// content.
pub type SingleVec<T> = smallvec::SmallVec<[T; 1]>;

/// The server-wide registry of live entities, shared by every task.
#[derive(Clone)]
pub struct GlobalData {
    inner: Arc<Mutex<GlobalDataInner>>,
}

impl Debug for GlobalData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("[global data]")
    }
}

impl Default for GlobalData {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GlobalDataInner {
                connections: HashMap::new(),
                channels: HashMap::new(),
                vhosts: HashMap::new(),
            })),
        }
    }
}

impl GlobalData {
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, GlobalDataInner> {
        self.inner.lock()
    }
}

#[derive(Debug)]
pub struct GlobalDataInner {
    pub connections: HashMap<ConnectionId, Connection>,
    pub channels: HashMap<ChannelId, Channel>,
    pub vhosts: HashMap<VhostName, Vhost>,
}

pub fn random_uuid() -> Uuid {
    Uuid::from_bytes(rand::random())
}
