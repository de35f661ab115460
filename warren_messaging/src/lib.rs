#![warn(rust_2018_idioms)]
#![deny(clippy::future_not_send)]

//! The broker logic: routing, queue dispatch, topology bookkeeping and the
//! per-channel method handlers, all driven through [`server::Broker`] by the
//! transport collaborator.

pub mod channel;
pub mod connection;
pub mod methods;
pub mod routing;
pub mod server;
pub mod topology;

mod queue_worker;

use warren_core::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

pub use server::{AllowAll, Authenticator, Broker, BrokerConfig};
