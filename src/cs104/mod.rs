//! IEC 60870-5-104 (TCP/IP) stations.
//!
//! - [`Connection`] - controlling station (client)
//! - [`Slave`] - controlled station (server) with redundancy groups
//! - [`ApduCodec`] - APDU framing for `tokio_util::codec::Framed`
//! - [`ApciState`] - sequence numbers, k/w windows and T1-T3 timers

mod apci;
mod codec;
mod connection;
mod link;
mod queue;
mod slave;

pub use apci::{seq_distance, seq_next, Apci, FrameType, UFunction, SEQ_MODULO};
pub use codec::{Apdu, ApduCodec};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, DEFAULT_EVENT_CAPACITY,
};
pub use link::{ApciState, TimerAction};
pub use queue::EventQueue;
pub use slave::{
    MasterConnection, RedundancyGroup, ServerMode, Slave, SlaveConfig, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RESPONSE_CAPACITY,
};
