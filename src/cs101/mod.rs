//! IEC 60870-5-101 (serial) stations in unbalanced mode.
//!
//! - [`Cs101Master`] - primary station polling one or more slaves
//! - [`Cs101Slave`] - secondary station with class 1 / class 2 queues
//! - [`Ft12Codec`] - FT1.2 framing for `tokio_util::codec::Framed`
//!
//! Any `AsyncRead + AsyncWrite` transport works, e.g. a serial port stream
//! or a TCP tunnel to a terminal server.

mod frame;
mod master;
mod slave;

pub use frame::{
    ControlField, Ft12Codec, Ft12Frame, PrimaryFunction, SecondaryFunction, END_BYTE,
    FIXED_START, SINGLE_CHAR, VARIABLE_START,
};
pub use master::{Cs101Master, LinkState, MasterConfig, MasterEvent, DEFAULT_POLL_INTERVAL};
pub use slave::{Cs101Slave, Cs101SlaveConfig, DEFAULT_CLASS_CAPACITY};
