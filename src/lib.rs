//! # voltage_iec60870
//!
//! IEC 60870-5-101 and IEC 60870-5-104 protocol implementation for Rust.
//!
//! This crate implements both sides of the telecontrol protocols commonly
//! used in power systems and SCADA applications.
//!
//! ## Features
//!
//! - **CS104 client and server**: I/S/U frames, K/W windows, T0-T3 timers
//! - **Redundancy groups**: event queues shared by redundant masters
//! - **CS101 unbalanced mode**: FT1.2 framing, polling master and slave
//! - **Type Safe**: Strong typing for TypeID, COT, IOA, time tags and commands
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voltage_iec60870::{Connection, ConnectionConfig, ConnectionEvent};
//!
//! #[tokio::main]
//! async fn main() -> voltage_iec60870::Result<()> {
//!     let config = ConnectionConfig::new("192.168.1.100:2404");
//!     let mut connection = Connection::new(config);
//!     let mut events = connection.subscribe().expect("first subscriber");
//!
//!     // Connect and start data transfer
//!     connection.connect().await?;
//!     connection.start_dt().await?;
//!
//!     // Request general interrogation
//!     connection.general_interrogation(1).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ConnectionEvent::DataUpdate { points, .. } = event {
//!             println!("{:?}", points);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! A controlled station implements [`SlaveHandler`] and is served by
//! [`Slave`] (TCP) or [`cs101::Cs101Slave`] (serial).
//!
//! ## Protocol Overview
//!
//! IEC 60870-5-104 uses TCP/IP for communication (default port 2404).
//! The protocol defines three frame types:
//!
//! - **I-frame**: Information transfer (contains ASDU)
//! - **S-frame**: Supervisory (acknowledgment)
//! - **U-frame**: Unnumbered (control: STARTDT, STOPDT, TESTFR)
//!
//! ### APDU Structure
//!
//! ```text
//! APCI (6 bytes):
//! +--------+--------+--------+--------+--------+--------+
//! | 0x68   | Length | Control Field (4 bytes)           |
//! +--------+--------+--------+--------+--------+--------+
//! ```
//!
//! IEC 60870-5-101 carries the same ASDUs in FT1.2 frames on a serial line:
//!
//! ```text
//! 0x68 | L | L | 0x68 | C | A | ASDU ... | CS | 0x16
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cs101;
pub mod cs104;
pub mod error;
pub mod handler;
pub mod params;
pub mod parser;
pub mod types;

/// Default TCP port of IEC 60870-5-104.
pub const DEFAULT_PORT: u16 = 2404;

// Re-export main types
pub use cs104::{
    Apdu, ApduCodec, Connection, ConnectionConfig, ConnectionEvent, ConnectionState,
    RedundancyGroup, ServerMode, Slave, SlaveConfig,
};
pub use error::{Iec60870Error, Result};
pub use handler::{DefaultHandler, PeerConnectionEvent, Responder, SlaveHandler};
pub use params::{AppLayerParameters, ApciParameters, LinkLayerParameters};
pub use parser::{parse_asdu, parse_asdu_with};
pub use types::*;
