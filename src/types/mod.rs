//! IEC 60870-5 application layer types.
//!
//! - `TypeId` - Type identification (M_SP_NA_1, etc.)
//! - `Cot` - Cause of transmission
//! - `Asdu` - Application Service Data Unit
//! - `Cp56Time2a`, `Cp24Time2a`, `Cp16Time2a` - Time tags
//! - `DataPoint` / `DataValue` - Monitoring direction information
//! - `Command` - Control and system direction information

mod asdu;
mod command;
mod cot;
mod data;
mod time;
mod type_id;

pub use asdu::*;
pub use command::*;
pub use cot::*;
pub use data::*;
pub use time::*;
pub use type_id::*;
