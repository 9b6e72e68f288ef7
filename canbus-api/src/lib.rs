//! Shared types and the `Adapter` trait used by the CAN bus manager
//! and by every driver backend it can be wired up to.

mod adapter;
mod alert;
mod error;
mod frame;
mod mode;

pub use adapter::{Adapter, AdapterConfig, DriverHandle, ReceiveOutcome};
pub use alert::AlertBits;
pub use error::{Error, Result};
pub use frame::Frame;
pub use mode::{Bitrate, BusMode, ClientMode};
