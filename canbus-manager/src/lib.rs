//! Core logic for a single CAN bus: client registry, bus state
//! engine, receive dispatcher, and alert monitor, behind the
//! `Manager` façade. Pairs with an `Adapter` implementation (such as
//! `canbus-sim-driver`) supplying the actual bus access.

mod config;
mod dispatcher;
mod manager;
mod monitor;
mod registry;
mod state;

pub use config::ManagerConfig;
pub use manager::{Manager, Status};
pub use monitor::LastTxResult;
pub use registry::{Callback, FilterIntent, Handle};

pub use canbus_api::{
    Adapter, AdapterConfig, AlertBits, Bitrate, BusMode, ClientMode, DriverHandle, Error, Frame,
    ReceiveOutcome, Result,
};
