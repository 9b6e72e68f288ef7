//! Defines the contract that the manager uses to drive the
//! underlying CAN/TWAI hardware. The hardware driver itself -- timing
//! tables, filter registers, interrupt set-up -- is an opaque
//! dependency; this crate only needs `install / start / stop /
//! uninstall / transmit / receive / read_alerts`.

use async_trait::async_trait;
use std::time::Duration;

use crate::{alert::AlertBits, error::Result, frame::Frame, mode::{Bitrate, BusMode}};

/// Opaque token identifying an installed driver instance. Carries no
/// public fields; adapters are free to pick any representation
/// internally (a file descriptor, an index into a static table, a
/// hardware register base address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverHandle(pub u64);

/// Parameters the state engine passes to `install`. `mode` is always
/// one of `ListenOnly`, `Normal` or `NoAck` -- the engine never
/// installs for `Stopped`.
#[derive(Debug, Clone, Copy)]
pub struct AdapterConfig {
    pub bitrate: Bitrate,
    pub mode: BusMode,
}

/// The outcome of a single `receive` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Frame(Frame),
    Timeout,
    /// The driver was stopped out from under this call. Not an
    /// error: this is the dispatcher's normal exit signal.
    InvalidState,
}

/// Thin abstraction over the vendor CAN/TWAI driver. Blocking calls
/// respect `timeout`; a zero `Duration` means "poll, don't block".
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn install(&self, cfg: AdapterConfig) -> Result<DriverHandle>;
    async fn start(&self, handle: DriverHandle) -> Result<()>;
    async fn stop(&self, handle: DriverHandle) -> Result<()>;
    async fn uninstall(&self, handle: DriverHandle) -> Result<()>;

    async fn transmit(
        &self,
        handle: DriverHandle,
        frame: Frame,
        timeout: Duration,
    ) -> Result<()>;

    async fn receive(
        &self,
        handle: DriverHandle,
        timeout: Duration,
    ) -> Result<ReceiveOutcome>;

    async fn read_alerts(
        &self,
        handle: DriverHandle,
        timeout: Duration,
    ) -> Result<AlertBits>;

    /// Kicks off the vendor driver's bus-off recovery sequence (the
    /// ESP-IDF TWAI driver calls this `twai_initiate_recovery`). The
    /// Alert Monitor needs some way to act on BUS_OFF, and the
    /// hardware exposes exactly this call. Recovery completion is
    /// reported asynchronously as a `BUS_RECOVERED` alert.
    async fn initiate_recovery(&self, handle: DriverHandle) -> Result<()>;
}
