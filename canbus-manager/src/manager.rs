//! The public façade: wires the client registry, the bus state
//! engine, and the alert monitor into the operations collaborators
//! actually call.

use crate::config::ManagerConfig;
use crate::monitor::LastTxResult;
use crate::registry::{Callback, FilterIntent, Handle, Registry};
use crate::state::BusController;
use canbus_api::{Adapter, BusMode, ClientMode, Error, Frame, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info_span;
use tracing_futures::Instrument;

/// A snapshot of manager-wide state for diagnostics. Cheap: every
/// field is read without a lock.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub bus_mode: BusMode,
    pub bus_running: bool,
    pub loopback: bool,
    pub registered_total: u32,
    pub activated_total: u32,
    pub activated_tx_total: u32,
    pub dropped_subscribers: u64,
    pub bus_off_count: u64,
    pub recovery_in_progress: bool,
    pub last_tx_result: LastTxResult,
}

/// Owns one bus's worth of clients and driver state. Cheaply cloned
/// (every field behind `Arc` or a plain atomic) so a single instance
/// can be shared across tasks and handed to a daemon's request
/// handlers.
#[derive(Clone)]
pub struct Manager {
    registry: Arc<Registry>,
    controller: Arc<BusController>,
    cfg: Arc<ManagerConfig>,
    loopback: Arc<AtomicBool>,
}

impl Manager {
    pub fn new(adapter: Arc<dyn Adapter>, cfg: ManagerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let controller = Arc::new(BusController::new(adapter, registry.clone()));
        let loopback = Arc::new(AtomicBool::new(cfg.loopback));

        Manager {
            registry,
            controller,
            cfg: Arc::new(cfg),
            loopback,
        }
    }

    /// Does not affect bus state: a freshly registered client is
    /// inactive until `activate`.
    pub fn register(&self, mode: ClientMode) -> Result<Handle> {
        self.registry.register(mode)
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        self.registry.is_registered(handle)
    }

    /// May start or reconfigure the bus.
    pub async fn activate(&self, handle: Handle) -> Result<()> {
        let outcome = self.registry.activate(handle)?;
        if outcome.engine_pass_needed {
            self.reconcile().await?;
        }
        Ok(())
    }

    /// May stop or reconfigure the bus.
    pub async fn deactivate(&self, handle: Handle) -> Result<()> {
        let outcome = self.registry.deactivate(handle)?;
        if outcome.engine_pass_needed {
            self.reconcile().await?;
        }
        Ok(())
    }

    /// Rejects with `ModeConflict` rather than silently leaving
    /// another client's TX requirement unsatisfied; see
    /// `Registry::set_mode`.
    pub async fn set_mode(&self, handle: Handle, mode: ClientMode) -> Result<()> {
        let outcome = self.registry.set_mode(handle, mode)?;
        if outcome.engine_pass_needed {
            self.reconcile().await?;
        }
        Ok(())
    }

    /// Infallible and idempotent; an unknown handle is simply a
    /// no-op.
    pub async fn unregister(&self, handle: Handle) -> Result<()> {
        let outcome = self.registry.unregister(handle);
        if outcome.engine_pass_needed {
            self.reconcile().await?;
        }
        Ok(())
    }

    pub fn set_rx_callback(&self, handle: Handle, callback: Option<Callback>) -> Result<()> {
        self.registry.set_rx_callback(handle, callback)
    }

    pub fn set_filter(&self, handle: Handle, filter: Option<FilterIntent>) -> Result<()> {
        self.registry.set_filter(handle, filter)
    }

    /// A global setting, not a per-client one; changing it always
    /// re-runs the state engine since it can flip `Normal` against
    /// `NoAck` even with the client counts unchanged.
    pub async fn set_loopback(&self, enabled: bool) -> Result<()> {
        self.loopback.store(enabled, Ordering::SeqCst);
        self.reconcile().await
    }

    /// Frame validation and the permission check never touch the
    /// adapter; only a permitted, well-formed frame reaches it.
    pub async fn transmit(&self, handle: Handle, frame: Frame) -> Result<()> {
        if !frame.is_valid() {
            return Err(Error::InvalidFrame);
        }

        self.registry.check_tx_permission(handle)?;

        let driver_handle = self
            .controller
            .current_handle()
            .ok_or(Error::BusNotRunning)?;

        self.controller
            .adapter_transmit(driver_handle, frame, self.cfg.tx_timeout())
            .instrument(info_span!("transmit", client = handle.diagnostic_id()))
            .await
    }

    pub fn status(&self) -> Status {
        let counters = self.registry.counters();
        let alerts = self.controller.alert_counters.as_ref();
        let bus_mode = self.controller.current_mode();
        Status {
            bus_mode,
            bus_running: bus_mode.is_running(),
            loopback: self.loopback.load(Ordering::SeqCst),
            registered_total: counters.registered_total,
            activated_total: counters.activated_total,
            activated_tx_total: counters.activated_tx_total,
            dropped_subscribers: self.controller.dropped_subscribers.load(Ordering::Relaxed),
            bus_off_count: alerts.bus_off_count.load(Ordering::Relaxed),
            recovery_in_progress: alerts.recovery_in_progress.load(Ordering::SeqCst),
            last_tx_result: alerts.last_tx_result(),
        }
    }

    async fn reconcile(&self) -> Result<()> {
        self.controller.reconcile(&self.loopback, &self.cfg).await
    }
}
