//! Derives the target driver state from aggregate client state and
//! transitions the adapter accordingly.
//!
//! The engine holds no registry mutex while talking to the adapter.
//! Serialization of the transition *itself* (so two callers crossing
//! a threshold at once don't both try to install) is a separate,
//! async-aware `tokio::sync::Mutex` around the running-instance state
//! -- distinct from the registry's plain `std::sync::Mutex`, and the
//! only lock in this crate that is ever held across an `.await`.

use crate::config::ManagerConfig;
use crate::dispatcher::{self, DispatcherStop};
use crate::monitor::{self, AlertCounters};
use crate::registry::{Counters, Registry};
use canbus_api::{Adapter, AdapterConfig, BusMode, DriverHandle, Error, Frame, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pure function of the three counters plus the loopback flag.
pub(crate) fn target_mode(counters: Counters, loopback: bool) -> BusMode {
    if counters.activated_tx_total > 0 {
        if loopback {
            BusMode::NoAck
        } else {
            BusMode::Normal
        }
    } else if counters.activated_total > 0 {
        BusMode::ListenOnly
    } else {
        BusMode::Stopped
    }
}

fn encode(mode: BusMode) -> u8 {
    match mode {
        BusMode::Stopped => 0,
        BusMode::ListenOnly => 1,
        BusMode::Normal => 2,
        BusMode::NoAck => 3,
    }
}

fn decode(word: u8) -> BusMode {
    match word {
        1 => BusMode::ListenOnly,
        2 => BusMode::Normal,
        3 => BusMode::NoAck,
        _ => BusMode::Stopped,
    }
}

struct Running {
    handle: DriverHandle,
    mode: BusMode,
    dispatcher_stop: Arc<DispatcherStop>,
    dispatcher_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

pub(crate) struct BusController {
    adapter: Arc<dyn Adapter>,
    registry: Arc<Registry>,
    running: AsyncMutex<Option<Running>>,
    current_mode_word: AtomicU8,
    current_handle_word: AtomicU64,
    pub dropped_subscribers: Arc<AtomicU64>,
    pub alert_counters: Arc<AlertCounters>,
}

impl BusController {
    pub fn new(adapter: Arc<dyn Adapter>, registry: Arc<Registry>) -> Self {
        BusController {
            adapter,
            registry,
            running: AsyncMutex::new(None),
            current_mode_word: AtomicU8::new(encode(BusMode::Stopped)),
            current_handle_word: AtomicU64::new(0),
            dropped_subscribers: Arc::new(AtomicU64::new(0)),
            alert_counters: Arc::new(AlertCounters::default()),
        }
    }

    /// Lock-free: safe to call from the synchronous `status()` API.
    pub fn current_mode(&self) -> BusMode {
        decode(self.current_mode_word.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.current_mode().is_running()
    }

    /// Lock-free: used by the transmit path, which must not block on
    /// a transition in progress just to learn there's no handle yet.
    pub fn current_handle(&self) -> Option<DriverHandle> {
        match self.current_handle_word.load(Ordering::SeqCst) {
            0 => None,
            v => Some(DriverHandle(v)),
        }
    }

    /// Submitted after the registry mutex has already been released,
    /// against whichever driver handle was current at the time it was
    /// captured. If the bus transitions away underneath an in-flight
    /// transmit, the adapter itself reports the failure -- this call
    /// does not re-validate the handle against a transition that may
    /// have since happened.
    pub async fn adapter_transmit(
        &self,
        handle: DriverHandle,
        frame: Frame,
        timeout: Duration,
    ) -> Result<()> {
        self.adapter.transmit(handle, frame, timeout).await
    }

    /// Samples the registry's counters and the loopback flag, and
    /// drives the adapter through whatever transition is needed. If a
    /// second transition becomes necessary because counters changed
    /// again while this one was in flight, runs a second pass.
    pub async fn reconcile(
        &self,
        loopback: &AtomicBool,
        cfg: &ManagerConfig,
    ) -> Result<()> {
        loop {
            let target =
                target_mode(self.registry.counters(), loopback.load(Ordering::SeqCst));

            let mut running = self.running.lock().await;
            let current = running.as_ref().map(|r| r.mode).unwrap_or(BusMode::Stopped);

            if current == target {
                return Ok(());
            }

            let result: Result<()> = match (current.is_running(), target.is_running()) {
                (false, true) => self.do_start(&mut running, target, cfg).await,
                (true, false) => {
                    self.do_stop(&mut running, cfg).await;
                    Ok(())
                }
                (true, true) => {
                    self.do_stop(&mut running, cfg).await;
                    self.do_start(&mut running, target, cfg).await
                }
                (false, false) => Ok(()),
            };

            drop(running);
            result?;

            let recheck = target_mode(self.registry.counters(), loopback.load(Ordering::SeqCst));
            if recheck == target {
                return Ok(());
            }
            // Counters moved again during the transition; loop for another pass.
        }
    }

    async fn do_start(
        &self,
        running: &mut Option<Running>,
        target: BusMode,
        cfg: &ManagerConfig,
    ) -> Result<()> {
        let adapter_cfg = AdapterConfig {
            bitrate: cfg.bitrate,
            mode: target,
        };

        let handle = self.adapter.install(adapter_cfg).await.map_err(|e| {
            error!(error = %e, "adapter install failed");
            Error::AdapterInstallFailed(e.to_string())
        })?;

        if let Err(e) = self.adapter.start(handle).await {
            error!(error = %e, "adapter start failed, uninstalling");
            let _ = self.adapter.uninstall(handle).await;
            return Err(Error::AdapterStartFailed(e.to_string()));
        }

        let dispatcher_stop = Arc::new(DispatcherStop::new());
        let dispatcher_task = dispatcher::spawn(
            self.registry.clone(),
            self.adapter.clone(),
            handle,
            dispatcher_stop.clone(),
            cfg.snapshot_capacity,
            self.dropped_subscribers.clone(),
        );
        let monitor_task = monitor::spawn(
            self.adapter.clone(),
            handle,
            self.alert_counters.clone(),
            cfg.bus_off_recovery_delay(),
        );

        self.current_handle_word.store(handle.0, Ordering::SeqCst);
        self.current_mode_word.store(encode(target), Ordering::SeqCst);

        *running = Some(Running {
            handle,
            mode: target,
            dispatcher_stop,
            dispatcher_task,
            monitor_task,
        });

        info!(mode = ?target, "bus started");
        Ok(())
    }

    async fn do_stop(&self, running: &mut Option<Running>, cfg: &ManagerConfig) {
        let Running {
            handle,
            dispatcher_stop,
            mut dispatcher_task,
            monitor_task,
            ..
        } = match running.take() {
            Some(r) => r,
            None => return,
        };

        dispatcher_stop.request();

        if tokio::time::timeout(cfg.dispatcher_stop_patience(), &mut dispatcher_task)
            .await
            .is_err()
        {
            warn!("dispatcher did not exit within patience, forcing stop");
            let _ = self.adapter.stop(handle).await;
            let _ = (&mut dispatcher_task).await;
        }

        let _ = self.adapter.stop(handle).await;
        let _ = self.adapter.uninstall(handle).await;
        let _ = monitor_task.await;

        self.current_handle_word.store(0, Ordering::SeqCst);
        self.current_mode_word
            .store(encode(BusMode::Stopped), Ordering::SeqCst);

        info!("bus stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Counters;

    #[test]
    fn target_mode_matches_thresholds() {
        assert_eq!(
            target_mode(
                Counters {
                    registered_total: 0,
                    activated_total: 0,
                    activated_tx_total: 0
                },
                false
            ),
            BusMode::Stopped
        );
        assert_eq!(
            target_mode(
                Counters {
                    registered_total: 1,
                    activated_total: 1,
                    activated_tx_total: 0
                },
                false
            ),
            BusMode::ListenOnly
        );
        assert_eq!(
            target_mode(
                Counters {
                    registered_total: 1,
                    activated_total: 1,
                    activated_tx_total: 1
                },
                false
            ),
            BusMode::Normal
        );
        assert_eq!(
            target_mode(
                Counters {
                    registered_total: 1,
                    activated_total: 1,
                    activated_tx_total: 1
                },
                true
            ),
            BusMode::NoAck
        );
    }
}
