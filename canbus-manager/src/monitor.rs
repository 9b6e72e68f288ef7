//! Reads hardware alerts for as long as the driver is installed:
//! tracks BUS_OFF, ERROR_PASSIVE, ERROR_WARNING, recovery progress,
//! and initiates bus recovery autonomously.

use canbus_api::{Adapter, AlertBits, DriverHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

/// Last classified outcome of a transmit, as observed by the monitor
/// through `TX_SUCCESS` / `TX_FAILED` / `TX_RETRIED` alerts. A single
/// word, so it is an atomic rather than a locked scalar -- there is
/// nothing else to keep consistent with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LastTxResult {
    Unknown = 0,
    Success = 1,
    Failed = 2,
    Retried = 3,
}

impl From<u8> for LastTxResult {
    fn from(v: u8) -> Self {
        match v {
            1 => LastTxResult::Success,
            2 => LastTxResult::Failed,
            3 => LastTxResult::Retried,
            _ => LastTxResult::Unknown,
        }
    }
}

/// Counters and flags the monitor maintains. Every field is either
/// atomic or a single word, so the monitor and the rest of the
/// manager never need a lock to share this state.
#[derive(Default)]
pub struct AlertCounters {
    pub bus_off_count: AtomicU64,
    pub error_passive_count: AtomicU64,
    pub error_warning_count: AtomicU64,
    pub rx_queue_full_count: AtomicU64,
    pub rx_fifo_overrun_count: AtomicU64,
    pub recovery_in_progress: AtomicBool,
    last_tx_result: AtomicU8,
}

impl AlertCounters {
    pub fn last_tx_result(&self) -> LastTxResult {
        LastTxResult::from(self.last_tx_result.load(Ordering::Relaxed))
    }
}

/// Spawns the alert monitor. Exits when the adapter signals the
/// driver is no longer installed (a zero alert word from
/// `read_alerts`, by convention of every `Adapter` impl in this
/// crate) or on a hard adapter error.
pub(crate) fn spawn(
    adapter: Arc<dyn Adapter>,
    handle: DriverHandle,
    counters: Arc<AlertCounters>,
    recovery_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                match adapter.read_alerts(handle, Duration::MAX).await {
                    Ok(bits) if bits.0 == 0 => break,
                    Ok(bits) => handle_alert(&adapter, handle, &counters, bits, recovery_delay).await,
                    Err(e) => {
                        warn!(error = %e, "alert monitor read failed, exiting");
                        break;
                    }
                }
            }
        }
        .instrument(info_span!("alert_monitor")),
    )
}

async fn handle_alert(
    adapter: &Arc<dyn Adapter>,
    handle: DriverHandle,
    counters: &Arc<AlertCounters>,
    bits: AlertBits,
    recovery_delay: Duration,
) {
    if bits.contains(AlertBits::BUS_OFF) {
        counters.bus_off_count.fetch_add(1, Ordering::Relaxed);
        counters.recovery_in_progress.store(true, Ordering::SeqCst);
        warn!("BUS_OFF observed, scheduling recovery");

        tokio::time::sleep(recovery_delay).await;

        if let Err(e) = adapter.initiate_recovery(handle).await {
            warn!(error = %e, "bus recovery initiation failed");
        }
    }

    if bits.contains(AlertBits::BUS_RECOVERED) {
        counters.recovery_in_progress.store(false, Ordering::SeqCst);
        info!("bus recovered");
    }

    if bits.contains(AlertBits::ERROR_PASSIVE) {
        counters.error_passive_count.fetch_add(1, Ordering::Relaxed);
    }

    if bits.contains(AlertBits::ERROR_WARNING_ABOVE) {
        counters.error_warning_count.fetch_add(1, Ordering::Relaxed);
    }

    if bits.contains(AlertBits::TX_SUCCESS) {
        counters
            .last_tx_result
            .store(LastTxResult::Success as u8, Ordering::Relaxed);
    } else if bits.contains(AlertBits::TX_FAILED) {
        counters
            .last_tx_result
            .store(LastTxResult::Failed as u8, Ordering::Relaxed);
    } else if bits.contains(AlertBits::TX_RETRIED) {
        counters
            .last_tx_result
            .store(LastTxResult::Retried as u8, Ordering::Relaxed);
    }

    if bits.contains(AlertBits::RX_QUEUE_FULL) {
        counters.rx_queue_full_count.fetch_add(1, Ordering::Relaxed);
    }

    if bits.contains(AlertBits::RX_FIFO_OVERRUN) {
        counters
            .rx_fifo_overrun_count
            .fetch_add(1, Ordering::Relaxed);
    }
}
