//! The long-running task that pulls frames from the adapter and fans
//! them out to every activated subscriber.

use crate::registry::Registry;
use canbus_api::{Adapter, DriverHandle, ReceiveOutcome};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn};
use tracing_futures::Instrument;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A `Notify`-backed stop signal. The dispatcher's `receive` call uses
/// a short timeout so it reliably observes `requested` within one
/// iteration even when the notify doesn't fire mid-receive.
#[derive(Default)]
pub(crate) struct DispatcherStop {
    requested: AtomicBool,
    notify: Notify,
}

impl DispatcherStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Spawns the dispatcher task. Exits when `stop` is requested, or
/// when the adapter reports `InvalidState` (the driver was stopped
/// out from under it), or on a hard adapter error.
pub(crate) fn spawn(
    registry: Arc<Registry>,
    adapter: Arc<dyn Adapter>,
    handle: DriverHandle,
    stop: Arc<DispatcherStop>,
    capacity: usize,
    dropped_subscribers: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            debug!("dispatcher starting");

            loop {
                if stop.is_requested() {
                    break;
                }

                registry.reclaim_pending();

                match adapter.receive(handle, POLL_TIMEOUT).await {
                    Ok(ReceiveOutcome::Timeout) => continue,
                    Ok(ReceiveOutcome::InvalidState) => {
                        debug!("adapter reports invalid state, exiting");
                        break;
                    }
                    Ok(ReceiveOutcome::Frame(frame)) => {
                        let (snapshots, dropped) =
                            registry.snapshot_for_dispatch(capacity);

                        if dropped > 0 {
                            dropped_subscribers
                                .fetch_add(dropped as u64, Ordering::Relaxed);
                            warn!(
                                dropped,
                                "snapshot buffer full, dropping subscribers for this frame"
                            );
                        }

                        for snapshot in snapshots {
                            (snapshot.callback)(&frame);
                            // `snapshot` (and its refcount clone) is
                            // dropped here, immediately after the
                            // callback returns.
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "dispatcher receive failed, exiting");
                        break;
                    }
                }
            }

            registry.reclaim_pending();
            debug!("dispatcher exiting");
        }
        .instrument(info_span!("dispatcher")),
    )
}
