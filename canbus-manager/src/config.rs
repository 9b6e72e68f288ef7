use canbus_api::Bitrate;
use serde::Deserialize;
use std::time::Duration;

fn def_tx_timeout_ms() -> u64 {
    100
}

fn def_snapshot_capacity() -> usize {
    8
}

fn def_bus_off_recovery_delay_ms() -> u64 {
    3_000
}

fn def_dispatcher_stop_patience_ms() -> u64 {
    500
}

/// Tunables for a `Manager` instance. `loopback` is only the
/// *initial* value of the runtime-mutable flag -- `Manager::set_loopback`
/// changes the live flag afterward.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub bitrate: Bitrate,

    #[serde(default)]
    pub loopback: bool,

    #[serde(default = "def_tx_timeout_ms")]
    pub tx_timeout_ms: u64,

    /// The snapshot fan-out cap: subscribers beyond this count are
    /// dropped for a given frame, with a counter incremented, never
    /// silently.
    #[serde(default = "def_snapshot_capacity")]
    pub snapshot_capacity: usize,

    #[serde(default = "def_bus_off_recovery_delay_ms")]
    pub bus_off_recovery_delay_ms: u64,

    /// How long the state engine waits for the dispatcher to report
    /// its own exit before force-stopping the driver to unblock a
    /// stuck `receive`.
    #[serde(default = "def_dispatcher_stop_patience_ms")]
    pub dispatcher_stop_patience_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            bitrate: Bitrate::default(),
            loopback: false,
            tx_timeout_ms: def_tx_timeout_ms(),
            snapshot_capacity: def_snapshot_capacity(),
            bus_off_recovery_delay_ms: def_bus_off_recovery_delay_ms(),
            dispatcher_stop_patience_ms: def_dispatcher_stop_patience_ms(),
        }
    }
}

impl ManagerConfig {
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn bus_off_recovery_delay(&self) -> Duration {
        Duration::from_millis(self.bus_off_recovery_delay_ms)
    }

    pub fn dispatcher_stop_patience(&self) -> Duration {
        Duration::from_millis(self.dispatcher_stop_patience_ms)
    }
}
