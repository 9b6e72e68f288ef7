use serde::Deserialize;

/// A client's declared demand on the bus. Only `TxEnabled` clients
/// contribute to the NORMAL/NO_ACK threshold; both variants
/// contribute to the LISTEN_ONLY threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    RxOnly,
    TxEnabled,
}

/// The controller's actual operating mode, derived by the state
/// engine from the aggregate of all activated clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    /// No client requires the bus; the driver is uninstalled.
    Stopped,
    /// At least one client is activated but none require TX.
    ListenOnly,
    /// At least one TX_ENABLED client is activated and loopback is off.
    Normal,
    /// At least one TX_ENABLED client is activated and loopback is on.
    NoAck,
}

impl BusMode {
    pub fn is_running(self) -> bool {
        !matches!(self, BusMode::Stopped)
    }
}

/// Nominal bitrates the adapter knows how to build timing tables for.
/// The adapter is responsible only for turning this into the
/// vendor-specific timing registers; the manager just passes it
/// through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bitrate {
    Kbit125,
    Kbit250,
    Kbit500,
    Kbit1000,
}

impl Default for Bitrate {
    fn default() -> Self {
        Bitrate::Kbit500
    }
}
