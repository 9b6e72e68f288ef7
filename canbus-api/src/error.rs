use std::fmt;

/// Enumerates all the errors that can be reported by the CAN bus
/// manager or by an `Adapter` implementation. New driver backends
/// should map their failures into one of these values; add a new
/// variant only when none of the existing ones are general enough.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// `register` couldn't allocate a client record.
    AllocError,

    /// A handle doesn't name a client in the active set. Covers both
    /// handles that were never issued and handles whose client has
    /// since been unregistered.
    InvalidHandle,

    /// `set_mode` would leave another activated client's requirement
    /// contradicted (an RX_ONLY demotion while a TX_ENABLED client is
    /// still active).
    ModeConflict,

    /// The operation requires the client to be registered, activated
    /// and in TX_ENABLED mode, and it wasn't.
    NotPermitted,

    /// `transmit` was attempted while no driver handle is installed.
    BusNotRunning,

    /// The controller reported BUS_OFF for this transmit, or entered
    /// BUS_OFF while the transmit was outstanding.
    BusOff,

    /// A transmit deadline elapsed without the adapter completing.
    Timeout,

    /// A frame failed `Frame::is_valid` (data too long, or a standard
    /// id out of the 11-bit range) and was rejected before the
    /// registry or adapter were ever consulted.
    InvalidFrame,

    /// A transmit failed for a reason the adapter couldn't classify
    /// more specifically. The string carries the adapter's own
    /// description.
    IoError(String),

    /// The state engine couldn't install the adapter with the chosen
    /// configuration. The bus is left stopped.
    AdapterInstallFailed(String),

    /// The state engine installed the adapter but it refused to
    /// start. The bus is left stopped (and uninstalled).
    AdapterStartFailed(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "could not allocate a client record"),
            Error::InvalidHandle => write!(f, "handle does not name a registered client"),
            Error::ModeConflict => write!(
                f,
                "mode change rejected: another activated client still requires TX"
            ),
            Error::NotPermitted => write!(
                f,
                "operation not permitted for this client's registration/mode"
            ),
            Error::BusNotRunning => write!(f, "bus is not running"),
            Error::BusOff => write!(f, "controller is in BUS_OFF"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::InvalidFrame => write!(f, "frame failed validation"),
            Error::IoError(detail) => write!(f, "transmit failed: {}", detail),
            Error::AdapterInstallFailed(detail) => {
                write!(f, "adapter install failed: {}", detail)
            }
            Error::AdapterStartFailed(detail) => {
                write!(f, "adapter start failed: {}", detail)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
