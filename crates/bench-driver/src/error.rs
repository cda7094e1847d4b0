//! Error types at the transport and driver boundary (spec.md §7).

use thiserror::Error;

/// Errors raised by `Transport` (spec.md §4.1).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected: {cause}")]
    Disconnected { cause: String },

    #[error("query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("link I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, TransportError::Disconnected { .. })
    }
}

/// Errors raised by a `Driver`/`ScopeDriver` implementation. A transport
/// failure is carried through unchanged so `DeviceSession` can tell a link
/// failure from a driver-level protocol violation (spec.md §7: "the
/// transport failed or the device returned an unparseable/invalid reply").
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unparseable reply from instrument: {0}")]
    InvalidReply(String),

    #[error("value {value} out of range [{min}, {max}] for {name}")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("operation not supported by this driver: {0}")]
    Unsupported(String),
}
