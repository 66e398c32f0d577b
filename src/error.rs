use crate::constants::Status;
use thiserror::Error;

/// Errors produced by probe operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Any USB I/O or deadline failure. Never retried; propagates.
    #[error("USB transport error: {0}")]
    Usb(#[from] rusb::Error),

    /// The probe asked for a retry. Absorbed only by the command engine's
    /// retry loop and the memory planner's per-slice retry.
    #[error("probe busy: {0}")]
    Wait(Status),

    /// Non-retryable protocol error reported by the probe.
    #[error("command failed: {0}")]
    CommandFailed(Status),

    /// A memory access violated the per-width alignment rules.
    #[error("invalid data alignment")]
    UnalignedAccess,

    /// The probe firmware lacks the capability for the attempted operation.
    #[error("not supported by this probe: {0}")]
    NotSupported(&'static str),

    /// Response too short or a sentinel mismatched.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// Contradictory or out-of-range inputs at the API boundary.
    #[error("{0}")]
    Config(String),

    #[error("no ST-Link matching the given parameters was found")]
    ProbeNotFound,

    #[error("more than one matching ST-Link found, disambiguate with a serial number")]
    MultipleProbesFound,

    #[error("USB endpoint not found")]
    EndpointNotFound,

    #[error("not enough bytes read: got {is}, expected {should}")]
    NotEnoughBytesRead { is: usize, should: usize },

    #[error("not enough bytes written: wrote {is}, expected {should}")]
    NotEnoughBytesWritten { is: usize, should: usize },

    #[error("invalid voltage values returned by probe")]
    VoltageDivisionByZero,

    #[error("probe is in an unknown mode")]
    UnknownMode,
}

impl Error {
    /// True when the error is a wait status the caller may retry.
    pub fn is_wait(&self) -> bool {
        matches!(self, Error::Wait(_))
    }
}
