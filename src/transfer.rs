//! A single command/response exchange against the probe.

use crate::buffer::Buffer;
use crate::constants::{CMD_BUFFER_SIZE, CMD_SIZE_V2, DATA_BUFFER_SIZE};

/// Direction of the data phase of an exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TransferDirection {
    /// Data flows probe -> host.
    Incoming,
    /// Data flows host -> probe.
    Outgoing,
}

/// Buffers for one command exchange: the command frame under construction
/// and the data payload sent or received alongside it.
#[derive(Debug)]
pub(crate) struct TransferContext {
    direction: TransferDirection,
    pub cmd: Buffer,
    pub data: Buffer,
}

impl TransferContext {
    pub(crate) fn new(direction: TransferDirection) -> Self {
        TransferContext {
            direction,
            cmd: Buffer::with_capacity(CMD_BUFFER_SIZE),
            data: Buffer::with_capacity(DATA_BUFFER_SIZE),
        }
    }

    pub(crate) fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// The command bytes zero-padded to the fixed V2 frame length.
    pub(crate) fn frame(&self) -> [u8; CMD_SIZE_V2] {
        assert!(self.cmd.len() <= CMD_SIZE_V2);
        let mut padded = [0u8; CMD_SIZE_V2];
        padded[..self.cmd.len()].copy_from_slice(self.cmd.bytes());
        padded
    }
}
