//! Command bytes, status codes and fixed protocol sizes for the V2 family
//! of ST-Link probes.

use std::fmt;

pub mod commands {
    // Command groups (byte 0 of the command frame).
    pub const GET_VERSION: u8 = 0xf1;
    pub const DEBUG_COMMAND: u8 = 0xf2;
    pub const DFU_COMMAND: u8 = 0xf3;
    pub const SWIM_COMMAND: u8 = 0xf4;
    pub const GET_CURRENT_MODE: u8 = 0xf5;
    pub const GET_TARGET_VOLTAGE: u8 = 0xf7;
    pub const GET_VERSION_EXT: u8 = 0xfb;

    // Commands to exit other modes.
    pub const DFU_EXIT: u8 = 0x07;
    pub const SWIM_EXIT: u8 = 0x01;

    // Debug sub-commands.
    pub const JTAG_READMEM_32BIT: u8 = 0x07;
    pub const JTAG_WRITEMEM_32BIT: u8 = 0x08;
    pub const JTAG_READMEM_8BIT: u8 = 0x0c;
    pub const JTAG_WRITEMEM_8BIT: u8 = 0x0d;
    pub const JTAG_EXIT: u8 = 0x21;

    // The following sub-commands are from version 2 of the API.
    pub const JTAG_ENTER2: u8 = 0x30;
    pub const JTAG_READ_IDCODES: u8 = 0x31;
    pub const JTAG_GETLASTRWSTATUS: u8 = 0x3b;
    pub const JTAG_DRIVE_NRST: u8 = 0x3c;
    pub const JTAG_GETLASTRWSTATUS2: u8 = 0x3e; // From V2J15
    pub const SWO_START_TRACE_RECEPTION: u8 = 0x40;
    pub const SWO_STOP_TRACE_RECEPTION: u8 = 0x41;
    pub const SWO_GET_TRACE_NEW_RECORD_NB: u8 = 0x42;
    pub const SWD_SET_FREQ: u8 = 0x43; // From V2J20
    pub const JTAG_SET_FREQ: u8 = 0x44; // From V2J24
    pub const JTAG_READMEM_16BIT: u8 = 0x47; // From V2J26
    pub const JTAG_WRITEMEM_16BIT: u8 = 0x48; // From V2J26
    pub const JTAG_INIT_AP: u8 = 0x4b; // From V2J28
    pub const SET_COM_FREQ: u8 = 0x61; // V3 only, replaces SWD/JTAG_SET_FREQ
    pub const GET_COM_FREQ: u8 = 0x62; // V3 only

    // Parameters for JTAG_ENTER2.
    pub const JTAG_ENTER_SWD_NO_RESET: u8 = 0xa3;
    pub const JTAG_ENTER_JTAG_NO_RESET: u8 = 0xa4;

    // Parameters for JTAG_DRIVE_NRST.
    pub const JTAG_DRIVE_NRST_LOW: u8 = 0x00;
    pub const JTAG_DRIVE_NRST_HIGH: u8 = 0x01;
    pub const JTAG_DRIVE_NRST_PULSE: u8 = 0x02;

    // Parameters for SET_COM_FREQ and GET_COM_FREQ.
    pub const JTAG_STLINK_SWD_COM: u8 = 0x00;
    pub const JTAG_STLINK_JTAG_COM: u8 = 0x01;
}

/// The length of the fixed command frame sent ahead of every V2-family
/// exchange. Shorter requests are zero-padded up to this size.
pub const CMD_SIZE_V2: usize = 16;

/// Initial capacity of a transfer's command buffer.
pub const CMD_BUFFER_SIZE: usize = 31;

/// Initial capacity of a transfer's data buffer.
pub const DATA_BUFFER_SIZE: usize = 4096;

/// Total number of transfers `command_with_retry` may issue for one command.
pub const MAXIMUM_WAIT_RETRIES: u32 = 8;

/// Highest valid debug access port selector.
pub const AP_SELECTION_MAXIMUM: u16 = 255;

/// ARM Cortex-M CPUID register address.
pub const CPUID_BASE_REGISTER: u32 = 0xe000_ed00;

/// Per-transaction byte limit for 8-bit memory access.
pub const MAX_READ_WRITE_8: u32 = 64;
/// Raised 8-bit limit on V3 firmware from J6.
pub const V3_MAX_READ_WRITE_8: u32 = 512;

/// Maximum number of entries in the V3 dynamic frequency table.
pub const V3_MAX_FREQ_ENTRIES: usize = 10;

/// Size of the probe-side trace FIFO handed to SWO_START_TRACE_RECEPTION.
pub const TRACE_SIZE: u16 = 4096;
/// Highest supported trace capture frequency.
pub const TRACE_MAX_HZ: u32 = 2_000_000;
/// Largest TPIU asynchronous prescaler value.
pub const TPIU_ACPR_MAX_SWO_SCALER: u32 = 0x1fff;

// SWIM status bytes; the SWIM transport itself is not implemented, but the
// decoder keeps the mapping so SWIM-mode responses classify correctly.
pub const SWIM_STATUS_OK: u8 = 0x00;
pub const SWIM_STATUS_BUSY: u8 = 0x01;

/// Status codes carried in the first byte of a debug-mode response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    JtagOk,
    JtagUnknownError,
    JtagSpiError,
    JtagDmaError,
    JtagUnknownJtagChain,
    JtagNoDeviceConnected,
    JtagInternalError,
    JtagCmdWait,
    JtagCmdError,
    JtagGetIdcodeError,
    JtagAlignmentError,
    JtagDbgPowerError,
    JtagWriteError,
    JtagWriteVerifError,
    JtagAlreadyOpenedInOtherMode,
    SwdFault,
    SwdApWait,
    SwdApFault,
    SwdApError,
    SwdApParityError,
    SwdDpWait,
    SwdDpFault,
    SwdDpError,
    SwdDpParityError,
    SwdApWdataError,
    SwdApStickyError,
    SwdApStickyorunError,
    BadApError,
    SwoNotAvailable,
    JtagFreqNotSupported,
    JtagUnknownCmd,
    Other(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Status {
        match value {
            0x80 => Self::JtagOk,
            0x81 => Self::SwdFault,
            0x01 => Self::JtagUnknownError,
            0x02 => Self::JtagSpiError,
            0x03 => Self::JtagDmaError,
            0x04 => Self::JtagUnknownJtagChain,
            0x05 => Self::JtagNoDeviceConnected,
            0x06 => Self::JtagInternalError,
            0x07 => Self::JtagCmdWait,
            0x08 => Self::JtagCmdError,
            0x09 => Self::JtagGetIdcodeError,
            0x0a => Self::JtagAlignmentError,
            0x0b => Self::JtagDbgPowerError,
            0x0c => Self::JtagWriteError,
            0x0d => Self::JtagWriteVerifError,
            0x0e => Self::JtagAlreadyOpenedInOtherMode,
            0x10 => Self::SwdApWait,
            0x11 => Self::SwdApFault,
            0x12 => Self::SwdApError,
            0x13 => Self::SwdApParityError,
            0x14 => Self::SwdDpWait,
            0x15 => Self::SwdDpFault,
            0x16 => Self::SwdDpError,
            0x17 => Self::SwdDpParityError,
            0x18 => Self::SwdApWdataError,
            0x19 => Self::SwdApStickyError,
            0x1a => Self::SwdApStickyorunError,
            0x1d => Self::BadApError,
            0x20 => Self::SwoNotAvailable,
            0x41 => Self::JtagFreqNotSupported,
            0x42 => Self::JtagUnknownCmd,
            v => Self::Other(v),
        }
    }
}

impl Status {
    /// Whether this status asks the host to retry the command.
    pub fn is_wait(self) -> bool {
        matches!(self, Status::SwdApWait | Status::SwdDpWait)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::JtagOk => write!(f, "ok"),
            Status::SwdFault => write!(f, "SWD fault response (0x81)"),
            Status::SwdApWait => write!(f, "wait status SWD_AP_WAIT (0x10)"),
            Status::SwdDpWait => write!(f, "wait status SWD_DP_WAIT (0x14)"),
            Status::JtagGetIdcodeError => write!(f, "JTAG IDCODE read error"),
            Status::JtagWriteError => write!(f, "write error"),
            Status::JtagWriteVerifError => write!(f, "write verify error"),
            Status::Other(v) => write!(f, "unknown/unexpected status code 0x{v:02x}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Operating mode reported by GET_CURRENT_MODE.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceMode {
    Dfu,
    MassStorage,
    Debug,
    Swim,
    Bootloader,
    Unknown(u8),
}

impl From<u8> for DeviceMode {
    fn from(value: u8) -> DeviceMode {
        match value {
            0x00 => Self::Dfu,
            0x01 => Self::MassStorage,
            0x02 => Self::Debug,
            0x03 => Self::Swim,
            0x04 => Self::Bootloader,
            v => Self::Unknown(v),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Dfu => write!(f, "DFU"),
            DeviceMode::MassStorage => write!(f, "mass storage"),
            DeviceMode::Debug => write!(f, "debug mode"),
            DeviceMode::Swim => write!(f, "swim mode"),
            DeviceMode::Bootloader => write!(f, "bootloader mode"),
            DeviceMode::Unknown(v) => write!(f, "unknown (0x{v:02x})"),
        }
    }
}

/// Transport selected by the caller when opening a probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StLinkMode {
    Unknown,
    Dfu,
    Mass,
    DebugJtag,
    DebugSwd,
    DebugSwim,
}

impl StLinkMode {
    /// Maps a device-reported mode onto the transport to leave before
    /// switching. Mass storage and bootloader have no exit command.
    pub(crate) fn leave_target(device_mode: DeviceMode) -> StLinkMode {
        match device_mode {
            DeviceMode::Dfu => StLinkMode::Dfu,
            DeviceMode::Debug => StLinkMode::DebugSwd,
            DeviceMode::Swim => StLinkMode::DebugSwim,
            _ => StLinkMode::Unknown,
        }
    }
}
