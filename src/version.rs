//! Firmware version parsing and capability derivation.

use bitflags::bitflags;
use std::fmt;

/// Command API generation spoken by the probe firmware.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ApiVersion {
    /// Only ST-Link/V1 below J11; never used for SWD.
    V1,
    #[default]
    V2,
    V3,
}

bitflags! {
    /// Feature bits derived from the firmware version during open.
    /// Frozen for the lifetime of the probe handle afterwards.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// Trace capture and target voltage readout, from V2J13.
        const HAS_TRACE = 1 << 0;
        /// Preferred API to get the last R/W status, from V2J15.
        const HAS_GETLASTRWSTATUS2 = 1 << 1;
        /// SWD clock control, from V2J22.
        const HAS_SWD_SET_FREQ = 1 << 2;
        /// JTAG clock control, from V2J24.
        const HAS_JTAG_SET_FREQ = 1 << 3;
        /// DAP register access commands, from V2J24.
        const HAS_DAP_REG = 1 << 4;
        /// DP reads in JTAG mode are unreliable between V2J24 and V2J32.
        const QUIRK_JTAG_DP_READ = 1 << 5;
        /// 16-bit memory access, from V2J26.
        const HAS_MEM_16BIT = 1 << 6;
        /// Access ports must be initialized before use, from V2J28.
        const HAS_AP_INIT = 1 << 7;
        /// Proper error code on close AP, from V2J29.
        const FIX_CLOSE_AP = 1 << 8;
        /// Banked DP register support, from V2J32 / V3J2.
        const HAS_DP_BANKSEL = 1 << 9;
        /// 512-byte 8-bit memory packets, from V3J6.
        const HAS_RW8_512BYTES = 1 << 10;
        /// Target voltage readout arrived together with trace support.
        const HAS_TARGET_VOLT = 1 << 0;
    }
}

/// Parsed probe firmware version.
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub major: u8,
    pub jtag: u8,
    pub swim: u8,
    pub msd: u8,
    pub bridge: u8,
    pub api: ApiVersion,
    pub flags: Capabilities,
}

impl Version {
    /// Fills in the API generation and capability bits from the version
    /// counters. Called once per open; the result never changes afterwards.
    pub(crate) fn derive_capabilities(&mut self) {
        self.api = match self.major {
            1 if self.jtag >= 11 => ApiVersion::V2,
            1 => ApiVersion::V1,
            3 => ApiVersion::V3,
            _ => ApiVersion::V2,
        };

        let mut flags = Capabilities::empty();

        match self.major {
            2 => {
                // API for trace and for target voltage from J13
                if self.jtag >= 13 {
                    flags |= Capabilities::HAS_TRACE;
                }
                // preferred API to get last R/W status from J15
                if self.jtag >= 15 {
                    flags |= Capabilities::HAS_GETLASTRWSTATUS2;
                }
                // API to set SWD frequency from J22
                if self.jtag >= 22 {
                    flags |= Capabilities::HAS_SWD_SET_FREQ;
                }
                // API to set JTAG frequency and access DAP registers from J24
                if self.jtag >= 24 {
                    flags |= Capabilities::HAS_JTAG_SET_FREQ;
                    flags |= Capabilities::HAS_DAP_REG;
                }
                // quirk for DP reads in JTAG mode from J24, fixed in J32
                if self.jtag >= 24 && self.jtag < 32 {
                    flags |= Capabilities::QUIRK_JTAG_DP_READ;
                }
                // API to read/write memory at 16 bit from J26
                if self.jtag >= 26 {
                    flags |= Capabilities::HAS_MEM_16BIT;
                }
                // API required to init AP before any AP access from J28
                if self.jtag >= 28 {
                    flags |= Capabilities::HAS_AP_INIT;
                }
                // API required to return proper error code on close AP from J29
                if self.jtag >= 29 {
                    flags |= Capabilities::FIX_CLOSE_AP;
                }
                // banked regs (DPv1 & DPv2) support from V2J32
                if self.jtag >= 32 {
                    flags |= Capabilities::HAS_DP_BANKSEL;
                }
            }
            3 => {
                // STLINK-V3 is a superset of ST-LINK/V2
                flags |= Capabilities::HAS_TRACE
                    | Capabilities::HAS_GETLASTRWSTATUS2
                    | Capabilities::HAS_DAP_REG
                    | Capabilities::HAS_MEM_16BIT
                    | Capabilities::HAS_AP_INIT
                    | Capabilities::FIX_CLOSE_AP;

                if self.jtag >= 2 {
                    flags |= Capabilities::HAS_DP_BANKSEL;
                }
                if self.jtag >= 6 {
                    flags |= Capabilities::HAS_RW8_512BYTES;
                }
            }
            _ => {}
        }

        self.flags = flags;
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.major)?;
        if self.jtag > 0 || self.msd != 0 {
            write!(f, "J{}", self.jtag)?;
        }
        if self.msd > 0 {
            write!(f, "M{}", self.msd)?;
        }
        if self.bridge > 0 {
            write!(f, "B{}", self.bridge)?;
        }
        Ok(())
    }
}

/// Splits the big-endian GET_VERSION word into (major, minor_a, minor_b).
pub(crate) fn split_version_word(word: u16) -> (u8, u8, u8) {
    const MAJOR_SHIFT: u16 = 12;
    const MAJOR_MASK: u16 = 0x0f;
    const MINOR_SHIFT: u16 = 6;
    const MINOR_MASK: u16 = 0x3f;

    (
        ((word >> MAJOR_SHIFT) & MAJOR_MASK) as u8,
        ((word >> MINOR_SHIFT) & MINOR_MASK) as u8,
        (word & MINOR_MASK) as u8,
    )
}

/// Maps the two packed minor counters onto (jtag, swim, msd).
///
/// On the V2.1 products the firmware reuses the minor fields: certain
/// combinations encode the mass-storage version instead of the JTAG one.
pub(crate) fn reinterpret_minors(pid: u16, minor_a: u8, minor_b: u8) -> (u8, u8, u8) {
    const STLINK_V21_PID: u16 = 0x374b;
    const STLINK_V21_NO_MSD_PID: u16 = 0x3752;

    match pid {
        STLINK_V21_PID | STLINK_V21_NO_MSD_PID => {
            if (minor_a <= 22 && minor_b == 7) || (minor_a >= 25 && (7..=12).contains(&minor_b)) {
                (0, minor_b, minor_a)
            } else {
                (minor_a, 0, minor_b)
            }
        }
        _ => (minor_a, minor_b, 0),
    }
}
