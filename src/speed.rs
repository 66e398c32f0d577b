//! Interface clock tables and selection.

use crate::constants::{commands, V3_MAX_FREQ_ENTRIES};
use crate::error::Error;
use crate::stlink::StLink;
use crate::transfer::{TransferContext, TransferDirection};
use crate::usb_interface::StLinkUsb;
use crate::version::Capabilities;

/// One selectable interface clock: speed in kHz and the divisor programmed
/// into the probe. Divisors never leave this module.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SpeedMapEntry {
    pub speed_khz: u32,
    pub(crate) divisor: u32,
}

const fn entry(speed_khz: u32, divisor: u32) -> SpeedMapEntry {
    SpeedMapEntry { speed_khz, divisor }
}

/// SWD clock table for V2 firmware.
pub(crate) const SWD_KHZ_TO_SPEED_MAP: [SpeedMapEntry; 12] = [
    entry(4000, 0),
    entry(1800, 1), // default
    entry(1200, 2),
    entry(950, 3),
    entry(480, 7),
    entry(240, 15),
    entry(125, 31),
    entry(100, 40),
    entry(50, 79),
    entry(25, 158),
    entry(15, 265),
    entry(5, 798),
];

/// JTAG clock table for V2 firmware.
pub(crate) const JTAG_KHZ_TO_SPEED_MAP: [SpeedMapEntry; 7] = [
    entry(9000, 4),
    entry(4500, 8),
    entry(2250, 16),
    entry(1125, 32), // default
    entry(562, 64),
    entry(281, 128),
    entry(140, 256),
];

/// Selects the entry with the largest speed not above `khz`. Zeroed entries
/// (unused slots of the V3 dynamic table) are skipped. If the request is
/// below the slowest entry, the slowest is chosen. The flag reports whether
/// the chosen speed matches the request exactly.
pub(crate) fn match_speed_map(map: &[SpeedMapEntry], khz: u32) -> Option<(usize, bool)> {
    let mut best: Option<usize> = None;
    let mut slowest: Option<usize> = None;

    for (i, entry) in map.iter().enumerate() {
        if entry.speed_khz == 0 {
            continue;
        }
        if slowest.map_or(true, |s| entry.speed_khz < map[s].speed_khz) {
            slowest = Some(i);
        }
        if entry.speed_khz <= khz
            && best.map_or(true, |b| entry.speed_khz > map[b].speed_khz)
        {
            best = Some(i);
        }
    }

    match best {
        Some(i) => Some((i, map[i].speed_khz == khz)),
        None => slowest.map(|i| (i, false)),
    }
}

pub(crate) fn dump_speed_map(map: &[SpeedMapEntry]) {
    for entry in map {
        if entry.speed_khz > 0 {
            log::debug!("{} kHz", entry.speed_khz);
        }
    }
}

impl<D: StLinkUsb> StLink<D> {
    pub(crate) fn set_speed_swd(&mut self, khz: u32, query: bool) -> Result<(u32, bool), Error> {
        // old firmware cannot change it
        if !self.capabilities().contains(Capabilities::HAS_SWD_SET_FREQ) {
            return Err(Error::NotSupported(
                "this firmware cannot change the SWD clock",
            ));
        }

        let (index, exact) = match_speed_map(&SWD_KHZ_TO_SPEED_MAP, khz)
            .expect("static speed map is never empty");
        let chosen = SWD_KHZ_TO_SPEED_MAP[index];

        if !exact && query {
            log::info!(
                "no exact match for requested speed {} kHz, using {} kHz",
                khz,
                chosen.speed_khz
            );
        }

        if !query {
            self.set_swd_clock_divisor(chosen.divisor as u16)?;
        }

        Ok((chosen.speed_khz, exact))
    }

    pub(crate) fn set_speed_jtag(&mut self, khz: u32, query: bool) -> Result<(u32, bool), Error> {
        if !self.capabilities().contains(Capabilities::HAS_JTAG_SET_FREQ) {
            return Err(Error::NotSupported(
                "this firmware cannot change the JTAG clock",
            ));
        }

        let (index, exact) = match_speed_map(&JTAG_KHZ_TO_SPEED_MAP, khz)
            .expect("static speed map is never empty");
        let chosen = JTAG_KHZ_TO_SPEED_MAP[index];

        if !exact && query {
            log::info!(
                "no exact match for requested speed {} kHz, using {} kHz",
                khz,
                chosen.speed_khz
            );
        }

        if !query {
            self.set_jtag_clock_divisor(chosen.divisor as u16)?;
        }

        Ok((chosen.speed_khz, exact))
    }

    pub(crate) fn set_speed_v3(
        &mut self,
        is_jtag: bool,
        khz: u32,
        query: bool,
    ) -> Result<(u32, bool), Error> {
        let map = self.get_com_freq(is_jtag)?;

        let (index, exact) = match_speed_map(&map, khz).ok_or_else(|| {
            Error::Protocol("probe reported an empty frequency table".to_string())
        })?;
        let chosen = map[index];

        if !exact && query {
            log::info!(
                "no exact match for requested speed {} kHz, using {} kHz",
                khz,
                chosen.speed_khz
            );
        }

        if !query {
            self.set_com_freq(is_jtag, chosen.speed_khz)?;
        }

        Ok((chosen.speed_khz, exact))
    }

    fn set_swd_clock_divisor(&mut self, divisor: u16) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::SWD_SET_FREQ);
        ctx.cmd.write_u16_le(divisor);
        self.command_with_retry(&mut ctx, 2)
    }

    fn set_jtag_clock_divisor(&mut self, divisor: u16) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_SET_FREQ);
        ctx.cmd.write_u16_le(divisor);
        self.command_with_retry(&mut ctx, 2)
    }

    /// Fetches the dynamic frequency table from a V3 probe.
    ///
    /// Response layout: status at 0, current frequency at 4, entry count at
    /// 8, then up to ten frequencies in kHz from offset 12.
    pub(crate) fn get_com_freq(&mut self, is_jtag: bool) -> Result<Vec<SpeedMapEntry>, Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::GET_COM_FREQ);
        ctx.cmd.write_u8(if is_jtag {
            commands::JTAG_STLINK_JTAG_COM
        } else {
            commands::JTAG_STLINK_SWD_COM
        });
        self.transfer_checked(&mut ctx, 52)?;

        let count = (ctx.data.bytes()[8] as usize).min(V3_MAX_FREQ_ENTRIES);
        let mut map = Vec::with_capacity(count);
        for i in 0..count {
            map.push(SpeedMapEntry {
                speed_khz: ctx.data.read_u32_le(12 + 4 * i)?,
                divisor: i as u32,
            });
        }

        Ok(map)
    }

    fn set_com_freq(&mut self, is_jtag: bool, khz: u32) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::SET_COM_FREQ);
        ctx.cmd.write_u8(if is_jtag {
            commands::JTAG_STLINK_JTAG_COM
        } else {
            commands::JTAG_STLINK_SWD_COM
        });
        ctx.cmd.write_u8(0);
        ctx.cmd.write_u32_le(khz);
        self.transfer_checked(&mut ctx, 8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_match() {
        let (i, exact) = match_speed_map(&SWD_KHZ_TO_SPEED_MAP, 1800).unwrap();
        assert_eq!(SWD_KHZ_TO_SPEED_MAP[i].speed_khz, 1800);
        assert!(exact);
    }

    #[test]
    fn nearest_lower_match() {
        let (i, exact) = match_speed_map(&SWD_KHZ_TO_SPEED_MAP, 2000).unwrap();
        assert_eq!(SWD_KHZ_TO_SPEED_MAP[i].speed_khz, 1800);
        assert!(!exact);

        let (i, exact) = match_speed_map(&JTAG_KHZ_TO_SPEED_MAP, 5000).unwrap();
        assert_eq!(JTAG_KHZ_TO_SPEED_MAP[i].speed_khz, 4500);
        assert!(!exact);
    }

    #[test]
    fn below_slowest_falls_back_to_slowest() {
        let (i, exact) = match_speed_map(&SWD_KHZ_TO_SPEED_MAP, 1).unwrap();
        assert_eq!(SWD_KHZ_TO_SPEED_MAP[i].speed_khz, 5);
        assert!(!exact);

        let (i, exact) = match_speed_map(&JTAG_KHZ_TO_SPEED_MAP, 100).unwrap();
        assert_eq!(JTAG_KHZ_TO_SPEED_MAP[i].speed_khz, 140);
        assert!(!exact);
    }

    #[test]
    fn zero_entries_are_skipped() {
        let map = [entry(0, 0), entry(4000, 1), entry(0, 2), entry(100, 3)];
        let (i, exact) = match_speed_map(&map, 500).unwrap();
        assert_eq!(map[i].speed_khz, 100);
        assert!(!exact);
    }

    #[test]
    fn empty_map_matches_nothing() {
        assert!(match_speed_map(&[], 1000).is_none());
        assert!(match_speed_map(&[entry(0, 0)], 1000).is_none());
    }
}
