//! Target memory access: decomposes arbitrary requests into the aligned,
//! bounded transactions the probe accepts.

use std::thread;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::constants::{commands, MAXIMUM_WAIT_RETRIES, MAX_READ_WRITE_8, V3_MAX_READ_WRITE_8};
use crate::error::Error;
use crate::stlink::StLink;
use crate::transfer::{TransferContext, TransferDirection};
use crate::usb_interface::StLinkUsb;
use crate::version::Capabilities;

/// Access width of a memory transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryWidth {
    Bit8,
    Bit16,
    Bit32,
}

impl MemoryWidth {
    pub fn bytes(self) -> u32 {
        match self {
            MemoryWidth::Bit8 => 1,
            MemoryWidth::Bit16 => 2,
            MemoryWidth::Bit32 => 4,
        }
    }
}

/// Largest legal wide transfer at `address` given the target's
/// autoincrement page size.
pub(crate) fn max_block_size(autoincrement_page: u32, address: u32) -> u32 {
    let max = autoincrement_page - ((autoincrement_page - 1) & address);
    if max == 0 {
        4
    } else {
        max
    }
}

impl<D: StLinkUsb> StLink<D> {
    /// Per-transaction byte limit for 8-bit access.
    fn usb_block_size(&self) -> u32 {
        if self
            .capabilities()
            .contains(Capabilities::HAS_RW8_512BYTES)
        {
            V3_MAX_READ_WRITE_8
        } else {
            MAX_READ_WRITE_8
        }
    }

    /// Reads `count` elements of `width` starting at `addr`, appending the
    /// bytes to `sink`.
    ///
    /// Unaligned requests are served with an 8-bit head until `addr` is
    /// aligned; 16-bit requests silently fall back to 8-bit on firmware
    /// without 16-bit support. Wait statuses from the probe retry the failed
    /// slice with exponential backoff.
    pub fn read_mem(
        &mut self,
        mut addr: u32,
        width: MemoryWidth,
        count: u32,
        sink: &mut Buffer,
    ) -> Result<(), Error> {
        let mut width = width;
        let mut remaining = count * width.bytes();
        let mut retries: u32 = 0;

        // only V2J26 and later do 16-bit transfers
        if width == MemoryWidth::Bit16
            && !self.capabilities().contains(Capabilities::HAS_MEM_16BIT)
        {
            log::debug!("st-link does not support 16bit transfer");
            width = MemoryWidth::Bit8;
        }

        while remaining > 0 {
            let w = width.bytes();
            let cap = if width != MemoryWidth::Bit8 {
                max_block_size(self.max_mem_packet, addr)
            } else {
                self.usb_block_size()
            };
            let chunk = cap.min(remaining);

            let step = if width != MemoryWidth::Bit8 {
                if addr & (w - 1) != 0 {
                    // bring the address to alignment with an 8-bit head
                    let head = w - (addr & (w - 1));
                    log::debug!("read unaligned bytes");
                    self.usb_read_mem8(addr, head as u16, sink).map(|()| head)
                } else if chunk < w {
                    // short tail: one wide unit covers it, surplus dropped
                    let mut tmp = Buffer::new();
                    let result = match width {
                        MemoryWidth::Bit16 => self.usb_read_mem16(addr, w as u16, &mut tmp),
                        _ => self.usb_read_mem32(addr, w as u16, &mut tmp),
                    };
                    result.map(|()| {
                        sink.extend(&tmp.bytes()[..chunk as usize]);
                        chunk
                    })
                } else if chunk & (w - 1) != 0 {
                    // trailing bytes go at 8-bit granularity
                    let tail = chunk.min(self.usb_block_size());
                    self.usb_read_mem8(addr, tail as u16, sink).map(|()| tail)
                } else {
                    match width {
                        MemoryWidth::Bit16 => {
                            self.usb_read_mem16(addr, chunk as u16, sink).map(|()| chunk)
                        }
                        _ => self.usb_read_mem32(addr, chunk as u16, sink).map(|()| chunk),
                    }
                }
            } else {
                self.usb_read_mem8(addr, chunk as u16, sink).map(|()| chunk)
            };

            match step {
                Ok(advanced) => {
                    addr += advanced;
                    remaining -= advanced;
                    log::trace!("addr: {addr:08x}, remaining: {remaining}");
                }
                Err(e) if e.is_wait() && retries < MAXIMUM_WAIT_RETRIES => {
                    let delay = Duration::from_millis(1 << retries);
                    retries += 1;
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Writes `count` elements of `width` from `src` to target memory
    /// starting at `addr`. Same decomposition rules as [`read_mem`], except
    /// that tails are always written at 8-bit so no byte outside the request
    /// is touched.
    ///
    /// [`read_mem`]: StLink::read_mem
    pub fn write_mem(
        &mut self,
        mut addr: u32,
        width: MemoryWidth,
        count: u32,
        src: &[u8],
    ) -> Result<(), Error> {
        let mut width = width;
        let mut remaining = count * width.bytes();
        let mut position: usize = 0;
        let mut retries: u32 = 0;

        if (src.len() as u32) < remaining {
            return Err(Error::Config(format!(
                "write source holds {} bytes, request needs {}",
                src.len(),
                remaining
            )));
        }

        if width == MemoryWidth::Bit16
            && !self.capabilities().contains(Capabilities::HAS_MEM_16BIT)
        {
            log::debug!("set 16bit memory write to 8bit");
            width = MemoryWidth::Bit8;
        }

        while remaining > 0 {
            let w = width.bytes();
            let cap = if width != MemoryWidth::Bit8 {
                max_block_size(self.max_mem_packet, addr)
            } else {
                self.usb_block_size()
            };
            let chunk = cap.min(remaining);

            let step = if width != MemoryWidth::Bit8 {
                if addr & (w - 1) != 0 {
                    let head = w - (addr & (w - 1));
                    let slice = &src[position..position + head as usize];
                    self.usb_write_mem8(addr, head as u16, slice).map(|()| head)
                } else if chunk & (w - 1) != 0 || chunk < w {
                    let tail = chunk.min(self.usb_block_size());
                    let slice = &src[position..position + tail as usize];
                    self.usb_write_mem8(addr, tail as u16, slice).map(|()| tail)
                } else {
                    let slice = &src[position..position + chunk as usize];
                    match width {
                        MemoryWidth::Bit16 => {
                            self.usb_write_mem16(addr, chunk as u16, slice).map(|()| chunk)
                        }
                        _ => self.usb_write_mem32(addr, chunk as u16, slice).map(|()| chunk),
                    }
                }
            } else {
                let slice = &src[position..position + chunk as usize];
                self.usb_write_mem8(addr, chunk as u16, slice).map(|()| chunk)
            };

            match step {
                Ok(advanced) => {
                    addr += advanced;
                    remaining -= advanced;
                    position += advanced as usize;
                    log::trace!("addr: {addr:08x}, remaining: {remaining}");
                }
                Err(e) if e.is_wait() && retries < MAXIMUM_WAIT_RETRIES => {
                    let delay = Duration::from_millis(1 << retries);
                    retries += 1;
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    // ----- probe transactions -----------------------------------------------

    fn usb_read_mem8(&mut self, addr: u32, len: u16, sink: &mut Buffer) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_READMEM_8BIT);
        ctx.cmd.write_u32_le(addr);
        ctx.cmd.write_u16_le(len);

        // the probe answers a single-byte request with two bytes
        let wire_len = if len == 1 { 2 } else { len as usize };

        self.transfer_raw(&mut ctx, wire_len)?;

        // commit only after the status poll, so a retried slice is not
        // delivered twice
        self.get_rw_status()?;
        sink.extend(&ctx.data.bytes()[..len as usize]);
        Ok(())
    }

    fn usb_read_mem16(&mut self, addr: u32, len: u16, sink: &mut Buffer) -> Result<(), Error> {
        // data must be a multiple of 2 and half-word aligned
        if len % 2 != 0 || addr % 2 != 0 {
            return Err(Error::UnalignedAccess);
        }

        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_READMEM_16BIT);
        ctx.cmd.write_u32_le(addr);
        ctx.cmd.write_u16_le(len);

        self.transfer_raw(&mut ctx, len as usize)?;
        self.get_rw_status()?;
        sink.extend(ctx.data.bytes());
        Ok(())
    }

    fn usb_read_mem32(&mut self, addr: u32, len: u16, sink: &mut Buffer) -> Result<(), Error> {
        // data must be a multiple of 4 and word aligned
        if len % 4 != 0 || addr % 4 != 0 {
            return Err(Error::UnalignedAccess);
        }

        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_READMEM_32BIT);
        ctx.cmd.write_u32_le(addr);
        ctx.cmd.write_u16_le(len);

        self.transfer_raw(&mut ctx, len as usize)?;
        self.get_rw_status()?;
        sink.extend(ctx.data.bytes());
        Ok(())
    }

    fn usb_write_mem8(&mut self, addr: u32, len: u16, src: &[u8]) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Outgoing);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_WRITEMEM_8BIT);
        ctx.cmd.write_u32_le(addr);
        ctx.cmd.write_u16_le(len);
        ctx.data.extend(&src[..len as usize]);

        self.transfer_raw(&mut ctx, len as usize)?;

        self.get_rw_status()
    }

    fn usb_write_mem16(&mut self, addr: u32, len: u16, src: &[u8]) -> Result<(), Error> {
        if len % 2 != 0 || addr % 2 != 0 {
            return Err(Error::UnalignedAccess);
        }

        let mut ctx = TransferContext::new(TransferDirection::Outgoing);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_WRITEMEM_16BIT);
        ctx.cmd.write_u32_le(addr);
        ctx.cmd.write_u16_le(len);
        ctx.data.extend(&src[..len as usize]);

        self.transfer_raw(&mut ctx, len as usize)?;

        self.get_rw_status()
    }

    fn usb_write_mem32(&mut self, addr: u32, len: u16, src: &[u8]) -> Result<(), Error> {
        if len % 4 != 0 || addr % 4 != 0 {
            return Err(Error::UnalignedAccess);
        }

        let mut ctx = TransferContext::new(TransferDirection::Outgoing);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_WRITEMEM_32BIT);
        ctx.cmd.write_u32_le(addr);
        ctx.cmd.write_u16_le(len);
        ctx.data.extend(&src[..len as usize]);

        self.transfer_raw(&mut ctx, len as usize)?;

        self.get_rw_status()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::StLinkMode;
    use crate::fake_usb::{open_probe, FakeUsb, MemAccess};

    fn probe_v2j29() -> StLink<FakeUsb> {
        let mut fake = FakeUsb::new(2, 29, 5);
        for (i, byte) in fake.ram.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);
        probe.device_mut().transactions.clear();
        probe
    }

    #[test]
    fn max_block_size_respects_page_boundary() {
        assert_eq!(max_block_size(1024, 0x2000_0000), 1024);
        assert_eq!(max_block_size(1024, 0x2000_0001), 1023);
        assert_eq!(max_block_size(1024, 0x2000_03fc), 4);
        assert_eq!(max_block_size(4096, 0x2000_0ffc), 4);
        assert_eq!(max_block_size(1024, 0x2000_03ff), 1);
        assert_eq!(max_block_size(4096, 0x1fff_ffff), 1);
    }

    #[test]
    fn aligned_32bit_read_is_a_single_transaction() {
        let mut probe = probe_v2j29();
        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0010, MemoryWidth::Bit32, 4, &mut sink)
            .unwrap();

        assert_eq!(
            probe.device().transactions,
            vec![MemAccess::read(4, 0x2000_0010, 16)]
        );
        assert_eq!(sink.bytes(), &probe.device().ram[0x10..0x20]);
    }

    #[test]
    fn unaligned_32bit_read_gets_an_8bit_head() {
        let mut probe = probe_v2j29();
        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0001, MemoryWidth::Bit32, 1, &mut sink)
            .unwrap();

        // head of 3 bytes, then one wide unit for the remainder
        assert_eq!(
            probe.device().transactions,
            vec![
                MemAccess::read(1, 0x2000_0001, 3),
                MemAccess::read(4, 0x2000_0004, 4),
            ]
        );
        assert_eq!(sink.bytes(), &probe.device().ram[0x01..0x05]);
    }

    #[test]
    fn single_byte_read_requests_two_bytes() {
        let mut probe = probe_v2j29();
        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0005, MemoryWidth::Bit8, 1, &mut sink)
            .unwrap();

        assert_eq!(sink.bytes(), &[probe.device().ram[0x05]]);
        // the command still asks for one byte; the reply carried two
        assert_eq!(
            probe.device().transactions,
            vec![MemAccess::read(1, 0x2000_0005, 1)]
        );
        assert_eq!(probe.device().last_read_reply_len, 2);
    }

    #[test]
    fn large_8bit_read_is_split_by_usb_block_size() {
        let mut probe = probe_v2j29();
        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0000, MemoryWidth::Bit8, 100, &mut sink)
            .unwrap();

        assert_eq!(
            probe.device().transactions,
            vec![
                MemAccess::read(1, 0x2000_0000, 64),
                MemAccess::read(1, 0x2000_0040, 36),
            ]
        );
        assert_eq!(sink.len(), 100);
    }

    #[test]
    fn wide_read_respects_autoincrement_page() {
        let mut probe = probe_v2j29();
        // pre-J28 firmware would keep 1 KiB; force the Cortex-M3/M4 page
        assert_eq!(probe.max_mem_packet, 1 << 12);

        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0ff0, MemoryWidth::Bit32, 8, &mut sink)
            .unwrap();

        assert_eq!(
            probe.device().transactions,
            vec![
                MemAccess::read(4, 0x2000_0ff0, 16),
                MemAccess::read(4, 0x2000_1000, 16),
            ]
        );
    }

    #[test]
    fn sixteen_bit_falls_back_to_eight_without_capability() {
        // V2J25 lacks HAS_MEM_16BIT
        let fake = FakeUsb::new(2, 25, 5);
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);
        probe.device_mut().transactions.clear();

        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0000, MemoryWidth::Bit16, 4, &mut sink)
            .unwrap();

        assert_eq!(
            probe.device().transactions,
            vec![MemAccess::read(1, 0x2000_0000, 8)]
        );
    }

    #[test]
    fn sixteen_bit_used_when_supported() {
        let mut probe = probe_v2j29();
        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0002, MemoryWidth::Bit16, 4, &mut sink)
            .unwrap();

        assert_eq!(
            probe.device().transactions,
            vec![MemAccess::read(2, 0x2000_0002, 8)]
        );
        assert_eq!(sink.bytes(), &probe.device().ram[0x02..0x0a]);
    }

    #[test]
    fn wait_status_retries_the_slice() {
        let mut probe = probe_v2j29();
        probe.device_mut().rw_statuses.extend([0x10, 0x80]);

        let mut sink = crate::Buffer::new();
        probe
            .read_mem(0x2000_0000, MemoryWidth::Bit32, 1, &mut sink)
            .unwrap();

        // the slice was reissued after the wait
        assert_eq!(
            probe.device().transactions,
            vec![
                MemAccess::read(4, 0x2000_0000, 4),
                MemAccess::read(4, 0x2000_0000, 4),
            ]
        );
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn persistent_wait_surfaces_the_error() {
        let mut probe = probe_v2j29();
        probe
            .device_mut()
            .rw_statuses
            .extend(std::iter::repeat(0x14).take(32));

        let mut sink = crate::Buffer::new();
        let result = probe.read_mem(0x2000_0000, MemoryWidth::Bit32, 1, &mut sink);
        assert!(matches!(result, Err(Error::Wait(_))));
    }

    #[test]
    fn unaligned_write_uses_head_and_8bit_tail() {
        let mut probe = probe_v2j29();
        let data: Vec<u8> = (0..8).map(|i| 0xa0 + i).collect();
        probe
            .write_mem(0x2000_0102, MemoryWidth::Bit32, 2, &data)
            .unwrap();

        // 2-byte head, then the non-multiple remainder entirely at 8-bit;
        // nothing outside the request is written
        assert_eq!(
            probe.device().transactions,
            vec![
                MemAccess::write(1, 0x2000_0102, 2),
                MemAccess::write(1, 0x2000_0104, 6),
            ]
        );
        assert_eq!(&probe.device().ram[0x102..0x10a], &data[..]);
        assert_eq!(probe.device().ram[0x101], 0x01);
        assert_eq!(probe.device().ram[0x10a], 0x0a);
    }

    #[test]
    fn aligned_write_is_a_single_wide_transaction() {
        let mut probe = probe_v2j29();
        let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        probe
            .write_mem(0x2000_0200, MemoryWidth::Bit32, 2, &data)
            .unwrap();

        assert_eq!(
            probe.device().transactions,
            vec![MemAccess::write(4, 0x2000_0200, 8)]
        );
        assert_eq!(&probe.device().ram[0x200..0x208], &data[..]);
    }

    #[test]
    fn short_write_source_is_rejected() {
        let mut probe = probe_v2j29();
        let result = probe.write_mem(0x2000_0000, MemoryWidth::Bit32, 2, &[0u8; 4]);
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(probe.device().transactions.is_empty());
    }
}
