//! Host side of the SEGGER RTT protocol.
//!
//! RTT implements output from a microcontroller using in-memory ring
//! buffers and memory polling, enabling debug logging from the target with
//! minimal delays and no blocking. The target keeps a control block in RAM;
//! this module scans for it, snapshots the channel descriptors and drains
//! up-channel data through the probe's memory access, writing the consumed
//! read offset back into target RAM.
//!
//! The timing of [`Rtt::attach`] matters: it only succeeds once the target
//! firmware has initialized the control block. Attaching too early (for
//! example while the target is halted before its RTT init code ran) fails
//! with [`RttError::ControlBlockNotFound`].

use crate::buffer::Buffer;
use crate::error::Error;
use crate::memory::MemoryWidth;
use crate::stlink::StLink;
use crate::usb_interface::StLinkUsb;

/// RAM base address of most STM32 parts, a convenient default scan origin.
pub const DEFAULT_RAM_START: u32 = 0x2000_0000;

/// The identifier the target writes at the start of the control block. Only
/// the ten-byte prefix is significant; the remaining bytes are zero padding.
const RTT_ID: &[u8] = b"SEGGER RTT";

/// Size of the control-block header in target memory.
const CONTROL_BLOCK_SIZE: u32 = 24;
/// Size of one channel descriptor in target memory.
const CHANNEL_DESCRIPTOR_SIZE: u32 = 24;
/// Offset of the read-offset field inside a channel descriptor.
const CHANNEL_RD_OFF_OFFSET: u32 = 16;

/// How many bytes of a channel name are fetched from the target.
const CHANNEL_NAME_READ_LEN: u32 = 64;

/// Error type for RTT operations.
#[derive(Debug, thiserror::Error)]
pub enum RttError {
    /// No control block in the scanned ranges. Make sure RTT is initialized
    /// on the target before attaching.
    #[error("RTT control block not found in the scanned RAM ranges")]
    ControlBlockNotFound,

    /// The control block advertises no up or down channels.
    #[error("could not find up or down channels in the control block")]
    NoChannels,

    /// A channel descriptor carries offsets outside its own buffer.
    #[error("control block corrupted: {0}")]
    ControlBlockCorrupted(String),

    /// Wraps errors propagated up from the probe.
    #[error("error communicating with probe: {0}")]
    Probe(#[from] Error),
}

/// Snapshot of one channel descriptor, refreshed by
/// [`Rtt::update_channels`].
#[derive(Debug, Default, Clone)]
pub struct RttChannel {
    pub name_ptr: u32,
    pub buffer_ptr: u32,
    pub size: u32,
    pub write_off: u32,
    pub read_off: u32,
    pub flags: u32,
    /// NUL-terminated name read from the target, when requested.
    pub name: Option<String>,
}

/// The RTT engine attached to one discovered control block.
#[derive(Debug)]
pub struct Rtt {
    ram_start: u32,
    offset: u32,
    max_up_channels: u32,
    max_down_channels: u32,
    channels: Vec<RttChannel>,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Rtt {
    /// Scans the given `(start, size)` RAM ranges for a control block and
    /// returns an engine attached to the first hit.
    pub fn attach<D: StLinkUsb>(
        probe: &mut StLink<D>,
        ranges: &[(u32, u32)],
    ) -> Result<Rtt, RttError> {
        for &(ram_start, range_size) in ranges {
            log::debug!("searching RTT control block in {range_size} bytes at 0x{ram_start:08x}");

            let mut ram = Buffer::new();
            probe.read_mem(ram_start, MemoryWidth::Bit32, range_size / 4, &mut ram)?;

            let Some(position) = find_subsequence(ram.bytes(), RTT_ID) else {
                continue;
            };
            let offset = position as u32;

            log::info!(
                "found RTT control block at address 0x{:08x}",
                ram_start + offset
            );

            let max_up_channels = ram.read_u32_le(position + 16)?;
            let max_down_channels = ram.read_u32_le(position + 20)?;

            if max_up_channels == 0 || max_down_channels == 0 {
                return Err(RttError::NoChannels);
            }
            if max_up_channels > 255 || max_down_channels > 255 {
                return Err(RttError::ControlBlockCorrupted(format!(
                    "nonsensical channel counts at 0x{:08x}: up={} down={}",
                    ram_start + offset,
                    max_up_channels,
                    max_down_channels
                )));
            }

            log::debug!("control block: {max_up_channels} up, {max_down_channels} down channels");

            return Ok(Rtt {
                ram_start,
                offset,
                max_up_channels,
                max_down_channels,
                channels: vec![
                    RttChannel::default();
                    (max_up_channels + max_down_channels) as usize
                ],
            });
        }

        Err(RttError::ControlBlockNotFound)
    }

    /// Address of the control block in target memory.
    pub fn ptr(&self) -> u32 {
        self.ram_start + self.offset
    }

    pub fn up_channel_count(&self) -> usize {
        self.max_up_channels as usize
    }

    pub fn down_channel_count(&self) -> usize {
        self.max_down_channels as usize
    }

    /// The current channel snapshots, up channels first.
    pub fn channels(&self) -> &[RttChannel] {
        &self.channels
    }

    /// Re-reads every channel descriptor from the target. With `read_names`,
    /// also fetches the NUL-terminated channel names.
    pub fn update_channels<D: StLinkUsb>(
        &mut self,
        probe: &mut StLink<D>,
        read_names: bool,
    ) -> Result<(), RttError> {
        let count = self.max_up_channels + self.max_down_channels;

        let mut descriptors = Buffer::new();
        probe.read_mem(
            self.ram_start + self.offset + CONTROL_BLOCK_SIZE,
            MemoryWidth::Bit8,
            count * CHANNEL_DESCRIPTOR_SIZE,
            &mut descriptors,
        )?;

        for i in 0..count as usize {
            let base = i * CHANNEL_DESCRIPTOR_SIZE as usize;

            let mut channel = RttChannel {
                name_ptr: descriptors.read_u32_le(base)?,
                buffer_ptr: descriptors.read_u32_le(base + 4)?,
                size: descriptors.read_u32_le(base + 8)?,
                write_off: descriptors.read_u32_le(base + 12)?,
                read_off: descriptors.read_u32_le(base + 16)?,
                flags: descriptors.read_u32_le(base + 20)?,
                name: None,
            };

            if read_names && channel.name_ptr != 0 {
                channel.name = self.read_channel_name(probe, channel.name_ptr);
                log::debug!(
                    "{}. channel name: {:?}, size: {}, flags: {}, buffer 0x{:08x}, rdOff: {}, wrOff: {}",
                    i,
                    channel.name,
                    channel.size,
                    channel.flags,
                    channel.buffer_ptr,
                    channel.read_off,
                    channel.write_off
                );
            }

            self.channels[i] = channel;
        }

        Ok(())
    }

    fn read_channel_name<D: StLinkUsb>(
        &self,
        probe: &mut StLink<D>,
        name_ptr: u32,
    ) -> Option<String> {
        let mut raw = Buffer::new();
        if let Err(e) = probe.read_mem(name_ptr, MemoryWidth::Bit8, CHANNEL_NAME_READ_LEN, &mut raw)
        {
            log::warn!("reading channel name at 0x{name_ptr:08x} failed: {e}");
            return None;
        }

        let bytes = raw.bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Drains every up channel with pending data into `callback` and writes
    /// the consumed read offsets back to the target.
    ///
    /// The callback receives `(channel_index, drained_bytes)` once per
    /// channel that produced data. A callback error aborts the pass before
    /// that channel's read offset is written back, so the rejected batch is
    /// delivered again on the next pass. Channels whose offsets lie outside
    /// their buffer fail the whole pass before anything is written back.
    pub fn read_channels<D, F>(&mut self, probe: &mut StLink<D>, mut callback: F) -> Result<(), RttError>
    where
        D: StLinkUsb,
        F: FnMut(usize, &[u8]) -> Result<(), RttError>,
    {
        if self.max_up_channels == 0 {
            return Err(RttError::NoChannels);
        }

        let up_count = self.max_up_channels as usize;

        // validate before touching the target
        for (i, channel) in self.channels[..up_count].iter().enumerate() {
            if channel.size == 0 {
                continue;
            }
            if channel.read_off >= channel.size || channel.write_off >= channel.size {
                return Err(RttError::ControlBlockCorrupted(format!(
                    "offsets out of bounds for up channel {}: rd={} wr={} size={}",
                    i, channel.read_off, channel.write_off, channel.size
                )));
            }
            if channel.read_off != channel.write_off && channel.buffer_ptr < self.ram_start {
                return Err(RttError::ControlBlockCorrupted(format!(
                    "up channel {} buffer 0x{:08x} lies below RAM start 0x{:08x}",
                    i, channel.buffer_ptr, self.ram_start
                )));
            }
        }

        // collect the RAM extents of all channels with pending data
        let mut extents: Vec<(u32, u32)> = self.channels[..up_count]
            .iter()
            .filter(|c| c.size > 0 && c.read_off != c.write_off)
            .map(|c| (c.buffer_ptr - self.ram_start, c.size))
            .collect();

        if extents.is_empty() {
            return Ok(());
        }

        extents.sort_unstable();

        // one contiguous read covering every pending buffer
        let window_start = extents[0].0;
        let window_end = extents
            .iter()
            .map(|&(start, size)| start + size)
            .max()
            .expect("extents is non-empty");
        let window_len = window_end - window_start;

        let mut window = Buffer::new();
        probe.read_mem(
            self.ram_start + window_start,
            MemoryWidth::Bit8,
            window_len,
            &mut window,
        )?;

        for i in 0..up_count {
            let (size, write_off, buffer_ptr) = {
                let c = &self.channels[i];
                (c.size, c.write_off, c.buffer_ptr)
            };
            if size == 0 || self.channels[i].read_off == write_off {
                continue;
            }

            let buffer_offset = (buffer_ptr - self.ram_start - window_start) as usize;
            let mut rd = self.channels[i].read_off;
            let mut data = Vec::new();

            while rd != write_off {
                data.push(window.bytes()[buffer_offset + rd as usize]);
                rd += 1;
                if rd >= size {
                    rd = 0;
                }
            }

            if !data.is_empty() {
                // hand the batch over before acknowledging it on the target,
                // so a rejecting consumer sees it again on the next pass
                callback(i, &data)?;

                // the descriptor field is word aligned; the probe rejects
                // narrower writes here
                let rd_off_address = self.ram_start
                    + self.offset
                    + CONTROL_BLOCK_SIZE
                    + i as u32 * CHANNEL_DESCRIPTOR_SIZE
                    + CHANNEL_RD_OFF_OFFSET;

                let mut word = Buffer::new();
                word.write_u32_le(rd);
                probe.write_mem(rd_off_address, MemoryWidth::Bit32, 1, word.bytes())?;

                self.channels[i].read_off = rd;
            }
        }

        Ok(())
    }
}
