//! A scriptable ST-Link standing in for real hardware in tests.
//!
//! Speaks enough of the V2 command protocol to drive the full open
//! sequence, serves memory reads from an in-memory RAM image and records
//! every command frame and memory transaction for assertions.

use std::collections::VecDeque;
use std::time::Duration;

use crate::constants::{commands, StLinkMode};
use crate::error::Error;
use crate::stlink::StLink;
use crate::usb_interface::StLinkUsb;

/// One decoded memory transaction observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemAccess {
    pub write: bool,
    pub width: u8,
    pub addr: u32,
    pub len: u16,
}

impl MemAccess {
    pub(crate) fn read(width: u8, addr: u32, len: u16) -> Self {
        MemAccess {
            write: false,
            width,
            addr,
            len,
        }
    }

    pub(crate) fn write(width: u8, addr: u32, len: u16) -> Self {
        MemAccess {
            write: true,
            width,
            addr,
            len,
        }
    }
}

#[derive(Debug)]
pub(crate) struct FakeUsb {
    pub hw_version: u8,
    pub jtag_version: u8,
    pub swim_version: u8,
    pub pid: u16,

    pub ram_base: u32,
    pub ram: Vec<u8>,
    pub cpuid: u32,
    pub idcode: u32,
    pub voltage: (u32, u32),
    pub com_frequencies: Vec<u32>,
    pub trace_data: Vec<u8>,

    /// Status bytes served to upcoming read/write-status polls; empty means
    /// everything succeeds.
    pub rw_statuses: VecDeque<u8>,
    /// Status bytes served to upcoming status-bearing commands.
    pub cmd_statuses: VecDeque<u8>,

    /// Every command frame seen, in order.
    pub frames: Vec<Vec<u8>>,
    /// Every memory transaction seen, in order.
    pub transactions: Vec<MemAccess>,
    /// Wire length of the most recent memory-read reply.
    pub last_read_reply_len: usize,

    current_mode: u8,
    replies: VecDeque<Vec<u8>>,
    pending_write: Option<(u32, u16)>,
}

impl FakeUsb {
    pub(crate) fn new(hw_version: u8, jtag_version: u8, swim_version: u8) -> Self {
        FakeUsb {
            hw_version,
            jtag_version,
            swim_version,
            pid: 0x3748,
            ram_base: 0x2000_0000,
            ram: vec![0; 0x2000],
            cpuid: 0x410f_c241, // Cortex-M4
            idcode: 0x2ba0_1477,
            voltage: (2, 3),
            com_frequencies: vec![24000, 8000, 3300, 1000, 200, 50],
            trace_data: Vec::new(),
            rw_statuses: VecDeque::new(),
            cmd_statuses: VecDeque::new(),
            frames: Vec::new(),
            transactions: Vec::new(),
            last_read_reply_len: 0,
            current_mode: 0x02, // debug
            replies: VecDeque::new(),
            pending_write: None,
        }
    }

    fn cmd_status(&mut self) -> u8 {
        self.cmd_statuses.pop_front().unwrap_or(0x80)
    }

    fn rw_status(&mut self) -> u8 {
        self.rw_statuses.pop_front().unwrap_or(0x80)
    }

    fn push_status2(&mut self) {
        let status = self.cmd_status();
        self.replies.push_back(vec![status, 0]);
    }

    fn mem_read(&mut self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                let a = addr + i;
                if (0xe000_ed00..0xe000_ed04).contains(&a) {
                    self.cpuid.to_le_bytes()[(a - 0xe000_ed00) as usize]
                } else if a >= self.ram_base
                    && ((a - self.ram_base) as usize) < self.ram.len()
                {
                    self.ram[(a - self.ram_base) as usize]
                } else {
                    0
                }
            })
            .collect()
    }

    fn mem_write(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let a = addr + i as u32;
            if a >= self.ram_base && ((a - self.ram_base) as usize) < self.ram.len() {
                self.ram[(a - self.ram_base) as usize] = byte;
            }
        }
    }

    fn handle_debug_command(&mut self, frame: &[u8]) {
        let addr = u32::from_le_bytes(frame[2..6].try_into().unwrap());
        let len = u16::from_le_bytes(frame[6..8].try_into().unwrap());

        match frame[1] {
            commands::JTAG_EXIT => {
                self.current_mode = 0x01;
            }
            commands::JTAG_ENTER2 => {
                self.current_mode = 0x02;
                self.push_status2();
            }
            commands::JTAG_DRIVE_NRST
            | commands::SWD_SET_FREQ
            | commands::JTAG_SET_FREQ
            | commands::JTAG_INIT_AP
            | commands::SWO_START_TRACE_RECEPTION
            | commands::SWO_STOP_TRACE_RECEPTION => {
                self.push_status2();
            }
            commands::JTAG_READ_IDCODES => {
                let mut reply = vec![0u8; 12];
                reply[0] = 0x80;
                reply[4..8].copy_from_slice(&self.idcode.to_le_bytes());
                self.replies.push_back(reply);
            }
            commands::JTAG_GETLASTRWSTATUS => {
                let status = self.rw_status();
                self.replies.push_back(vec![status, 0]);
            }
            commands::JTAG_GETLASTRWSTATUS2 => {
                let mut reply = vec![0u8; 12];
                reply[0] = self.rw_status();
                self.replies.push_back(reply);
            }
            commands::SET_COM_FREQ => {
                let mut reply = vec![0u8; 8];
                reply[0] = self.cmd_status();
                self.replies.push_back(reply);
            }
            commands::GET_COM_FREQ => {
                let mut reply = vec![0u8; 52];
                reply[0] = self.cmd_status();
                reply[8] = self.com_frequencies.len() as u8;
                for (i, freq) in self.com_frequencies.iter().take(10).enumerate() {
                    reply[12 + 4 * i..16 + 4 * i].copy_from_slice(&freq.to_le_bytes());
                }
                self.replies.push_back(reply);
            }
            commands::SWO_GET_TRACE_NEW_RECORD_NB => {
                let available = self.trace_data.len() as u16;
                self.replies.push_back(available.to_le_bytes().to_vec());
            }
            commands::JTAG_READMEM_8BIT => {
                self.transactions.push(MemAccess::read(1, addr, len));
                let wire_len = if len == 1 { 2 } else { len as usize };
                let reply = self.mem_read(addr, wire_len);
                self.last_read_reply_len = reply.len();
                self.replies.push_back(reply);
            }
            commands::JTAG_READMEM_16BIT => {
                self.transactions.push(MemAccess::read(2, addr, len));
                let reply = self.mem_read(addr, len as usize);
                self.last_read_reply_len = reply.len();
                self.replies.push_back(reply);
            }
            commands::JTAG_READMEM_32BIT => {
                self.transactions.push(MemAccess::read(4, addr, len));
                let reply = self.mem_read(addr, len as usize);
                self.last_read_reply_len = reply.len();
                self.replies.push_back(reply);
            }
            commands::JTAG_WRITEMEM_8BIT => {
                self.transactions.push(MemAccess::write(1, addr, len));
                self.pending_write = Some((addr, len));
            }
            commands::JTAG_WRITEMEM_16BIT => {
                self.transactions.push(MemAccess::write(2, addr, len));
                self.pending_write = Some((addr, len));
            }
            commands::JTAG_WRITEMEM_32BIT => {
                self.transactions.push(MemAccess::write(4, addr, len));
                self.pending_write = Some((addr, len));
            }
            other => panic!("fake probe got unexpected debug sub-command 0x{other:02x}"),
        }
    }
}

impl StLinkUsb for FakeUsb {
    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, Error> {
        if let Some((addr, len)) = self.pending_write.take() {
            assert_eq!(data.len(), len as usize, "data phase length mismatch");
            self.mem_write(addr, data);
            return Ok(data.len());
        }

        // every command rides in a full 16-byte frame
        assert_eq!(data.len(), 16, "command frame must be padded to 16 bytes");
        self.frames.push(data.to_vec());

        match data[0] {
            commands::GET_VERSION => {
                let word: u16 = if self.hw_version == 3 {
                    (self.hw_version as u16) << 12
                } else {
                    ((self.hw_version as u16) << 12)
                        | ((self.jtag_version as u16) << 6)
                        | (self.swim_version as u16)
                };
                let mut reply = vec![(word >> 8) as u8, word as u8];
                reply.extend_from_slice(&0x0483u16.to_le_bytes());
                reply.extend_from_slice(&self.pid.to_le_bytes());
                self.replies.push_back(reply);
            }
            commands::GET_VERSION_EXT => {
                let mut reply = vec![
                    self.hw_version,
                    self.swim_version,
                    self.jtag_version,
                    0,
                    0,
                    0,
                    0,
                    0,
                ];
                reply.extend_from_slice(&0x0483u16.to_le_bytes());
                reply.extend_from_slice(&self.pid.to_le_bytes());
                self.replies.push_back(reply);
            }
            commands::GET_CURRENT_MODE => {
                self.replies.push_back(vec![self.current_mode, 0]);
            }
            commands::GET_TARGET_VOLTAGE => {
                let mut reply = Vec::with_capacity(8);
                reply.extend_from_slice(&self.voltage.0.to_le_bytes());
                reply.extend_from_slice(&self.voltage.1.to_le_bytes());
                self.replies.push_back(reply);
            }
            commands::DFU_COMMAND | commands::SWIM_COMMAND => {
                // exit commands produce no response
            }
            commands::DEBUG_COMMAND => self.handle_debug_command(data),
            other => panic!("fake probe got unexpected command 0x{other:02x}"),
        }

        Ok(data.len())
    }

    fn read_bulk(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error> {
        let reply = self
            .replies
            .pop_front()
            .expect("read_bulk called with no reply queued");
        assert_eq!(
            buf.len(),
            reply.len(),
            "host and fake disagree on response length"
        );
        buf.copy_from_slice(&reply);
        Ok(reply.len())
    }

    fn read_trace(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error> {
        let n = buf.len().min(self.trace_data.len());
        let drained: Vec<u8> = self.trace_data.drain(..n).collect();
        buf[..n].copy_from_slice(&drained);
        Ok(n)
    }

    fn reset(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Runs the full open sequence against the fake and returns the live probe.
pub(crate) fn open_probe(fake: FakeUsb, mode: StLinkMode) -> StLink<FakeUsb> {
    let mut probe = StLink::with_device(fake, mode);
    probe
        .init(false, 1800)
        .expect("init against fake probe failed");
    probe
}
