//! Host-side driver for ST-Link debug probes.
//!
//! This crate talks the V2-family USB bulk command protocol: it opens a
//! probe, queries its firmware capabilities, enters SWD or JTAG, reads and
//! writes target memory in 8/16/32-bit granularities, captures SWO trace
//! and streams SEGGER RTT data out of a running target.
//!
//! ## Example
//!
//! ```no_run
//! use stlink_host::{Rtt, StLink, StLinkConfig, StLinkMode, ALL_PIDS, ALL_VIDS};
//!
//! let config = StLinkConfig::new(ALL_VIDS, ALL_PIDS, StLinkMode::DebugSwd, None, 1800, false);
//! let mut probe = StLink::open(config)?;
//!
//! println!("firmware {}", probe.version());
//! println!("idcode 0x{:08x}", probe.get_id_code()?);
//!
//! // Attach to RTT and drain whatever the target has logged so far.
//! let mut rtt = Rtt::attach(&mut probe, &[(0x2000_0000, 16 * 1024)])?;
//! rtt.update_channels(&mut probe, true)?;
//! rtt.read_channels(&mut probe, |channel, data| {
//!     println!("channel {channel}: {}", String::from_utf8_lossy(data));
//!     Ok(())
//! })?;
//!
//! probe.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Within one probe handle all operations are strictly serialized; the API
//! takes `&mut self` everywhere so overlapping commands cannot be issued.

pub mod constants;

mod buffer;
mod error;
#[cfg(test)]
mod fake_usb;
mod memory;
mod rtt;
mod speed;
mod stlink;
mod trace;
mod transfer;
mod usb_interface;
mod version;

pub use buffer::Buffer;
pub use constants::{DeviceMode, StLinkMode, Status};
pub use error::Error;
pub use memory::MemoryWidth;
pub use rtt::{Rtt, RttChannel, RttError, DEFAULT_RAM_START};
pub use speed::SpeedMapEntry;
pub use stlink::{StLink, StLinkConfig};
pub use usb_interface::{
    list_devices, StLinkProbeInfo, StLinkUsb, StLinkUsbDevice, ALL_PIDS, ALL_VIDS, USB_VID,
};
pub use version::{ApiVersion, Capabilities, Version};
