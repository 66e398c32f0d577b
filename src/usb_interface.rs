//! Timed bulk I/O against the probe's three fixed endpoints, plus device
//! discovery and open/close.

use lazy_static::lazy_static;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;
use crate::stlink::StLinkConfig;

/// The ST-Link USB vendor id.
pub const USB_VID: u16 = 0x0483;

/// Wildcard sentinels accepted in [`StLinkConfig`](crate::StLinkConfig).
pub const ALL_VIDS: u16 = 0xffff;
pub const ALL_PIDS: u16 = 0xffff;

/// Deadline for bulk OUT transfers.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for bulk IN transfers.
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

lazy_static! {
    /// Map of USB PID to firmware version name and device endpoints.
    pub static ref USB_PID_EP_MAP: HashMap<u16, StLinkInfo> = {
        let mut m = HashMap::new();
        m.insert(0x3744, StLinkInfo::new("V1",    0x3744, 0x02, 0x81, 0x83));
        m.insert(0x3748, StLinkInfo::new("V2",    0x3748, 0x02, 0x81, 0x83));
        m.insert(0x374b, StLinkInfo::new("V2-1",  0x374b, 0x01, 0x81, 0x82));
        m.insert(0x3752, StLinkInfo::new("V2-1",  0x3752, 0x01, 0x81, 0x82)); // No MSD
        m.insert(0x374d, StLinkInfo::new("V3",    0x374d, 0x01, 0x81, 0x82)); // USB loader
        m.insert(0x374e, StLinkInfo::new("V3-E",  0x374e, 0x01, 0x81, 0x82));
        m.insert(0x374f, StLinkInfo::new("V3-S",  0x374f, 0x01, 0x81, 0x82));
        m.insert(0x3753, StLinkInfo::new("V3",    0x3753, 0x01, 0x81, 0x82)); // 2VCP
        m
    };
}

/// A helper struct to match ST-Link device info.
#[derive(Clone, Debug, Default)]
pub struct StLinkInfo {
    pub version_name: String,
    pub usb_pid: u16,
    ep_out: u8,
    ep_in: u8,
    ep_trace: u8,
}

impl StLinkInfo {
    pub fn new<V: Into<String>>(
        version_name: V,
        usb_pid: u16,
        ep_out: u8,
        ep_in: u8,
        ep_trace: u8,
    ) -> Self {
        Self {
            version_name: version_name.into(),
            usb_pid,
            ep_out,
            ep_in,
            ep_trace,
        }
    }
}

/// Raw bulk access to a probe. The command engine is the only caller; it
/// never issues overlapping transfers against one device.
pub trait StLinkUsb: std::fmt::Debug {
    /// Bulk-write to the TX endpoint. Returns the number of bytes written.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, Error>;

    /// Bulk-read from the RX endpoint. Returns the number of bytes read.
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Bulk-read from the TRACE endpoint.
    fn read_trace(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Reset the USB device. This can be used to recover when the probe
    /// does not respond to USB requests.
    fn reset(&mut self) -> Result<(), Error>;
}

/// Identity of one probe found on the bus.
#[derive(Debug, Clone)]
pub struct StLinkProbeInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub version_name: String,
}

pub struct StLinkUsbDevice {
    device_handle: DeviceHandle<Context>,
    info: StLinkInfo,
}

impl std::fmt::Debug for StLinkUsbDevice {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("StLinkUsbDevice")
            .field("device_handle", &"DeviceHandle<rusb::Context>")
            .field("info", &self.info)
            .finish()
    }
}

fn matches_filter(config: &StLinkConfig, vid: u16, pid: u16) -> bool {
    let vid_ok = if config.vid == ALL_VIDS {
        vid == USB_VID
    } else {
        vid == config.vid
    };
    let pid_ok = if config.pid == ALL_PIDS {
        USB_PID_EP_MAP.contains_key(&pid)
    } else {
        pid == config.pid
    };
    vid_ok && pid_ok
}

fn read_serial_number<T: UsbContext>(
    device: &Device<T>,
    descriptor: &rusb::DeviceDescriptor,
) -> Option<String> {
    let timeout = Duration::from_millis(100);
    let handle = device.open().ok()?;
    let language = *handle.read_languages(timeout).ok()?.first()?;
    handle
        .read_serial_number_string(language, descriptor, timeout)
        .ok()
}

/// Scans the bus for supported probes and reports their identity.
pub fn list_devices() -> Vec<StLinkProbeInfo> {
    let Ok(context) = Context::new() else {
        return vec![];
    };
    let Ok(devices) = context.devices() else {
        return vec![];
    };

    devices
        .iter()
        .filter_map(|device| {
            let descriptor = device.device_descriptor().ok()?;
            let info = USB_PID_EP_MAP.get(&descriptor.product_id())?;
            if descriptor.vendor_id() != USB_VID {
                return None;
            }
            Some(StLinkProbeInfo {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                serial_number: read_serial_number(&device, &descriptor),
                version_name: info.version_name.clone(),
            })
        })
        .collect()
}

impl StLinkUsbDevice {
    /// Opens the USB device matching `config` and claims its interface.
    pub fn open_from_config(config: &StLinkConfig) -> Result<Self, Error> {
        let context = Context::new()?;
        log::debug!("acquired libusb context");

        let mut candidates = Vec::new();
        for device in context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if matches_filter(config, descriptor.vendor_id(), descriptor.product_id()) {
                log::debug!(
                    "inspecting usb device [{:04x}:{:04x}] on bus {:03}:{:03}",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    device.bus_number(),
                    device.address()
                );
                candidates.push((device, descriptor));
            }
        }

        let (device, descriptor) = match candidates.len() {
            0 => return Err(Error::ProbeNotFound),
            1 => candidates.remove(0),
            _ => {
                let Some(serial) = &config.serial else {
                    return Err(Error::MultipleProbesFound);
                };
                let position = candidates.iter().position(|(device, descriptor)| {
                    read_serial_number(device, descriptor).as_ref() == Some(serial)
                });
                match position {
                    Some(i) => candidates.remove(i),
                    None => return Err(Error::ProbeNotFound),
                }
            }
        };

        if descriptor.product_id() == 0x3744 {
            return Err(Error::NotSupported(
                "ST-Link V1 uses the mass-storage wrapped protocol and is rejected",
            ));
        }

        let info = match USB_PID_EP_MAP.get(&descriptor.product_id()) {
            Some(info) => info.clone(),
            None => {
                log::warn!(
                    "unknown product id {:04x}, assuming V2 endpoint layout",
                    descriptor.product_id()
                );
                StLinkInfo::new("V2", descriptor.product_id(), 0x02, 0x81, 0x83)
            }
        };

        let mut device_handle = device.open()?;
        log::debug!("acquired handle for probe");

        let config_descriptor = device.active_config_descriptor()?;
        device_handle.claim_interface(0)?;
        log::debug!("claimed interface 0 of USB device");

        let mut endpoint_out = false;
        let mut endpoint_in = false;
        let mut endpoint_trace = false;

        if let Some(interface) = config_descriptor.interfaces().next() {
            if let Some(interface_descriptor) = interface.descriptors().next() {
                for endpoint in interface_descriptor.endpoint_descriptors() {
                    if endpoint.address() == info.ep_out {
                        endpoint_out = true;
                    } else if endpoint.address() == info.ep_in {
                        endpoint_in = true;
                    } else if endpoint.address() == info.ep_trace {
                        endpoint_trace = true;
                    }
                }
            }
        }

        if !(endpoint_out && endpoint_in && endpoint_trace) {
            return Err(Error::EndpointNotFound);
        }

        log::debug!(
            "successfully attached to ST-Link {} [{:04x}:{:04x}]",
            info.version_name,
            descriptor.vendor_id(),
            descriptor.product_id()
        );

        Ok(Self {
            device_handle,
            info,
        })
    }

    /// Releases the claimed interface; the configuration and device handles
    /// are released afterwards when the handle drops.
    fn close(&mut self) -> Result<(), rusb::Error> {
        self.device_handle.release_interface(0)
    }
}

impl StLinkUsb for StLinkUsbDevice {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, Error> {
        let written = self
            .device_handle
            .write_bulk(self.info.ep_out, data, timeout)?;
        log::trace!("{} bytes -> EP-{:02x}", written, self.info.ep_out);
        Ok(written)
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let read = self.device_handle.read_bulk(self.info.ep_in, buf, timeout)?;
        log::trace!("EP-{:02x} -> {} bytes", self.info.ep_in, read);
        Ok(read)
    }

    fn read_trace(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let read = self
            .device_handle
            .read_bulk(self.info.ep_trace, buf, timeout)?;
        log::trace!("EP-{:02x} -> {} trace bytes", self.info.ep_trace, read);
        Ok(read)
    }

    fn reset(&mut self) -> Result<(), Error> {
        log::debug!("resetting USB device of ST-Link");
        self.device_handle.reset()?;
        Ok(())
    }
}

impl Drop for StLinkUsbDevice {
    fn drop(&mut self) {
        // We ignore the error case as we can't do much about it anyways.
        let _ = self.close();
    }
}
