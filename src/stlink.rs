//! The probe handle and the command engine everything else funnels through.

use std::thread;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::constants::{
    commands, DeviceMode, StLinkMode, Status, AP_SELECTION_MAXIMUM, CMD_SIZE_V2,
    CPUID_BASE_REGISTER, MAXIMUM_WAIT_RETRIES, SWIM_STATUS_BUSY, SWIM_STATUS_OK,
};
use crate::error::Error;
use crate::memory::MemoryWidth;
use crate::speed::{dump_speed_map, JTAG_KHZ_TO_SPEED_MAP, SWD_KHZ_TO_SPEED_MAP};
use crate::trace::TraceState;
use crate::transfer::{TransferContext, TransferDirection};
use crate::usb_interface::{StLinkUsb, StLinkUsbDevice, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::version::{ApiVersion, Capabilities, Version};

/// Selection parameters for [`StLink::open`].
#[derive(Debug, Clone)]
pub struct StLinkConfig {
    /// USB vendor id, or [`ALL_VIDS`](crate::ALL_VIDS).
    pub vid: u16,
    /// USB product id, or [`ALL_PIDS`](crate::ALL_PIDS).
    pub pid: u16,
    /// Serial number used to disambiguate when several probes match.
    pub serial: Option<String>,
    /// Transport to enter after open.
    pub mode: StLinkMode,
    /// Interface clock to program while entering debug mode.
    pub initial_speed_khz: u32,
    /// Pulse the reset line around mode entry.
    pub connect_under_reset: bool,
}

impl StLinkConfig {
    pub fn new(
        vid: u16,
        pid: u16,
        mode: StLinkMode,
        serial: Option<String>,
        initial_speed_khz: u32,
        connect_under_reset: bool,
    ) -> Self {
        StLinkConfig {
            vid,
            pid,
            serial,
            mode,
            initial_speed_khz,
            connect_under_reset,
        }
    }
}

/// Which access ports have been initialized on this probe.
///
/// Scoped to the handle so two probes in one process never share AP state;
/// it is rebuilt on every open.
#[derive(Debug, Default)]
struct ApRegistry {
    bits: [u64; 4],
}

impl ApRegistry {
    fn get(&self, ap: u16) -> bool {
        self.bits[(ap / 64) as usize] & (1u64 << (ap % 64)) != 0
    }

    fn set(&mut self, ap: u16) {
        self.bits[(ap / 64) as usize] |= 1u64 << (ap % 64);
    }
}

/// A long-lived handle to one open ST-Link probe.
///
/// All operations take `&mut self`: within one probe, command/response
/// exchanges are strictly serialized and overlapping use is rejected at
/// compile time.
#[derive(Debug)]
pub struct StLink<D: StLinkUsb> {
    pub(crate) device: D,
    vid: u16,
    pid: u16,
    mode: StLinkMode,
    version: Version,
    pub(crate) max_mem_packet: u32,
    opened_aps: ApRegistry,
    pub(crate) trace: TraceState,
    verify_downgrades: u32,
}

impl StLink<StLinkUsbDevice> {
    /// Opens the probe matching `config`, queries its firmware version and
    /// enters the requested transport.
    pub fn open(config: StLinkConfig) -> Result<Self, Error> {
        let device = StLinkUsbDevice::open_from_config(&config)?;
        let mut probe = StLink::with_device(device, config.mode);
        probe.init(config.connect_under_reset, config.initial_speed_khz)?;
        Ok(probe)
    }
}

impl<D: StLinkUsb> StLink<D> {
    pub(crate) fn with_device(device: D, mode: StLinkMode) -> Self {
        StLink {
            device,
            vid: 0,
            pid: 0,
            mode,
            version: Version::default(),
            max_mem_packet: 1 << 10,
            opened_aps: ApRegistry::default(),
            trace: TraceState::default(),
            verify_downgrades: 0,
        }
    }

    /// Closes the probe. Consuming the handle makes use-after-close
    /// unrepresentable; the USB interface, configuration and device are
    /// released in that order when the handle drops.
    pub fn close(self) {
        log::debug!(
            "close st-link device [{:04x}:{:04x}]",
            self.vid,
            self.pid
        );
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.version.flags
    }

    pub fn mode(&self) -> StLinkMode {
        self.mode
    }

    /// How often a write-verify error from the probe has been downgraded to
    /// success on this handle.
    pub fn write_verify_downgrades(&self) -> u32 {
        self.verify_downgrades
    }

    #[cfg(test)]
    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    #[cfg(test)]
    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Resets the USB device itself, not the target.
    pub fn usb_reset(&mut self) -> Result<(), Error> {
        self.device.reset()
    }

    // ----- command engine ---------------------------------------------------

    /// Writes the padded command frame and runs the data phase, without
    /// looking at any status byte.
    pub(crate) fn transfer_raw(
        &mut self,
        ctx: &mut TransferContext,
        data_len: usize,
    ) -> Result<(), Error> {
        let frame = ctx.frame();
        log::trace!("sending command {:02x?} to ST-Link", ctx.cmd.bytes());

        let written = self.device.write_bulk(&frame, WRITE_TIMEOUT)?;
        if written != CMD_SIZE_V2 {
            return Err(Error::NotEnoughBytesWritten {
                is: written,
                should: CMD_SIZE_V2,
            });
        }

        if data_len == 0 {
            return Ok(());
        }

        match ctx.direction() {
            TransferDirection::Outgoing => {
                // Older firmware drops the payload if it follows the command
                // frame back-to-back.
                thread::sleep(Duration::from_millis(10));

                assert!(ctx.data.len() >= data_len);
                let written = self
                    .device
                    .write_bulk(&ctx.data.bytes()[..data_len], WRITE_TIMEOUT)?;
                if written != data_len {
                    return Err(Error::NotEnoughBytesWritten {
                        is: written,
                        should: data_len,
                    });
                }
            }
            TransferDirection::Incoming => {
                ctx.data.resize(data_len);
                let read = self.device.read_bulk(ctx.data.as_mut_slice(), READ_TIMEOUT)?;
                if read != data_len {
                    return Err(Error::NotEnoughBytesRead {
                        is: read,
                        should: data_len,
                    });
                }
            }
        }

        Ok(())
    }

    /// Runs the exchange and decodes the first response byte.
    pub(crate) fn transfer_checked(
        &mut self,
        ctx: &mut TransferContext,
        data_len: usize,
    ) -> Result<(), Error> {
        self.transfer_raw(ctx, data_len)?;
        self.check_status(ctx)
    }

    /// Runs the exchange, retrying wait statuses with exponential backoff.
    ///
    /// This is the only place a `Wait` status is absorbed. At most
    /// [`MAXIMUM_WAIT_RETRIES`] transfers are issued for one command, with
    /// sleeps of 1, 2, 4, ... ms between attempts.
    pub(crate) fn command_with_retry(
        &mut self,
        ctx: &mut TransferContext,
        data_len: usize,
    ) -> Result<(), Error> {
        let mut retries = 0;
        loop {
            self.transfer_raw(ctx, data_len)?;
            match self.check_status(ctx) {
                Err(Error::Wait(status)) if retries < MAXIMUM_WAIT_RETRIES - 1 => {
                    let delay = Duration::from_millis(1 << retries);
                    retries += 1;
                    log::debug!(
                        "got {status}, retry {retries} after {delay:?}",
                    );
                    thread::sleep(delay);
                }
                result => return result,
            }
        }
    }

    /// Maps the first response byte onto a typed outcome, honoring the
    /// transport mode and API generation.
    fn check_status(&mut self, ctx: &TransferContext) -> Result<(), Error> {
        let Some(&first) = ctx.data.bytes().first() else {
            return Err(Error::Protocol("empty response, expected a status byte".into()));
        };

        if self.mode == StLinkMode::DebugSwim {
            return match first {
                SWIM_STATUS_OK => Ok(()),
                SWIM_STATUS_BUSY => Err(Error::Wait(Status::Other(SWIM_STATUS_BUSY))),
                v => Err(Error::CommandFailed(Status::Other(v))),
            };
        }

        // No status byte in this position on the V1 API.
        if self.version.api == ApiVersion::V1 {
            return Ok(());
        }

        let status = Status::from(first);
        match status {
            Status::JtagOk => Ok(()),
            // The probe reports verify errors it is safe to proceed past.
            Status::JtagWriteVerifError => {
                log::warn!("write verify error, ignoring");
                self.verify_downgrades += 1;
                Ok(())
            }
            s if s.is_wait() => Err(Error::Wait(s)),
            s => {
                log::warn!("check_status failed: {s}");
                Err(Error::CommandFailed(s))
            }
        }
    }

    /// Polls the result of the last memory transfer. A degenerate command on
    /// API V2+; the V1 API has no equivalent.
    pub(crate) fn get_rw_status(&mut self) -> Result<(), Error> {
        if self.version.api == ApiVersion::V1 {
            return Ok(());
        }

        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);

        if self
            .version
            .flags
            .contains(Capabilities::HAS_GETLASTRWSTATUS2)
        {
            ctx.cmd.write_u8(commands::JTAG_GETLASTRWSTATUS2);
            self.transfer_checked(&mut ctx, 12)
        } else {
            ctx.cmd.write_u8(commands::JTAG_GETLASTRWSTATUS);
            self.transfer_checked(&mut ctx, 2)
        }
    }

    // ----- version & capability probe ---------------------------------------

    /// Queries the firmware version and derives the capability bitset.
    /// Executed once per open before any mode change.
    fn get_version(&mut self) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::GET_VERSION);
        self.transfer_raw(&mut ctx, 6)?;

        let word = ctx.data.read_u16_be(0)?;
        self.vid = ctx.data.read_u16_le(2)?;
        self.pid = ctx.data.read_u16_le(4)?;

        let (mut major, minor_a, minor_b) = crate::version::split_version_word(word);
        let (mut jtag, mut swim, mut msd) =
            crate::version::reinterpret_minors(self.pid, minor_a, minor_b);
        let mut bridge = 0;

        // STLINK-V3 reports its counters through a dedicated command.
        if major == 3 && minor_a == 0 && minor_b == 0 {
            let mut ext = TransferContext::new(TransferDirection::Incoming);
            ext.cmd.write_u8(commands::GET_VERSION_EXT);
            self.transfer_raw(&mut ext, 12)?;

            let bytes = ext.data.bytes();
            major = bytes[0];
            swim = bytes[1];
            jtag = bytes[2];
            msd = bytes[3];
            bridge = bytes[4];
            self.vid = ext.data.read_u16_le(8)?;
            self.pid = ext.data.read_u16_le(10)?;
        }

        let mut version = Version {
            major,
            jtag,
            swim,
            msd,
            bridge,
            ..Default::default()
        };
        version.derive_capabilities();

        log::debug!("parsed st-link version [{}]", version);
        self.version = version;

        Ok(())
    }

    // ----- open / init ------------------------------------------------------

    pub(crate) fn init(
        &mut self,
        connect_under_reset: bool,
        initial_speed_khz: u32,
    ) -> Result<(), Error> {
        log::debug!("initializing ST-Link...");

        // The first command on the wire; if the probe wedged mid-transfer in
        // a previous session, a USB reset usually recovers it.
        if let Err(e) = self.get_version() {
            match e {
                Error::Usb(_) => {
                    self.device.reset()?;
                    self.get_version()?;
                }
                other => return Err(other),
            }
        }

        match self.mode {
            StLinkMode::DebugSwd => {
                if self.version.api == ApiVersion::V1 {
                    return Err(Error::NotSupported("SWD requires the V2 API"));
                }
            }
            StLinkMode::DebugJtag => {
                if self.version.jtag == 0 {
                    return Err(Error::NotSupported(
                        "JTAG transport not supported by this probe",
                    ));
                }
            }
            StLinkMode::DebugSwim => {
                if self.version.swim == 0 {
                    return Err(Error::NotSupported(
                        "SWIM transport not supported by this probe",
                    ));
                }
            }
            _ => return Err(Error::UnknownMode),
        }

        self.init_mode(connect_under_reset, initial_speed_khz)?;

        self.max_mem_packet = 1 << 10;

        self.open_ap(0)?;

        // Cortex-M3/M4 serve a 4 KiB autoincrement page.
        let mut buf = Buffer::new();
        match self.read_mem(CPUID_BASE_REGISTER, MemoryWidth::Bit32, 1, &mut buf) {
            Ok(()) => {
                let cpuid = buf.read_u32_le(0)?;
                let partno = (cpuid >> 4) & 0xf;
                log::debug!("got cpu id [{cpuid:08x}]");
                if partno == 3 || partno == 4 {
                    self.max_mem_packet = 1 << 12;
                }
            }
            Err(e) => log::error!("reading CPUID failed: {e}"),
        }

        log::debug!("using TAR autoincrement: {}", self.max_mem_packet);
        Ok(())
    }

    // ----- mode controller --------------------------------------------------

    pub(crate) fn get_current_mode(&mut self) -> Result<DeviceMode, Error> {
        log::trace!("getting current mode of device...");
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::GET_CURRENT_MODE);
        self.transfer_raw(&mut ctx, 2)?;

        let mode = DeviceMode::from(ctx.data.bytes()[0]);
        log::debug!("current device mode: {mode}");
        Ok(mode)
    }

    pub(crate) fn init_mode(
        &mut self,
        connect_under_reset: bool,
        initial_speed_khz: u32,
    ) -> Result<(), Error> {
        let mode = self.get_current_mode()?;

        let leave = StLinkMode::leave_target(mode);
        if leave != StLinkMode::Unknown {
            if let Err(e) = self.leave_mode(leave) {
                log::warn!("leaving {mode} failed: {e}");
            }
        }

        let mode = self.get_current_mode()?;

        // The probe needs target Vdd for reliable debugging; warn but do not
        // fail. DFU mode cannot answer the voltage query.
        if mode != DeviceMode::Dfu {
            match self.get_target_voltage() {
                Ok(voltage) if voltage < 1.5 => {
                    log::warn!("target voltage may be too low for reliable debugging ({voltage:.2} V)")
                }
                Ok(_) => {}
                Err(e) => log::error!("voltage check failed: {e}"),
            }
        }

        if matches!(self.mode, StLinkMode::DebugJtag | StLinkMode::DebugSwd) {
            if self.version.api == ApiVersion::V3 {
                let map = self.get_com_freq(self.mode == StLinkMode::DebugJtag)?;
                dump_speed_map(&map);
                if let Err(e) = self.set_speed(initial_speed_khz, false) {
                    log::warn!("setting initial interface clock failed: {e}");
                }
            } else if self.version.flags.contains(Capabilities::HAS_JTAG_SET_FREQ) {
                if self.mode == StLinkMode::DebugJtag {
                    dump_speed_map(&JTAG_KHZ_TO_SPEED_MAP);
                } else {
                    dump_speed_map(&SWD_KHZ_TO_SPEED_MAP);
                }
                if let Err(e) = self.set_speed(initial_speed_khz, false) {
                    log::warn!("setting initial interface clock failed: {e}");
                }
            }
        }

        // Preliminary reset assert: the adapter may not know the reset pin
        // before the mode is entered, so failures are ignored here and the
        // line is driven again below.
        if connect_under_reset && self.mode != StLinkMode::DebugSwim {
            let _ = self.assert_reset(commands::JTAG_DRIVE_NRST_LOW);
        }

        self.enter_mode(self.mode)?;

        if connect_under_reset {
            self.assert_reset(commands::JTAG_DRIVE_NRST_LOW)?;
        }

        let mode = self.get_current_mode()?;
        log::debug!("device is now in {mode}");

        Ok(())
    }

    fn enter_mode(&mut self, mode: StLinkMode) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);

        match mode {
            StLinkMode::DebugJtag => {
                ctx.cmd.write_u8(commands::DEBUG_COMMAND);
                ctx.cmd.write_u8(commands::JTAG_ENTER2);
                ctx.cmd.write_u8(commands::JTAG_ENTER_JTAG_NO_RESET);
            }
            StLinkMode::DebugSwd => {
                ctx.cmd.write_u8(commands::DEBUG_COMMAND);
                ctx.cmd.write_u8(commands::JTAG_ENTER2);
                ctx.cmd.write_u8(commands::JTAG_ENTER_SWD_NO_RESET);
            }
            StLinkMode::DebugSwim => {
                return Err(Error::NotSupported("SWIM mode entry is not implemented"));
            }
            _ => {
                return Err(Error::Config(
                    "cannot enter DFU or mass storage configurations".into(),
                ))
            }
        }

        self.command_with_retry(&mut ctx, 2)
    }

    fn leave_mode(&mut self, mode: StLinkMode) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);

        match mode {
            StLinkMode::DebugJtag | StLinkMode::DebugSwd => {
                ctx.cmd.write_u8(commands::DEBUG_COMMAND);
                ctx.cmd.write_u8(commands::JTAG_EXIT);
            }
            StLinkMode::DebugSwim => {
                ctx.cmd.write_u8(commands::SWIM_COMMAND);
                ctx.cmd.write_u8(commands::SWIM_EXIT);
            }
            StLinkMode::Dfu => {
                ctx.cmd.write_u8(commands::DFU_COMMAND);
                ctx.cmd.write_u8(commands::DFU_EXIT);
            }
            _ => return Err(Error::UnknownMode),
        }

        self.transfer_raw(&mut ctx, 0)
    }

    /// Drives the nRESET line. `srst` is one of the `JTAG_DRIVE_NRST_*`
    /// parameter bytes.
    pub fn assert_reset(&mut self, srst: u8) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_DRIVE_NRST);
        ctx.cmd.write_u8(srst);
        self.command_with_retry(&mut ctx, 2)
    }

    // ----- access-port manager ----------------------------------------------

    /// Lazily initializes a debug access port. Idempotent: once a port was
    /// opened on this handle, further calls are no-ops.
    pub fn open_ap(&mut self, apsel: u16) -> Result<(), Error> {
        // nothing to do on old versions
        if !self.version.flags.contains(Capabilities::HAS_AP_INIT) {
            return Ok(());
        }

        if apsel > AP_SELECTION_MAXIMUM {
            return Err(Error::Config(format!("apsel {apsel} out of range")));
        }

        if self.opened_aps.get(apsel) {
            return Ok(());
        }

        self.init_access_port(apsel as u8)?;

        log::debug!("AP {apsel} enabled");
        self.opened_aps.set(apsel);
        Ok(())
    }

    fn init_access_port(&mut self, ap: u8) -> Result<(), Error> {
        log::debug!("init ap_num = {ap}");
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_INIT_AP);
        ctx.cmd.write_u8(ap);
        self.transfer_checked(&mut ctx, 2)
    }

    // ----- queries ----------------------------------------------------------

    /// Reads the JTAG/SWD IDCODE of the connected target.
    pub fn get_id_code(&mut self) -> Result<u32, Error> {
        if self.mode == StLinkMode::DebugSwim {
            return Ok(0);
        }

        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::JTAG_READ_IDCODES);
        self.transfer_checked(&mut ctx, 12)?;

        ctx.data.read_u32_le(4)
    }

    /// Reads the target supply voltage from the probe's ADC.
    pub fn get_target_voltage(&mut self) -> Result<f32, Error> {
        if !self.version.flags.contains(Capabilities::HAS_TARGET_VOLT) {
            return Err(Error::NotSupported(
                "this probe cannot measure the target voltage",
            ));
        }

        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::GET_TARGET_VOLTAGE);
        self.transfer_raw(&mut ctx, 8)?;

        let a0 = ctx.data.read_u32_le(0)? as f32;
        let a1 = ctx.data.read_u32_le(4)? as f32;

        if a0 != 0.0 {
            Ok(2.0 * a1 * 1.2 / a0)
        } else {
            Err(Error::VoltageDivisionByZero)
        }
    }

    /// Selects the interface clock closest to `khz` from below. With
    /// `query`, only reports what would be chosen without programming it.
    /// Returns the chosen speed in kHz and whether it matched exactly.
    pub fn set_speed(&mut self, khz: u32, query: bool) -> Result<(u32, bool), Error> {
        match self.mode {
            StLinkMode::DebugSwd => {
                if self.version.api == ApiVersion::V3 {
                    self.set_speed_v3(false, khz, query)
                } else {
                    self.set_speed_swd(khz, query)
                }
            }
            StLinkMode::DebugJtag => {
                if self.version.api == ApiVersion::V3 {
                    self.set_speed_v3(true, khz, query)
                } else {
                    self.set_speed_jtag(khz, query)
                }
            }
            _ => Err(Error::NotSupported(
                "clock control is only available in SWD and JTAG modes",
            )),
        }
    }
}
