//! SWO trace capture through the probe's trace FIFO.

use crate::constants::{
    commands, TPIU_ACPR_MAX_SWO_SCALER, TRACE_MAX_HZ, TRACE_SIZE,
};
use crate::error::Error;
use crate::stlink::StLink;
use crate::transfer::{TransferContext, TransferDirection};
use crate::usb_interface::{StLinkUsb, READ_TIMEOUT};
use crate::version::Capabilities;

#[derive(Debug, Default)]
pub(crate) struct TraceState {
    pub enabled: bool,
    pub source_hz: u32,
}

impl<D: StLinkUsb> StLink<D> {
    /// Configures trace capture. Returns the TPIU asynchronous prescaler the
    /// caller must program, `ceil(clk_in / trace_freq)`. A `trace_freq_hz`
    /// of zero selects the fastest supported rate. Only UART-style
    /// asynchronous output is supported.
    pub fn config_trace(
        &mut self,
        enabled: bool,
        mut trace_freq_hz: u32,
        clk_in_hz: u32,
    ) -> Result<u16, Error> {
        if enabled && !self.capabilities().contains(Capabilities::HAS_TRACE) {
            return Err(Error::NotSupported(
                "the attached ST-Link version does not support this trace mode",
            ));
        }

        if !enabled {
            if self.capabilities().contains(Capabilities::HAS_TRACE) {
                self.trace_disable()?;
            }
            return Ok(0);
        }

        if trace_freq_hz > TRACE_MAX_HZ {
            return Err(Error::Config(format!(
                "trace frequency {trace_freq_hz} Hz is above the {TRACE_MAX_HZ} Hz ceiling"
            )));
        }

        self.trace_disable()?;

        if trace_freq_hz == 0 {
            trace_freq_hz = TRACE_MAX_HZ;
        }

        let mut prescaler = clk_in_hz / trace_freq_hz;
        if clk_in_hz % trace_freq_hz > 0 {
            prescaler += 1;
        }

        if prescaler > TPIU_ACPR_MAX_SWO_SCALER {
            return Err(Error::Config(
                "SWO frequency is not suitable, choose a different trace frequency".into(),
            ));
        }

        self.trace.source_hz = trace_freq_hz;
        self.trace_enable()?;

        Ok(prescaler as u16)
    }

    /// Drains pending trace bytes into `buf`, returning how many arrived.
    /// A disabled trace unit yields zero bytes rather than an error.
    pub fn poll_trace(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty()
            || !(self.trace.enabled && self.capabilities().contains(Capabilities::HAS_TRACE))
        {
            return Ok(0);
        }

        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::SWO_GET_TRACE_NEW_RECORD_NB);
        self.transfer_raw(&mut ctx, 2)?;

        let available = ctx.data.read_u16_le(0)? as usize;
        let wanted = if available < buf.len() {
            available
        } else {
            buf.len() - 1
        };

        if wanted == 0 {
            return Ok(0);
        }

        self.device.read_trace(&mut buf[..wanted], READ_TIMEOUT)
    }

    fn trace_enable(&mut self) -> Result<(), Error> {
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::SWO_START_TRACE_RECEPTION);
        ctx.cmd.write_u16_le(TRACE_SIZE);
        ctx.cmd.write_u32_le(self.trace.source_hz);

        self.transfer_checked(&mut ctx, 2)?;

        self.trace.enabled = true;
        log::debug!("tracing: recording at {} Hz", self.trace.source_hz);
        Ok(())
    }

    fn trace_disable(&mut self) -> Result<(), Error> {
        log::debug!("tracing: disable");
        let mut ctx = TransferContext::new(TransferDirection::Incoming);
        ctx.cmd.write_u8(commands::DEBUG_COMMAND);
        ctx.cmd.write_u8(commands::SWO_STOP_TRACE_RECEPTION);

        self.transfer_checked(&mut ctx, 2)?;

        self.trace.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::constants::StLinkMode;
    use crate::error::Error;
    use crate::fake_usb::{open_probe, FakeUsb};

    #[test]
    fn prescaler_is_rounded_up_and_capped() {
        let fake = FakeUsb::new(2, 29, 5);
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);

        // 72 MHz / 2 MHz = 36 exactly
        assert_eq!(probe.config_trace(true, 2_000_000, 72_000_000).unwrap(), 36);
        // 72 MHz / 1.75 MHz rounds up
        assert_eq!(probe.config_trace(true, 1_750_000, 72_000_000).unwrap(), 42);

        // an absurd input clock overflows the 13-bit prescaler
        let result = probe.config_trace(true, 1_000, 72_000_000);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn trace_frequency_ceiling_is_enforced() {
        let fake = FakeUsb::new(2, 29, 5);
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);
        let result = probe.config_trace(true, 2_000_001, 72_000_000);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn trace_requires_capability() {
        // V2J12 predates trace support
        let fake = FakeUsb::new(2, 12, 5);
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);
        let result = probe.config_trace(true, 0, 72_000_000);
        assert!(matches!(result, Err(Error::NotSupported(_))));
        // disabling on such a probe is a harmless no-op
        assert_eq!(probe.config_trace(false, 0, 0).unwrap(), 0);
    }

    #[test]
    fn poll_drains_available_bytes() {
        let fake = FakeUsb::new(2, 29, 5);
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);
        probe.config_trace(true, 2_000_000, 72_000_000).unwrap();

        probe.device_mut().trace_data = vec![0xaa, 0xbb, 0xcc];
        let mut buf = [0u8; 16];
        let read = probe.poll_trace(&mut buf).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf[..3], &[0xaa, 0xbb, 0xcc]);

        // nothing pending on the second poll
        assert_eq!(probe.poll_trace(&mut buf).unwrap(), 0);
    }

    #[test]
    fn poll_without_enable_reads_nothing() {
        let fake = FakeUsb::new(2, 29, 5);
        let mut probe = open_probe(fake, StLinkMode::DebugSwd);
        probe.device_mut().trace_data = vec![0xaa];
        let mut buf = [0u8; 4];
        assert_eq!(probe.poll_trace(&mut buf).unwrap(), 0);
    }
}
