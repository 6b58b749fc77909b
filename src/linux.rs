use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Flasher, NbTransport, Options};

/// Flasher over a linux serial port
pub type LinuxFlasher = Flasher<NbTransport<Serial, Delay>>;

impl Flasher<NbTransport<Serial, Delay>> {
    /// Open a linux serial port connected to a running stub
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Keep blocking reads short, timeouts are handled by polling
        port.0
            .set_timeout(Duration::from_millis(options.poll_delay_ms.max(1) as u64))?;

        debug!("Opened serial port at {} baud", baud);

        let transport = NbTransport::new(port, Delay {}, options.poll_delay_ms);

        // Return instance
        Ok(Self::new(transport, options))
    }
}
