//! Byte channel to the stub.
//!
//! The flasher only needs a duplex byte stream with bounded reads. Opening
//! and configuring the port is left to the caller.

use core::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::error::TransportError;

/// Duplex byte channel to the device
pub trait Transport {
    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the first.
    ///
    /// Returns `Ok(0)` if nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write some of `data`, returning the number of bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Flush any buffered output
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the channel
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Write all of `data`
    fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => return Err(TransportError::Disconnected),
                n => data = &data[n..],
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

/// [`Transport`] over an `embedded-hal` serial port, polling for input
pub struct NbTransport<P, D> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
}

impl<P, D, E> NbTransport<P, D>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
        }
    }

    /// Fetch the underlying port
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }
}

fn serial_error<E: core::fmt::Debug>(e: E) -> TransportError {
    TransportError::Serial(format!("{:?}", e))
}

impl<P, D, E> Transport for NbTransport<P, D>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let mut t = 0;
        let mut n = 0;

        while n < buf.len() {
            // Attempt to read from serial port
            match self.port.read() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                    continue;
                }
                Err(nb::Error::WouldBlock) if n > 0 => break,
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(serial_error(e)),
            }

            if t >= timeout_ms {
                break;
            }

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            t += self.poll_delay_ms;
        }

        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        for b in data {
            block!(self.port.write(*b)).map_err(serial_error)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        block!(self.port.flush()).map_err(serial_error)
    }
}
