//! Byte transport over an embedded-hal serial port.
//!
//! Receive timeouts are measured by polling the port and sleeping a fixed
//! period between attempts, so the bound is wall-clock time rather than loop
//! iterations and does not depend on the core clock.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::serial::{Read, Write};

use crate::frame::{checksum, Decoder};
use crate::protocol::{MESSAGE_START, TOKEN};
use crate::Error;

pub struct Transport<S, D> {
    serial: S,
    delay: D,
    timeout_us: u32,
    poll_us: u32,
}

impl<S, D, E> Transport<S, D>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayUs<u32>,
{
    /// Wrap a serial port, `timeout_us` bounds each byte wait
    pub fn new(serial: S, delay: D, timeout_us: u32, poll_us: u32) -> Self {
        Self {
            serial,
            delay,
            timeout_us,
            poll_us: poll_us.max(1),
        }
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn delay_mut(&mut self) -> &mut D {
        &mut self.delay
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (S, D) {
        (self.serial, self.delay)
    }

    /// Transmit a byte, blocking until the port accepts it
    pub fn send(&mut self, b: u8) -> Result<(), Error<E>> {
        block!(self.serial.write(b))?;
        Ok(())
    }

    /// Block until every queued byte has left the port
    pub fn flush(&mut self) -> Result<(), Error<E>> {
        block!(self.serial.flush())?;
        Ok(())
    }

    /// Receive a byte, blocking indefinitely
    pub fn receive(&mut self) -> Result<u8, Error<E>> {
        let b = block!(self.serial.read())?;
        Ok(b)
    }

    /// Receive a byte or fail with [`Error::Timeout`] once the configured
    /// bound has elapsed
    pub fn receive_timeout(&mut self) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            match self.serial.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            }

            if t >= self.timeout_us {
                return Err(Error::Timeout);
            }

            self.delay.delay_us(self.poll_us);
            t = t.saturating_add(self.poll_us);
        }
    }

    /// Write a framed message
    pub fn send_frame(&mut self, seq: u8, body: &[u8]) -> Result<(), Error<E>> {
        let header = [
            MESSAGE_START,
            seq,
            (body.len() >> 8) as u8,
            body.len() as u8,
            TOKEN,
        ];

        for b in header.iter().chain(body.iter()) {
            self.send(*b)?;
        }
        self.send(checksum(&header) ^ checksum(body))?;

        self.flush()
    }

    /// Feed received bytes into `decoder` until it holds a complete frame
    ///
    /// Malformed frames are dropped and scanning continues. Timeouts and
    /// serial faults abandon the partial frame and are returned to the caller.
    pub fn receive_frame(&mut self, decoder: &mut Decoder) -> Result<(), Error<E>> {
        loop {
            let b = match self.receive_timeout() {
                Ok(b) => b,
                Err(e) => {
                    decoder.reset();
                    return Err(e);
                }
            };

            match decoder.push(b) {
                Ok(true) => return Ok(()),
                Ok(false) => (),
                Err(e) => debug!("Dropping frame: {}", e),
            }
        }
    }
}
