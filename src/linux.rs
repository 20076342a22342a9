use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use embedded_hal::serial::{Read, Write};
use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

/// Serial tty with non-blocking reads
///
/// The tty read timeout is zero, so an empty receive buffer surfaces as a
/// timed out read. That is reported as `WouldBlock` so response timeouts are
/// left to the programmer's polling loop.
pub struct Tty(pub Serial);

impl Read<u8> for Tty {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, IoErrorKind> {
        match self.0.read() {
            Err(nb::Error::Other(IoErrorKind::TimedOut))
            | Err(nb::Error::Other(IoErrorKind::WouldBlock)) => Err(nb::Error::WouldBlock),
            r => r,
        }
    }
}

impl Write<u8> for Tty {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), IoErrorKind> {
        self.0.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), IoErrorKind> {
        self.0.flush()
    }
}

impl SerialPort<IoErrorKind> for Tty {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        (self.0).0.set_rts(level).map_err(|e| {
            error!("Failed to set RTS: {:?}", e);
            IoErrorKind::Other
        })
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        (self.0).0.set_dtr(level).map_err(|e| {
            error!("Failed to set DTR: {:?}", e);
            IoErrorKind::Other
        })
    }
}

impl Programmer<Tty, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, 8N1 without flow control
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(Duration::from_millis(0))?;

        // Return instance
        Ok(Self::new(Tty(port), Delay {}, options))
    }
}
