//! STK500v2 Serial Bootloader.
//!
//! Based on AN068 (STK500 Communication Protocol) and AN109 (Self-programming).
//!
//! The device side is [`bootloader::boot`], which decides at reset whether to
//! stay resident and, if so, services framed requests to read and write the
//! part's own flash and EEPROM before jumping to the application. The host
//! side is [`Programmer`], which speaks the same protocol over a serial port.

#![cfg_attr(not(feature = "std"), no_std)]

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(feature = "std")]
pub mod sim;

pub mod bootloader;
pub mod config;
pub mod executor;
pub mod flash;
pub mod frame;
pub mod port;
pub mod protocol;
pub mod transport;

pub use bootloader::{boot, Bootloader, Entry, Exit};
pub use config::Config;
pub use frame::FrameError;
pub use protocol::{Command, Status};

use frame::Decoder;
use protocol::{param, EXTENDED_ADDRESS_FLAG, MAX_MESSAGE_SIZE, PROGRAM_DATA_OFFSET};
use transport::Transport;

/// Largest chunk requested by a single read
pub const MAX_CHUNK: usize = 256;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Connected,
    Programming,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timed out awaiting response")]
    Timeout,

    #[error("command 0x{0:02x} returned status 0x{1:02x}")]
    Status(u8, u8),

    #[error("sequence mismatch (sent {sent}, received {received})")]
    SequenceMismatch { sent: u8, received: u8 },

    #[error("invalid response")]
    InvalidResponse,

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("flash address 0x{0:05x} is not word aligned")]
    UnalignedAddress(u32),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub poll_delay_us: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,

    /// Number of sign-on attempts before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub sync_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            poll_delay_us: 100,
            init_delay_ms: 50,
            sync_attempts: 5,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    transport: Transport<P, D>,
    decoder: Decoder,
    seq: u8,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32> + DelayUs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let transport = Transport::new(
            port,
            delay,
            options.response_timeout_ms.saturating_mul(1000),
            options.poll_delay_us,
        );

        Self {
            state: State::Init,
            options,
            transport,
            decoder: Decoder::new(),
            seq: 0,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&mut self) -> State {
        self.state
    }

    /// Release the serial port and delay
    pub fn free(self) -> (P, D) {
        self.transport.free()
    }

    /// Reset the device (unless disabled) and synchronise with the bootloader
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            debug!("Resetting device");

            self.transport.serial_mut().set_dtr(true)?;
            self.transport.serial_mut().set_rts(true)?;

            self.transport.delay_mut().delay_ms(100u32);

            self.transport.serial_mut().set_dtr(false)?;
            self.transport.serial_mut().set_rts(false)?;

            let d = self.options.init_delay_ms;
            self.transport.delay_mut().delay_ms(d);
        }

        debug!("Awaiting bootloader sign-on");

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.sign_on() {
                Ok(id) => {
                    debug!("Signed on: {:?}", core::str::from_utf8(&id));
                    self.state = State::Connected;
                    return Ok(());
                }
                Err(e)
                    if attempt < self.options.sync_attempts
                        && matches!(
                            e,
                            Error::Timeout
                                | Error::InvalidResponse
                                | Error::SequenceMismatch { .. }
                        ) =>
                {
                    debug!("Sign-on attempt {} failed: {:?}", attempt, e);
                }
                Err(e) => {
                    error!("Sign-on failed: {:?}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Send a request and return the body of the matching response
    ///
    /// The response must echo the sequence number and command, and carry
    /// [`Status::Ok`].
    pub fn command(&mut self, request: &[u8]) -> Result<&[u8], Error<E>> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        trace!("Sending seq {} {:02x?}", seq, request);
        self.transport.send_frame(seq, request)?;
        self.transport.receive_frame(&mut self.decoder)?;

        let received = self.decoder.seq();
        if received != seq {
            warn!("Sequence mismatch: sent {}, received {}", seq, received);
            return Err(Error::SequenceMismatch { sent: seq, received });
        }

        let body = self.decoder.body();
        match (request.first(), body) {
            (Some(c), [r, s, ..]) if c == r => {
                if *s != Status::Ok as u8 {
                    match Status::from_u8(*s) {
                        Some(status) => debug!("Command 0x{:02x} failed: {:?}", c, status),
                        None => debug!("Command 0x{:02x} failed with status 0x{:02x}", c, s),
                    }
                    return Err(Error::Status(*c, *s));
                }
            }
            _ => return Err(Error::InvalidResponse),
        }

        Ok(body)
    }

    /// Fetch the bootloader identification string
    pub fn sign_on(&mut self) -> Result<[u8; 8], Error<E>> {
        let body = self.command(&[Command::SignOn as u8])?;

        let mut id = [0u8; 8];
        match body {
            [_, _, 8, rest @ ..] if rest.len() == 8 => id.copy_from_slice(rest),
            _ => return Err(Error::InvalidResponse),
        }

        Ok(id)
    }

    pub fn get_parameter(&mut self, id: u8) -> Result<u8, Error<E>> {
        let body = self.command(&[Command::GetParameter as u8, id])?;
        body.get(2).copied().ok_or(Error::InvalidResponse)
    }

    pub fn set_parameter(&mut self, id: u8, value: u8) -> Result<(), Error<E>> {
        self.command(&[Command::SetParameter as u8, id, value])?;
        Ok(())
    }

    /// Fetch the (hardware, software major, software minor) versions
    pub fn version(&mut self) -> Result<(u8, u8, u8), Error<E>> {
        Ok((
            self.get_parameter(param::HW_VER)?,
            self.get_parameter(param::SW_MAJOR)?,
            self.get_parameter(param::SW_MINOR)?,
        ))
    }

    pub fn enter_progmode(&mut self) -> Result<(), Error<E>> {
        // timeout, stabDelay, cmdexeDelay, synchLoops, byteDelay, pollValue,
        // pollIndex, then the ISP programming enable instruction
        self.command(&[
            Command::EnterProgmode as u8,
            200,
            100,
            25,
            32,
            0,
            0x53,
            3,
            0xAC,
            0x53,
            0x00,
            0x00,
        ])?;
        self.state = State::Programming;
        Ok(())
    }

    /// Leave programming mode, the bootloader then starts the application
    pub fn leave_progmode(&mut self) -> Result<(), Error<E>> {
        self.command(&[Command::LeaveProgmode as u8, 1, 1])?;
        self.state = State::Connected;
        Ok(())
    }

    /// Request a chip erase, which the bootloader refuses
    pub fn chip_erase(&mut self) -> Result<(), Error<E>> {
        self.command(&[Command::ChipErase as u8, 55, 0, 0xAC, 0x80, 0x00, 0x00])?;
        Ok(())
    }

    /// Load a word (flash) or byte (EEPROM) address
    pub fn load_address(&mut self, address: u32) -> Result<(), Error<E>> {
        let mut a = address;
        if a > 0xFFFF {
            a |= EXTENDED_ADDRESS_FLAG;
        }
        let a = a.to_be_bytes();
        self.command(&[Command::LoadAddress as u8, a[0], a[1], a[2], a[3]])?;
        Ok(())
    }

    fn program(&mut self, command: Command, data: &[u8]) -> Result<(), Error<E>> {
        let n = PROGRAM_DATA_OFFSET + data.len();
        if n > MAX_MESSAGE_SIZE {
            return Err(Error::BufferTooSmall);
        }

        let mut req = [0u8; MAX_MESSAGE_SIZE];
        req[..PROGRAM_DATA_OFFSET].copy_from_slice(&[
            command as u8,
            (data.len() >> 8) as u8,
            data.len() as u8,
            0xC1,
            10,
            0x40,
            0x4C,
            0x20,
            0x00,
            0x00,
        ]);
        req[PROGRAM_DATA_OFFSET..n].copy_from_slice(data);

        self.command(&req[..n])?;
        Ok(())
    }

    fn read(&mut self, command: Command, data: &mut [u8]) -> Result<(), Error<E>> {
        let n = data.len();
        let body = self.command(&[command as u8, (n >> 8) as u8, n as u8, 0x20])?;

        if body.len() != n + 3 {
            return Err(Error::InvalidResponse);
        }
        data.copy_from_slice(&body[2..2 + n]);

        Ok(())
    }

    /// Write one flash page at a page-aligned byte address
    pub fn program_flash_page(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        debug!("Programming {} bytes at 0x{:05x}", data.len(), address);
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }
        self.load_address(address / 2)?;
        self.program(Command::ProgramFlash, data)
    }

    /// Read flash starting at an even byte address
    pub fn read_flash(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }
        for (i, chunk) in data.chunks_mut(MAX_CHUNK).enumerate() {
            let a = address + (i * MAX_CHUNK) as u32;
            self.load_address(a / 2)?;
            self.read(Command::ReadFlash, chunk)?;
        }
        Ok(())
    }

    /// Write EEPROM starting at a byte address
    pub fn program_eeprom(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        for (i, chunk) in data.chunks(MAX_CHUNK).enumerate() {
            self.load_address(address + (i * MAX_CHUNK) as u32)?;
            self.program(Command::ProgramEeprom, chunk)?;
        }
        Ok(())
    }

    /// Read EEPROM starting at a byte address
    pub fn read_eeprom(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        for (i, chunk) in data.chunks_mut(MAX_CHUNK).enumerate() {
            self.load_address(address + (i * MAX_CHUNK) as u32)?;
            self.read(Command::ReadEeprom, chunk)?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::frame::{encode, FRAME_OVERHEAD};
    use crate::sim::{NoDelay, SimPort};

    fn programmer() -> (SimPort, Programmer<SimPort, NoDelay, core::convert::Infallible>) {
        let (host, device) = SimPort::pair();
        let options = Options {
            no_reset: true,
            response_timeout_ms: 1,
            ..Options::default()
        };
        (device, Programmer::new(host, NoDelay, options))
    }

    fn reply(device: &mut SimPort, seq: u8, body: &[u8]) {
        let mut buff = [0u8; MAX_MESSAGE_SIZE + FRAME_OVERHEAD];
        let n = encode(seq, body, &mut buff).unwrap();
        device.inject(&buff[..n]);
    }

    #[test]
    fn sign_on_returns_identifier() {
        let (mut device, mut p) = programmer();
        reply(&mut device, 0, b"\x01\x00\x08AVRISP_2");

        assert_eq!(&p.sign_on().unwrap(), b"AVRISP_2");
    }

    #[test]
    fn init_retries_until_sign_on() {
        let (mut device, mut p) = programmer();
        // A stale reply answers the first attempt, the second succeeds
        reply(&mut device, 5, b"\x01\x00\x08AVRISP_2");
        reply(&mut device, 1, b"\x01\x00\x08AVRISP_2");

        p.init().unwrap();
        assert_eq!(p.state(), State::Connected);
    }

    #[test]
    fn init_pulses_reset_lines() {
        let (mut device, host) = SimPort::pair();
        let mut p = Programmer::new(host, NoDelay, Options::default());
        reply(&mut device, 0, b"\x01\x00\x08AVRISP_2");

        p.init().unwrap();
        let (port, _) = p.free();
        assert!(!port.dtr());
        assert!(!port.rts());
    }

    #[test]
    fn failed_status_is_reported() {
        let (mut device, mut p) = programmer();
        reply(&mut device, 0, &[0x12, 0xC0]);

        assert_eq!(p.chip_erase(), Err(Error::Status(0x12, 0xC0)));
    }

    #[test]
    fn mismatched_sequence_is_rejected() {
        let (mut device, mut p) = programmer();
        reply(&mut device, 7, &[0x03, 0x00, 0x0F]);

        assert_eq!(
            p.get_parameter(param::HW_VER),
            Err(Error::SequenceMismatch {
                sent: 0,
                received: 7
            })
        );
    }

    #[test]
    fn mismatched_command_is_rejected() {
        let (mut device, mut p) = programmer();
        reply(&mut device, 0, &[0x02, 0x00]);

        assert_eq!(p.get_parameter(param::HW_VER), Err(Error::InvalidResponse));
    }

    #[test]
    fn silence_times_out() {
        let (_device, mut p) = programmer();
        assert_eq!(p.sign_on(), Err(Error::Timeout));
    }

    #[test]
    fn load_address_marks_extended_addresses() {
        let (mut device, mut p) = programmer();
        reply(&mut device, 0, &[0x06, 0x00]);
        reply(&mut device, 1, &[0x06, 0x00]);

        p.load_address(0x0000_1000).unwrap();
        p.load_address(0x0001_0000).unwrap();

        let mut d = Decoder::new();
        let mut sent = vec![];
        for b in device.drain() {
            if d.push(b).unwrap() {
                sent.push(d.body().to_vec());
            }
        }
        assert_eq!(sent[0], vec![0x06, 0x00, 0x00, 0x10, 0x00]);
        assert_eq!(sent[1], vec![0x06, 0x80, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn odd_flash_addresses_are_refused_locally() {
        let (mut device, mut p) = programmer();
        let mut data = [0u8; 4];

        assert_eq!(p.read_flash(0x101, &mut data), Err(Error::UnalignedAddress(0x101)));
        assert_eq!(
            p.program_flash_page(0x81, &[0u8; 4]),
            Err(Error::UnalignedAddress(0x81))
        );
        assert!(device.drain().is_empty());
    }

    #[test]
    fn oversize_page_is_refused_locally() {
        let (mut device, mut p) = programmer();
        reply(&mut device, 0, &[0x06, 0x00]);

        assert_eq!(
            p.program_flash_page(0, &[0u8; MAX_MESSAGE_SIZE]),
            Err(Error::BufferTooSmall)
        );
    }
}
