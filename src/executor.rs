//! Command dispatch.
//!
//! Every request body starts with a command byte and every response body
//! starts with the same command byte followed by a status byte.

use core::convert::TryFrom;

use crate::config::Config;
use crate::flash;
use crate::port::{Eeprom, SelfProgram};
use crate::protocol::{
    param, Command, Status, EXTENDED_ADDRESS_FLAG, PROGRAM_DATA_OFFSET, SIGN_ON_ID,
};

/// Whether memory-modifying commands are accepted
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Mode {
    Idle,
    Programming,
}

/// Per-session write state, reset on entering programming mode
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Session {
    /// Address as last loaded and since advanced: a word address for flash,
    /// a byte address for EEPROM
    pub address: u32,

    /// Bytes committed to flash or EEPROM this session
    pub written: u32,
}

/// Result of executing one request
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Outcome {
    /// Length of the response body
    pub len: usize,

    /// The host asked to leave the bootloader
    pub leave: bool,
}

pub struct Executor {
    config: Config,
    mode: Mode,
    session: Session,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            mode: Mode::Idle,
            session: Session::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Execute `request`, writing the response body into `response`
    ///
    /// `response` must hold at least [`crate::protocol::MAX_MESSAGE_SIZE`]
    /// bytes.
    pub fn execute<F, P>(
        &mut self,
        flash: &mut F,
        eeprom: &mut P,
        request: &[u8],
        response: &mut [u8],
    ) -> Outcome
    where
        F: SelfProgram,
        P: Eeprom,
    {
        let code = match request.first() {
            Some(c) => *c,
            None => {
                debug!("Empty request");
                return self.status(response, 0x00, Status::Unknown);
            }
        };

        let command = match Command::try_from(code) {
            Ok(c) => c,
            Err(_) => {
                debug!("Unknown command 0x{:02x}", code);
                return self.status(response, code, Status::Unknown);
            }
        };

        trace!("Executing {:?}", command);

        match command {
            Command::SignOn => {
                response[0] = code;
                response[1] = Status::Ok as u8;
                response[2] = SIGN_ON_ID.len() as u8;
                response[3..3 + SIGN_ON_ID.len()].copy_from_slice(SIGN_ON_ID);
                Outcome {
                    len: 3 + SIGN_ON_ID.len(),
                    leave: false,
                }
            }
            Command::GetParameter => match request.get(1) {
                Some(id) => {
                    response[0] = code;
                    response[1] = Status::Ok as u8;
                    response[2] = self.parameter(*id);
                    Outcome {
                        len: 3,
                        leave: false,
                    }
                }
                None => self.status(response, code, Status::Failed),
            },
            Command::SetParameter => self.status(response, code, Status::Ok),
            Command::LoadAddress => match request.get(1..5) {
                Some(a) => {
                    let word = u32::from_be_bytes([a[0], a[1], a[2], a[3]]);
                    self.session.address = word & !EXTENDED_ADDRESS_FLAG;
                    debug!("Address loaded: 0x{:08x}", self.session.address);
                    self.status(response, code, Status::Ok)
                }
                None => self.status(response, code, Status::Failed),
            },
            Command::EnterProgmode => {
                info!("Entering programming mode");
                self.mode = Mode::Programming;
                self.session = Session::default();
                self.status(response, code, Status::Ok)
            }
            Command::LeaveProgmode => {
                info!(
                    "Leaving programming mode, {} bytes written",
                    self.session.written
                );
                self.mode = Mode::Idle;
                let mut o = self.status(response, code, Status::Ok);
                o.leave = true;
                o
            }
            Command::ChipErase => {
                // Pages are erased as they are programmed
                debug!("Standalone chip erase not supported");
                self.status(response, code, Status::Failed)
            }
            Command::ProgramFlash => {
                let s = self.program_flash(flash, request);
                self.status(response, code, s)
            }
            Command::ProgramEeprom => {
                let s = self.program_eeprom(eeprom, request);
                self.status(response, code, s)
            }
            Command::ReadFlash => self.read_flash(flash, request, response),
            Command::ReadEeprom => self.read_eeprom(eeprom, request, response),
            Command::SpiMulti => self.spi_multi(request, response),
        }
    }

    fn status(&self, response: &mut [u8], code: u8, status: Status) -> Outcome {
        response[0] = code;
        response[1] = status as u8;
        Outcome {
            len: 2,
            leave: false,
        }
    }

    fn parameter(&self, id: u8) -> u8 {
        match id {
            param::BUILD_NUMBER_LOW | param::BUILD_NUMBER_HIGH => 0,
            param::HW_VER => self.config.hw_version,
            param::SW_MAJOR => self.config.sw_version.0,
            param::SW_MINOR => self.config.sw_version.1,
            _ => 0,
        }
    }

    /// Split a program request into its payload, checking the declared size
    fn payload(request: &[u8]) -> Option<&[u8]> {
        let size = u16::from_be_bytes([*request.get(1)?, *request.get(2)?]) as usize;
        request.get(PROGRAM_DATA_OFFSET..PROGRAM_DATA_OFFSET + size)
    }

    fn program_flash<F: SelfProgram>(&mut self, flash: &mut F, request: &[u8]) -> Status {
        if self.mode != Mode::Programming {
            warn!("Flash write outside programming mode");
            return Status::Failed;
        }

        let data = match Self::payload(request) {
            Some(d) => d,
            None => return Status::Failed,
        };

        let page_size = self.config.page_size;
        if data.len() > page_size as usize || data.len() % 2 != 0 {
            warn!("Invalid flash write size {}", data.len());
            return Status::Failed;
        }

        let address = match self.config.flash_address(self.session.address) {
            Some(a) if self.config.page_writable(a) => a,
            _ => {
                warn!("Rejecting flash write at word 0x{:05x}", self.session.address);
                return Status::Failed;
            }
        };

        if let Err(e) = flash::commit_page(flash, address, data, page_size) {
            error!("Page 0x{:05x} commit failed: {:?}", address, e);
            return Status::Failed;
        }

        if !flash::verify(flash, address, data) {
            error!("Page 0x{:05x} failed verification", address);
            return Status::Failed;
        }

        self.session.address += page_size as u32 / 2;
        self.session.written += data.len() as u32;

        Status::Ok
    }

    fn program_eeprom<P: Eeprom>(&mut self, eeprom: &mut P, request: &[u8]) -> Status {
        if self.mode != Mode::Programming {
            warn!("EEPROM write outside programming mode");
            return Status::Failed;
        }

        let data = match Self::payload(request) {
            Some(d) => d,
            None => return Status::Failed,
        };

        let start = self.session.address;
        if start + data.len() as u32 > self.config.eeprom_size as u32 {
            warn!("Rejecting EEPROM write at 0x{:04x}", start);
            return Status::Failed;
        }

        for (i, b) in data.iter().enumerate() {
            let a = (start as usize + i) as u16;

            let r = eeprom.write(a, *b).and_then(|_| block!(eeprom.poll()));
            if let Err(e) = r {
                error!("EEPROM write at 0x{:04x} failed: {:?}", a, e);
                return Status::Failed;
            }
            if eeprom.read(a) != *b {
                error!("EEPROM verify at 0x{:04x} failed", a);
                return Status::Failed;
            }

            self.session.address += 1;
            self.session.written += 1;
        }

        Status::Ok
    }

    /// Requested read size, if it fits the response
    fn read_size(request: &[u8], response: &[u8]) -> Option<usize> {
        let size = u16::from_be_bytes([*request.get(1)?, *request.get(2)?]) as usize;
        if size + 3 > response.len() {
            return None;
        }
        Some(size)
    }

    fn read_flash<F: SelfProgram>(
        &mut self,
        flash: &mut F,
        request: &[u8],
        response: &mut [u8],
    ) -> Outcome {
        let code = Command::ReadFlash as u8;

        let size = match Self::read_size(request, response) {
            Some(s) => s,
            None => return self.status(response, code, Status::Failed),
        };

        let address = match self.config.flash_address(self.session.address) {
            Some(a) if a as usize + size <= self.config.flash_size as usize => a,
            _ => {
                warn!("Rejecting flash read at word 0x{:05x}", self.session.address);
                return self.status(response, code, Status::Failed);
            }
        };

        for (i, v) in response[2..2 + size].iter_mut().enumerate() {
            *v = flash.read(address + i as u32);
        }
        self.session.address += (size as u32 + 1) / 2;

        self.read_response(response, code, size)
    }

    fn read_eeprom<P: Eeprom>(
        &mut self,
        eeprom: &mut P,
        request: &[u8],
        response: &mut [u8],
    ) -> Outcome {
        let code = Command::ReadEeprom as u8;

        let size = match Self::read_size(request, response) {
            Some(s) => s,
            None => return self.status(response, code, Status::Failed),
        };

        let address = self.session.address;
        if address as usize + size > self.config.eeprom_size as usize {
            warn!("Rejecting EEPROM read at 0x{:04x}", address);
            return self.status(response, code, Status::Failed);
        }

        for (i, v) in response[2..2 + size].iter_mut().enumerate() {
            *v = eeprom.read((address as usize + i) as u16);
        }
        self.session.address += size as u32;

        self.read_response(response, code, size)
    }

    fn read_response(&self, response: &mut [u8], code: u8, size: usize) -> Outcome {
        response[0] = code;
        response[1] = Status::Ok as u8;
        response[2 + size] = Status::Ok as u8;
        Outcome {
            len: 3 + size,
            leave: false,
        }
    }

    /// SPI_MULTI carries raw ISP instructions for a downstream target, which
    /// a self-programming part does not have. Reply with the shape a
    /// programmer expects so host retries do not stall.
    fn spi_multi(&mut self, request: &[u8], response: &mut [u8]) -> Outcome {
        let code = Command::SpiMulti as u8;

        if !self.config.spi_multi {
            return self.read_response(response, code, 0);
        }

        let num_rx = match request.get(2) {
            Some(n) => *n as usize,
            None => return self.status(response, code, Status::Failed),
        };
        if num_rx + 3 > response.len() {
            return self.status(response, code, Status::Failed);
        }

        // Shifted-in bytes lag the transmitted ones by one position
        let tx = request.get(4..).unwrap_or(&[]);
        for (i, v) in response[2..2 + num_rx].iter_mut().enumerate() {
            *v = match i {
                1 => tx.first().copied().unwrap_or(0),
                _ => 0,
            };
        }

        self.read_response(response, code, num_rx)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::config::{Config, ATMEGA328P};
    use crate::protocol::MAX_MESSAGE_SIZE;
    use crate::sim::{SimEeprom, SimFlash};

    struct Rig {
        exec: Executor,
        flash: SimFlash,
        eeprom: SimEeprom,
        response: [u8; MAX_MESSAGE_SIZE],
    }

    impl Rig {
        fn new(config: Config) -> Self {
            Self {
                flash: SimFlash::new(config.flash_size, config.page_size),
                eeprom: SimEeprom::new(config.eeprom_size),
                exec: Executor::new(config),
                response: [0u8; MAX_MESSAGE_SIZE],
            }
        }

        fn run(&mut self, request: &[u8]) -> (Vec<u8>, bool) {
            let o = self
                .exec
                .execute(&mut self.flash, &mut self.eeprom, request, &mut self.response);
            (self.response[..o.len].to_vec(), o.leave)
        }

        fn load(&mut self, word: u32) {
            let a = word.to_be_bytes();
            assert_eq!(self.run(&[0x06, a[0], a[1], a[2], a[3]]).0, vec![0x06, 0x00]);
        }

        fn program(&mut self, cmd: u8, data: &[u8]) -> Vec<u8> {
            let mut req = vec![cmd, (data.len() >> 8) as u8, data.len() as u8, 0xC1, 6, 0x40, 0x4C, 0x20, 0, 0];
            req.extend_from_slice(data);
            self.run(&req).0
        }
    }

    #[test]
    fn sign_on_identifies_as_avrisp() {
        let mut r = Rig::new(ATMEGA328P);
        let (resp, leave) = r.run(&[0x01]);
        assert_eq!(&resp[..3], &[0x01, 0x00, 8]);
        assert_eq!(&resp[3..], b"AVRISP_2");
        assert!(!leave);
    }

    #[test]
    fn parameters_report_versions() {
        let mut r = Rig::new(ATMEGA328P);
        assert_eq!(r.run(&[0x03, param::HW_VER]).0, vec![0x03, 0x00, 0x0F]);
        assert_eq!(r.run(&[0x03, param::SW_MAJOR]).0, vec![0x03, 0x00, 0x02]);
        assert_eq!(r.run(&[0x03, param::SW_MINOR]).0, vec![0x03, 0x00, 0x0A]);
        assert_eq!(r.run(&[0x03, param::VTARGET]).0, vec![0x03, 0x00, 0x00]);
        assert_eq!(r.run(&[0x03]).0, vec![0x03, 0xC0]);
        assert_eq!(r.run(&[0x02, 0x98, 0x01]).0, vec![0x02, 0x00]);
    }

    #[test]
    fn program_mode_toggles() {
        let mut r = Rig::new(ATMEGA328P);
        assert_eq!(r.exec.mode(), Mode::Idle);
        assert_eq!(r.run(&[0x10]), (vec![0x10, 0x00], false));
        assert_eq!(r.exec.mode(), Mode::Programming);
        assert_eq!(r.run(&[0x11]), (vec![0x11, 0x00], true));
        assert_eq!(r.exec.mode(), Mode::Idle);
    }

    #[test]
    fn chip_erase_reports_failure() {
        let mut r = Rig::new(ATMEGA328P);
        r.run(&[0x10]);
        assert_eq!(r.run(&[0x12, 0, 0, 0, 0, 0, 0]).0, vec![0x12, 0xC0]);
    }

    #[test]
    fn unknown_and_empty_requests_answer_unknown() {
        let mut r = Rig::new(ATMEGA328P);
        assert_eq!(r.run(&[0x1B, 0, 0, 0, 0]).0, vec![0x1B, 0xC9]);
        assert_eq!(r.run(&[0x77]).0, vec![0x77, 0xC9]);
        assert_eq!(r.run(&[]).0, vec![0x00, 0xC9]);
    }

    #[test]
    fn flash_write_requires_program_mode() {
        let mut r = Rig::new(ATMEGA328P);
        r.load(0);
        assert_eq!(r.program(0x13, &[0x5A; 128]), vec![0x13, 0xC0]);
        assert_eq!(r.flash.erase_count(), 0);
    }

    #[test]
    fn flash_page_written_and_read_back() {
        let mut r = Rig::new(ATMEGA328P);
        let data: Vec<u8> = (0..128).map(|i| (i * 3) as u8).collect();

        r.run(&[0x10]);
        r.load(0x40);
        assert_eq!(r.program(0x13, &data), vec![0x13, 0x00]);
        assert_eq!(r.exec.session().address, 0x80);
        assert_eq!(r.exec.session().written, 128);

        r.load(0x40);
        let (resp, _) = r.run(&[0x14, 0x00, 0x80, 0x20]);
        assert_eq!(resp.len(), 131);
        assert_eq!(&resp[..2], &[0x14, 0x00]);
        assert_eq!(&resp[2..130], &data[..]);
        assert_eq!(resp[130], 0x00);
    }

    #[test]
    fn repeated_write_is_idempotent() {
        let mut r = Rig::new(ATMEGA328P);
        let data = [0xA5u8; 128];

        r.run(&[0x10]);
        r.load(0x100);
        r.program(0x13, &data);
        let first = r.flash.contents().to_vec();

        r.load(0x100);
        assert_eq!(r.program(0x13, &data), vec![0x13, 0x00]);
        assert_eq!(r.flash.contents(), &first[..]);
    }

    #[test]
    fn bootloader_section_is_protected() {
        let c = ATMEGA328P;
        let mut r = Rig::new(c);
        let before = r.flash.contents().to_vec();

        r.run(&[0x10]);
        r.load(c.app_end() / 2);
        assert_eq!(r.program(0x13, &[0u8; 128]), vec![0x13, 0xC0]);

        r.load((c.flash_size - 128) / 2);
        assert_eq!(r.program(0x13, &[0u8; 128]), vec![0x13, 0xC0]);

        assert_eq!(r.flash.erase_count(), 0);
        assert_eq!(r.flash.contents(), &before[..]);
    }

    #[test]
    fn address_past_flash_does_not_wrap_onto_page_zero() {
        let mut r = Rig::new(ATMEGA328P);
        r.run(&[0x10]);
        r.load(0);
        assert_eq!(r.program(0x13, &[0x11; 128]), vec![0x13, 0x00]);

        r.load(0x8000);
        assert_eq!(r.program(0x13, &[0x42; 128]), vec![0x13, 0xC0]);
        assert_eq!(&r.flash.contents()[..128], &[0x11; 128][..]);
        assert_eq!(r.flash.erase_count(), 1);

        r.load(0x8000);
        assert_eq!(r.run(&[0x14, 0x00, 0x80, 0x20]).0, vec![0x14, 0xC0]);
    }

    #[test]
    fn cursor_stops_at_application_end() {
        let c = ATMEGA328P;
        let mut r = Rig::new(c);

        r.run(&[0x10]);
        r.load((c.app_end() - 128) / 2);
        assert_eq!(r.program(0x13, &[1u8; 128]), vec![0x13, 0x00]);
        assert_eq!(r.program(0x13, &[2u8; 128]), vec![0x13, 0xC0]);
        assert_eq!(r.flash.erase_count(), 1);
    }

    #[test]
    fn misaligned_and_odd_writes_fail() {
        let mut r = Rig::new(ATMEGA328P);
        r.run(&[0x10]);

        r.load(0x01);
        assert_eq!(r.program(0x13, &[0u8; 128]), vec![0x13, 0xC0]);

        r.load(0x00);
        assert_eq!(r.program(0x13, &[0u8; 127]), vec![0x13, 0xC0]);
        assert_eq!(r.program(0x13, &[0u8; 130]), vec![0x13, 0xC0]);
        assert_eq!(r.flash.erase_count(), 0);
    }

    #[test]
    fn truncated_program_request_fails() {
        let mut r = Rig::new(ATMEGA328P);
        r.run(&[0x10]);
        r.load(0);
        assert_eq!(r.run(&[0x13, 0x00, 0x80, 0, 0, 0, 0, 0, 0, 0, 1, 2]).0, vec![0x13, 0xC0]);
    }

    #[test]
    fn flash_fault_reports_failure_and_continues() {
        let mut r = Rig::new(ATMEGA328P);
        r.run(&[0x10]);
        r.flash.fail_writes(true);
        r.load(0);
        assert_eq!(r.program(0x13, &[7u8; 128]), vec![0x13, 0xC0]);

        r.flash.fail_writes(false);
        r.load(0);
        assert_eq!(r.program(0x13, &[7u8; 128]), vec![0x13, 0x00]);
    }

    #[test]
    fn eeprom_written_byte_by_byte() {
        let mut r = Rig::new(ATMEGA328P);
        r.run(&[0x10]);
        r.load(0x10);
        assert_eq!(r.program(0x15, &[1, 2, 3, 4]), vec![0x15, 0x00]);
        assert_eq!(r.exec.session().address, 0x14);

        r.load(0x10);
        assert_eq!(r.run(&[0x16, 0x00, 0x04, 0xA0]).0, vec![0x16, 0x00, 1, 2, 3, 4, 0x00]);
    }

    #[test]
    fn eeprom_bounds_are_checked() {
        let c = ATMEGA328P;
        let mut r = Rig::new(c);
        r.run(&[0x10]);
        r.load(c.eeprom_size as u32 - 2);
        assert_eq!(r.program(0x15, &[1, 2, 3, 4]), vec![0x15, 0xC0]);
        assert_eq!(r.run(&[0x16, 0x00, 0x04, 0xA0]).0, vec![0x16, 0xC0]);
    }

    #[test]
    fn oversize_read_fails() {
        let mut r = Rig::new(ATMEGA328P);
        r.load(0);
        assert_eq!(r.run(&[0x14, 0x01, 0x20, 0x20]).0, vec![0x14, 0xC0]);
    }

    #[test]
    fn spi_multi_answers_with_shifted_bytes() {
        let mut r = Rig::new(ATMEGA328P);
        let (resp, _) = r.run(&[0x1D, 4, 4, 0, 0x30, 0x00, 0x00, 0x00]);
        assert_eq!(resp, vec![0x1D, 0x00, 0x00, 0x30, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn spi_multi_disabled_answers_empty() {
        let c = Config {
            spi_multi: false,
            ..ATMEGA328P
        };
        let mut r = Rig::new(c);
        assert_eq!(r.run(&[0x1D, 4, 4, 0, 0x30, 0, 0, 0]).0, vec![0x1D, 0x00, 0x00]);
    }
}
