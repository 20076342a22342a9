//! STK500v2 wire vocabulary.
//!
//! Based on AN068 (STK500 Communication Protocol).

use core::convert::TryFrom;

/// First byte of every message
pub const MESSAGE_START: u8 = 0x1B;

/// Fixed byte between the length and the body
pub const TOKEN: u8 = 0x0E;

/// Largest body either side will buffer
pub const MAX_MESSAGE_SIZE: usize = 285;

/// Identification string returned by [`Command::SignOn`]
pub const SIGN_ON_ID: &[u8] = b"AVRISP_2";

/// Set in a loaded word address to request extended (>128k) addressing
pub const EXTENDED_ADDRESS_FLAG: u32 = 0x8000_0000;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Identify the bootloader
    SignOn = 0x01,

    /// Write a configuration parameter
    SetParameter = 0x02,

    /// Read a configuration parameter
    GetParameter = 0x03,

    /// Set the word address used by subsequent reads and writes
    LoadAddress = 0x06,

    /// Enter programming mode
    EnterProgmode = 0x10,

    /// Leave programming mode and start the application
    LeaveProgmode = 0x11,

    /// Erase the whole chip (not supported as a standalone operation)
    ChipErase = 0x12,

    /// Program one page of flash at the loaded address
    ProgramFlash = 0x13,

    /// Read flash from the loaded address
    ReadFlash = 0x14,

    /// Program EEPROM from the loaded address
    ProgramEeprom = 0x15,

    /// Read EEPROM from the loaded address
    ReadEeprom = 0x16,

    /// Raw multi-byte SPI passthrough
    SpiMulti = 0x1D,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let c = match v {
            0x01 => Command::SignOn,
            0x02 => Command::SetParameter,
            0x03 => Command::GetParameter,
            0x06 => Command::LoadAddress,
            0x10 => Command::EnterProgmode,
            0x11 => Command::LeaveProgmode,
            0x12 => Command::ChipErase,
            0x13 => Command::ProgramFlash,
            0x14 => Command::ReadFlash,
            0x15 => Command::ProgramEeprom,
            0x16 => Command::ReadEeprom,
            0x1D => Command::SpiMulti,
            _ => return Err(v),
        };
        Ok(c)
    }
}

/// Status byte following the command echo in every response
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    Timeout = 0x80,
    Failed = 0xC0,
    ChecksumError = 0xC1,
    Unknown = 0xC9,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Status::Ok),
            0x80 => Some(Status::Timeout),
            0xC0 => Some(Status::Failed),
            0xC1 => Some(Status::ChecksumError),
            0xC9 => Some(Status::Unknown),
            _ => None,
        }
    }
}

/// Parameter identifiers understood by [`Command::GetParameter`]
pub mod param {
    pub const BUILD_NUMBER_LOW: u8 = 0x80;
    pub const BUILD_NUMBER_HIGH: u8 = 0x81;
    pub const HW_VER: u8 = 0x90;
    pub const SW_MAJOR: u8 = 0x91;
    pub const SW_MINOR: u8 = 0x92;
    pub const VTARGET: u8 = 0x94;
}

/// Offset of the payload in program flash/EEPROM requests
///
/// `cmd, size_hi, size_lo, mode, delay, cmd1, cmd2, cmd3, poll1, poll2, data...`
pub const PROGRAM_DATA_OFFSET: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for c in &[
            Command::SignOn,
            Command::LoadAddress,
            Command::ProgramFlash,
            Command::SpiMulti,
        ] {
            assert_eq!(Command::try_from(*c as u8), Ok(*c));
        }
    }

    #[test]
    fn signature_commands_are_not_recognised() {
        // READ_SIGNATURE_ISP, READ_FUSE_ISP, PROGRAM_LOCK_ISP
        assert_eq!(Command::try_from(0x1B), Err(0x1B));
        assert_eq!(Command::try_from(0x18), Err(0x18));
        assert_eq!(Command::try_from(0x19), Err(0x19));
    }

    #[test]
    fn status_decoding() {
        assert_eq!(Status::from_u8(0xC0), Some(Status::Failed));
        assert_eq!(Status::from_u8(0x42), None);
    }
}
