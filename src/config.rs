//! Build-time description of the target part.
//!
//! Everything that the C world would select with `#if defined(__AVR_...)`
//! lives in one [`Config`] record, picked once as a constant and handed to
//! the bootloader.

use crate::protocol::{EXTENDED_ADDRESS_FLAG, MAX_MESSAGE_SIZE, PROGRAM_DATA_OFFSET};

/// Largest page any supported part uses, in bytes
pub const MAX_PAGE_SIZE: usize = 256;

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Config {
    /// Flash page size in bytes
    pub page_size: u16,

    /// Total flash size in bytes
    pub flash_size: u32,

    /// Size of the reserved bootloader section in words
    pub boot_size_words: u32,

    /// EEPROM size in bytes
    pub eeprom_size: u16,

    /// Use 32-bit addresses (parts with more than 64k words of flash)
    pub extended_addressing: bool,

    /// Answer SPI_MULTI with emulated data rather than an empty response
    pub spi_multi: bool,

    /// Serial baud rate, 8N1
    pub baud_rate: u32,

    /// Inter-byte receive timeout in microseconds
    pub receive_timeout_us: u32,

    /// Receive polling period in microseconds
    pub poll_period_us: u32,

    /// Hardware version reported through GET_PARAMETER
    pub hw_version: u8,

    /// Software version (major, minor) reported through GET_PARAMETER
    pub sw_version: (u8, u8),
}

impl Config {
    /// First byte address of the bootloader section, i.e. one past the
    /// application region
    pub const fn app_end(&self) -> u32 {
        self.flash_size - 2 * self.boot_size_words
    }

    /// Convert a loaded word address to a flash byte address
    ///
    /// Returns `None` for addresses past the end of flash rather than
    /// wrapping them onto low memory.
    pub const fn flash_address(&self, word_address: u32) -> Option<u32> {
        let address = (word_address & !EXTENDED_ADDRESS_FLAG) << 1;
        if address < self.flash_size {
            Some(address)
        } else {
            None
        }
    }

    /// Check whether a page starting at `address` may be written
    pub const fn page_writable(&self, address: u32) -> bool {
        address % self.page_size as u32 == 0 && address < self.app_end()
    }

    /// Check the record is usable, returns false for impossible layouts
    pub const fn is_valid(&self) -> bool {
        let page = self.page_size as usize;
        page > 0
            && page % 2 == 0
            && page <= MAX_PAGE_SIZE
            && PROGRAM_DATA_OFFSET + page <= MAX_MESSAGE_SIZE
            && self.flash_size > 2 * self.boot_size_words
            && self.app_end() % self.page_size as u32 == 0
            && (self.extended_addressing || self.flash_size <= 0x1_0000)
            && self.poll_period_us > 0
    }
}

const BASE: Config = Config {
    page_size: 256,
    flash_size: 0x4_0000,
    boot_size_words: 4096,
    eeprom_size: 4096,
    extended_addressing: true,
    spi_multi: true,
    baud_rate: 115_200,
    receive_timeout_us: 1_000_000,
    poll_period_us: 10,
    hw_version: 0x0F,
    sw_version: (2, 0x0A),
};

pub const ATMEGA2560: Config = BASE;

pub const ATMEGA1280: Config = Config {
    flash_size: 0x2_0000,
    ..BASE
};

pub const ATMEGA128: Config = Config {
    flash_size: 0x2_0000,
    ..BASE
};

pub const ATMEGA328P: Config = Config {
    page_size: 128,
    flash_size: 0x8000,
    boot_size_words: 2048,
    eeprom_size: 1024,
    extended_addressing: false,
    ..BASE
};

const _: () = assert!(ATMEGA2560.is_valid());
const _: () = assert!(ATMEGA1280.is_valid());
const _: () = assert!(ATMEGA128.is_valid());
const _: () = assert!(ATMEGA328P.is_valid());

impl Default for Config {
    fn default() -> Self {
        ATMEGA2560
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_region_ends_below_bootloader() {
        assert_eq!(ATMEGA2560.app_end(), 0x3_E000);
        assert_eq!(ATMEGA328P.app_end(), 0x7000);
    }

    #[test]
    fn word_addresses_are_doubled() {
        assert_eq!(ATMEGA2560.flash_address(0x8001_0000), Some(0x2_0000));
        assert_eq!(ATMEGA328P.flash_address(0x0000_3FFF), Some(0x7FFE));
    }

    #[test]
    fn addresses_past_flash_do_not_wrap() {
        assert_eq!(ATMEGA328P.flash_address(0x0000_4000), None);
        assert_eq!(ATMEGA328P.flash_address(0x0000_8000), None);
        assert_eq!(ATMEGA328P.flash_address(0x0001_0040), None);
        assert_eq!(ATMEGA2560.flash_address(0x0002_0000), None);
    }

    #[test]
    fn page_writability() {
        let c = ATMEGA328P;
        assert!(c.page_writable(0));
        assert!(c.page_writable(c.app_end() - 128));
        assert!(!c.page_writable(c.app_end()));
        assert!(!c.page_writable(0x40));
    }

    #[test]
    fn narrow_parts_must_fit_sixteen_bits() {
        let c = Config {
            extended_addressing: false,
            ..ATMEGA2560
        };
        assert!(!c.is_valid());
    }
}
