//! Hardware seams consumed by the bootloader core.
//!
//! A target board supplies implementations of these over its self-programming
//! and EEPROM registers; [`crate::sim`] provides in-memory versions.

use core::fmt::Debug;

/// Self-programming (SPM) access to the part's own flash
///
/// Addresses are byte addresses. Operations that start a hardware sequence
/// return immediately; completion is observed through [`SelfProgram::poll`].
pub trait SelfProgram {
    type Error: Debug;

    /// Start erasing the page containing `address`
    fn erase_page(&mut self, address: u32) -> Result<(), Self::Error>;

    /// Load one word into the temporary page buffer
    fn fill_word(&mut self, address: u32, word: u16) -> Result<(), Self::Error>;

    /// Start writing the page buffer to the page containing `address`
    fn write_page(&mut self, address: u32) -> Result<(), Self::Error>;

    /// `WouldBlock` while an erase or write is in progress
    fn poll(&mut self) -> nb::Result<(), Self::Error>;

    /// Re-enable reads of the application section after a write
    fn enable_rww(&mut self) -> Result<(), Self::Error>;

    /// Read a byte of flash
    fn read(&mut self, address: u32) -> u8;
}

/// Byte-wise EEPROM access
pub trait Eeprom {
    type Error: Debug;

    /// Start writing one byte, the previous write must have completed
    fn write(&mut self, address: u16, value: u8) -> Result<(), Self::Error>;

    /// `WouldBlock` while a write is in progress
    fn poll(&mut self) -> nb::Result<(), Self::Error>;

    fn read(&mut self, address: u16) -> u8;
}

/// Board services used at reset
pub trait Platform {
    /// Whether the bootloader should stay resident (pin strap, magic RAM
    /// value, reset cause...)
    fn bootloader_entry_requested(&mut self) -> bool;

    /// Stop the watchdog before anything else runs
    fn watchdog_disable(&mut self);

    /// Bring up the serial port at `baud`, 8N1
    fn uart_init(&mut self, baud: u32);

    /// Transfer control to the application reset vector
    fn jump_to_application(&mut self) -> !;
}
