//! In-memory stand-ins for the hardware seams, for host-side testing.

use std::convert::Infallible;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::serial;

use crate::port::{Eeprom, Platform, SelfProgram};
use crate::SerialPort;

/// Cycles a simulated erase, write or EEPROM update stays busy
const BUSY_POLLS: u8 = 3;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SimError {
    /// Operation issued while the previous one was still running
    Busy,
    OutOfRange(u32),
    /// Injected page write failure
    WriteFault,
}

/// One end of a simulated serial link
pub struct SimPort {
    tx: Sender<u8>,
    rx: Receiver<u8>,
    rts: bool,
    dtr: bool,
}

impl SimPort {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        let a = Self {
            tx: a_tx,
            rx: a_rx,
            rts: false,
            dtr: false,
        };
        let b = Self {
            tx: b_tx,
            rx: b_rx,
            rts: false,
            dtr: false,
        };
        (a, b)
    }

    /// Queue bytes for the other end
    pub fn inject(&mut self, data: &[u8]) {
        for b in data {
            let _ = self.tx.send(*b);
        }
    }

    /// Take everything the other end has sent so far
    pub fn drain(&mut self) -> Vec<u8> {
        self.rx.try_iter().collect()
    }

    pub fn rts(&self) -> bool {
        self.rts
    }

    pub fn dtr(&self) -> bool {
        self.dtr
    }
}

impl serial::Read<u8> for SimPort {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.try_recv().map_err(|_| nb::Error::WouldBlock)
    }
}

impl serial::Write<u8> for SimPort {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        // A dropped peer behaves like a disconnected line
        let _ = self.tx.send(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl SerialPort<Infallible> for SimPort {
    fn set_rts(&mut self, level: bool) -> Result<(), Infallible> {
        self.rts = level;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Infallible> {
        self.dtr = level;
        Ok(())
    }
}

/// Delay that returns immediately, timeouts then count poll attempts
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDelay;

impl DelayUs<u32> for NoDelay {
    fn delay_us(&mut self, _us: u32) {}
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Delay backed by `std::thread::sleep`
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl DelayUs<u32> for StdDelay {
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Flash with an AVR-style temporary page buffer
///
/// Reads of the array return 0xFF between an erase or write and the
/// following [`SelfProgram::enable_rww`].
pub struct SimFlash {
    memory: Vec<u8>,
    buffer: Vec<u8>,
    page_size: u16,
    busy: u8,
    rww: bool,
    erases: usize,
    writes: usize,
    fail: bool,
}

impl SimFlash {
    /// Create an erased flash of `size` bytes
    pub fn new(size: u32, page_size: u16) -> Self {
        Self {
            memory: vec![0xFF; size as usize],
            buffer: vec![0xFF; page_size as usize],
            page_size,
            busy: 0,
            rww: true,
            erases: 0,
            writes: 0,
            fail: false,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn rww_enabled(&self) -> bool {
        self.rww
    }

    /// Make subsequent page writes fail, leaving the page erased
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail = fail;
    }

    fn page(&self, address: u32) -> Result<usize, SimError> {
        if address as usize >= self.memory.len() {
            return Err(SimError::OutOfRange(address));
        }
        Ok(address as usize - address as usize % self.page_size as usize)
    }

    fn idle(&self) -> Result<(), SimError> {
        match self.busy {
            0 => Ok(()),
            _ => Err(SimError::Busy),
        }
    }
}

impl SelfProgram for SimFlash {
    type Error = SimError;

    fn erase_page(&mut self, address: u32) -> Result<(), SimError> {
        self.idle()?;
        let start = self.page(address)?;
        let end = start + self.page_size as usize;

        for b in &mut self.memory[start..end] {
            *b = 0xFF;
        }

        self.rww = false;
        self.busy = BUSY_POLLS;
        self.erases += 1;

        Ok(())
    }

    fn fill_word(&mut self, address: u32, word: u16) -> Result<(), SimError> {
        self.idle()?;
        let offset = address as usize % self.page_size as usize;
        let [lo, hi] = word.to_le_bytes();
        self.buffer[offset] = lo;
        self.buffer[offset + 1] = hi;
        Ok(())
    }

    fn write_page(&mut self, address: u32) -> Result<(), SimError> {
        self.idle()?;
        let start = self.page(address)?;

        self.rww = false;
        self.writes += 1;

        if self.fail {
            return Err(SimError::WriteFault);
        }

        self.memory[start..start + self.page_size as usize].copy_from_slice(&self.buffer);
        for b in &mut self.buffer {
            *b = 0xFF;
        }
        self.busy = BUSY_POLLS;

        Ok(())
    }

    fn poll(&mut self) -> nb::Result<(), SimError> {
        match self.busy {
            0 => Ok(()),
            _ => {
                self.busy -= 1;
                Err(nb::Error::WouldBlock)
            }
        }
    }

    fn enable_rww(&mut self) -> Result<(), SimError> {
        self.idle()?;
        self.rww = true;
        Ok(())
    }

    fn read(&mut self, address: u32) -> u8 {
        match (self.rww, self.memory.get(address as usize)) {
            (true, Some(b)) => *b,
            _ => 0xFF,
        }
    }
}

/// EEPROM whose writes land only once polled to completion
pub struct SimEeprom {
    memory: Vec<u8>,
    pending: Option<(u16, u8)>,
    busy: u8,
}

impl SimEeprom {
    pub fn new(size: u16) -> Self {
        Self {
            memory: vec![0xFF; size as usize],
            pending: None,
            busy: 0,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }
}

impl Eeprom for SimEeprom {
    type Error = SimError;

    fn write(&mut self, address: u16, value: u8) -> Result<(), SimError> {
        if self.pending.is_some() {
            return Err(SimError::Busy);
        }
        if address as usize >= self.memory.len() {
            return Err(SimError::OutOfRange(address as u32));
        }
        self.pending = Some((address, value));
        self.busy = BUSY_POLLS;
        Ok(())
    }

    fn poll(&mut self) -> nb::Result<(), SimError> {
        if self.pending.is_none() {
            return Ok(());
        }
        if self.busy > 0 {
            self.busy -= 1;
            return Err(nb::Error::WouldBlock);
        }
        if let Some((a, v)) = self.pending.take() {
            self.memory[a as usize] = v;
        }
        Ok(())
    }

    fn read(&mut self, address: u16) -> u8 {
        self.memory.get(address as usize).copied().unwrap_or(0xFF)
    }
}

/// Board stub recording what the entry controller asked of it
#[derive(Debug, Default)]
pub struct SimPlatform {
    pub entry_requested: bool,
    pub watchdog_disabled: bool,
    pub baud: Option<u32>,
}

impl SimPlatform {
    pub fn new(entry_requested: bool) -> Self {
        Self {
            entry_requested,
            ..Self::default()
        }
    }
}

impl Platform for SimPlatform {
    fn bootloader_entry_requested(&mut self) -> bool {
        assert!(self.watchdog_disabled, "watchdog still running at entry check");
        self.entry_requested
    }

    fn watchdog_disable(&mut self) {
        self.watchdog_disabled = true;
    }

    fn uart_init(&mut self, baud: u32) {
        self.baud = Some(baud);
    }

    /// There is no application to run, so this panics with "jump to
    /// application"
    fn jump_to_application(&mut self) -> ! {
        panic!("jump to application");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eeprom_write_needs_poll_before_next() {
        let mut e = SimEeprom::new(16);
        e.write(0, 1).unwrap();
        assert_eq!(e.write(1, 2), Err(SimError::Busy));
        assert_eq!(e.read(0), 0xFF);

        nb::block!(e.poll()).unwrap();
        assert_eq!(e.read(0), 1);
        e.write(1, 2).unwrap();
    }

    #[test]
    fn flash_reads_blank_until_rww_enabled() {
        let mut f = SimFlash::new(512, 128);
        f.erase_page(0).unwrap();
        assert_eq!(f.fill_word(0, 0x1234), Err(SimError::Busy));
        nb::block!(f.poll()).unwrap();

        f.fill_word(0, 0x1234).unwrap();
        f.write_page(0).unwrap();
        nb::block!(f.poll()).unwrap();
        assert_eq!(f.read(0), 0xFF);

        f.enable_rww().unwrap();
        assert_eq!(f.read(0), 0x34);
        assert_eq!(f.read(1), 0x12);
    }

    #[test]
    fn link_carries_bytes_both_ways() {
        let (mut a, mut b) = SimPort::pair();
        a.inject(&[1, 2]);
        b.inject(&[3]);
        assert_eq!(b.drain(), vec![1, 2]);
        assert_eq!(a.drain(), vec![3]);
    }
}
