//! Device main loop and reset-time entry decision.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::serial::{Read, Write};

use crate::config::Config;
use crate::executor::Executor;
use crate::frame::Decoder;
use crate::port::{Eeprom, Platform, SelfProgram};
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::transport::Transport;
use crate::Error;

/// Where control goes after reset
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Entry {
    Bootloader,
    Application,
}

/// Why the main loop stopped
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Exit {
    /// The host sent LEAVE_PROGMODE
    Leave,
    /// No byte arrived within the receive timeout
    Timeout,
}

pub struct Bootloader<S, D, F, M> {
    transport: Transport<S, D>,
    flash: F,
    eeprom: M,
    executor: Executor,
    decoder: Decoder,
    response: [u8; MAX_MESSAGE_SIZE],
    timeout_us: u32,
    poll_us: u32,
}

impl<S, D, F, M, E> Bootloader<S, D, F, M>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayUs<u32>,
    F: SelfProgram,
    M: Eeprom,
    E: Debug,
{
    pub fn new(serial: S, delay: D, flash: F, eeprom: M, config: Config) -> Self {
        let transport = Transport::new(
            serial,
            delay,
            config.receive_timeout_us,
            config.poll_period_us,
        );

        Self {
            transport,
            flash,
            eeprom,
            executor: Executor::new(config),
            decoder: Decoder::new(),
            response: [0u8; MAX_MESSAGE_SIZE],
            timeout_us: config.receive_timeout_us,
            poll_us: config.poll_period_us.max(1),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Release the hardware handles
    pub fn free(self) -> (S, D, F, M) {
        let (serial, delay) = self.transport.free();
        (serial, delay, self.flash, self.eeprom)
    }

    /// Receive, execute and answer one request
    ///
    /// Returns `Ok(true)` once the host has asked to leave.
    pub fn poll(&mut self) -> Result<bool, Error<E>> {
        self.transport.receive_frame(&mut self.decoder)?;

        let seq = self.decoder.seq();
        let o = self.executor.execute(
            &mut self.flash,
            &mut self.eeprom,
            self.decoder.body(),
            &mut self.response,
        );

        self.transport.send_frame(seq, &self.response[..o.len])?;

        Ok(o.leave)
    }

    /// Service requests until the host leaves or goes quiet
    ///
    /// Serial faults back off for one poll period each and count towards the
    /// receive timeout, so a line that only ever reports errors still ends
    /// in [`Exit::Timeout`].
    pub fn run(&mut self) -> Exit {
        let mut faulted_us = 0u32;

        loop {
            match self.poll() {
                Ok(true) => return Exit::Leave,
                Ok(false) => faulted_us = 0,
                Err(Error::Timeout) => {
                    info!("Host inactive, leaving bootloader");
                    return Exit::Timeout;
                }
                Err(e) => {
                    warn!("Serial error: {:?}", e);

                    if faulted_us >= self.timeout_us {
                        info!("Serial port faulted, leaving bootloader");
                        return Exit::Timeout;
                    }

                    self.transport.delay_mut().delay_us(self.poll_us);
                    faulted_us = faulted_us.saturating_add(self.poll_us);
                }
            }
        }
    }
}

/// Decide between bootloader and application
///
/// The watchdog is stopped first so a watchdog-triggered reset cannot fire
/// again before the application inspects the reset cause.
pub fn select<P: Platform>(platform: &mut P) -> Entry {
    platform.watchdog_disable();

    if platform.bootloader_entry_requested() {
        Entry::Bootloader
    } else {
        Entry::Application
    }
}

/// Reset-time entry point, never returns
///
/// Runs the bootloader when the platform requests it, then hands control to
/// the application.
pub fn boot<P, S, D, F, M, E>(
    platform: &mut P,
    config: Config,
    serial: S,
    delay: D,
    flash: F,
    eeprom: M,
) -> !
where
    P: Platform,
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayUs<u32>,
    F: SelfProgram,
    M: Eeprom,
    E: Debug,
{
    if select(platform) == Entry::Bootloader {
        platform.uart_init(config.baud_rate);

        let mut b = Bootloader::new(serial, delay, flash, eeprom, config);
        let exit = b.run();
        debug!("Bootloader exit: {:?}", exit);
    }

    platform.jump_to_application()
}
