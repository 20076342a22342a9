#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stk500v2_bootloader::{Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Sign on and report bootloader versions
    Info,

    /// Read flash into a file, or dump it as hex
    ReadFlash {
        /// Start byte address
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u32))]
        address: u32,

        /// Number of bytes to read
        #[structopt(long, parse(try_from_str = parse_u32))]
        length: u32,

        /// Output file, hex dump to stdout if omitted
        #[structopt(long)]
        file: Option<PathBuf>,
    },

    /// Write a raw binary image to flash
    WriteFlash {
        /// Start byte address, must be page aligned
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u32))]
        address: u32,

        /// Device flash page size in bytes
        #[structopt(long, default_value = "256")]
        page_size: usize,

        /// Read the image back after writing
        #[structopt(long)]
        verify: bool,

        /// Binary image to write
        file: PathBuf,
    },

    /// Read EEPROM into a file, or dump it as hex
    ReadEeprom {
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u32))]
        address: u32,

        #[structopt(long, parse(try_from_str = parse_u32))]
        length: u32,

        #[structopt(long)]
        file: Option<PathBuf>,
    },

    /// Write a raw binary file to EEPROM
    WriteEeprom {
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u32))]
        address: u32,

        file: PathBuf,
    },
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn dump(address: u32, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        println!("{:06x}: {}", address as usize + i * 16, hex::encode(line));
    }
}

fn progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} {msg}")
            .progress_chars("=> "),
    );
    pb
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, LogConfig::default());

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    info!("Connecting to bootloader");

    p.init().context("Error connecting to bootloader")?;

    info!("Bootloader connected!");

    match o.operation {
        Operation::Info => {
            let id = p.sign_on()?;
            let (hw, major, minor) = p.version()?;
            println!("Programmer ID: {}", String::from_utf8_lossy(&id));
            println!("Hardware version: 0x{:02x}", hw);
            println!("Software version: {}.{:02}", major, minor);
        }
        Operation::ReadFlash {
            address,
            length,
            file,
        } => {
            info!("Reading {} of flash", bytefmt::format(length as u64));

            let mut data = vec![0u8; length as usize];
            p.enter_progmode()?;
            p.read_flash(address, &mut data).context("Error reading flash")?;

            match file {
                Some(f) => fs::write(&f, &data)
                    .with_context(|| format!("Error writing {}", f.display()))?,
                None => dump(address, &data),
            }
        }
        Operation::WriteFlash {
            address,
            page_size,
            verify,
            file,
        } => {
            if page_size == 0 || address as usize % page_size != 0 {
                bail!("Address 0x{:x} is not aligned to {} byte pages", address, page_size);
            }

            let mut data =
                fs::read(&file).with_context(|| format!("Error reading {}", file.display()))?;
            if data.len() % 2 != 0 {
                data.push(0xFF);
            }

            info!(
                "Writing {} to flash at 0x{:05x}",
                bytefmt::format(data.len() as u64),
                address
            );

            p.enter_progmode()?;

            let pb = progress(data.len());
            for (i, page) in data.chunks(page_size).enumerate() {
                let a = address + (i * page_size) as u32;
                p.program_flash_page(a, page)
                    .with_context(|| format!("Error writing page at 0x{:05x}", a))?;
                pb.inc(page.len() as u64);
            }
            pb.finish_with_message("written");

            if verify {
                let mut readback = vec![0u8; data.len()];
                p.read_flash(address, &mut readback).context("Error reading flash")?;

                if let Some(i) = data.iter().zip(readback.iter()).position(|(a, b)| a != b) {
                    bail!("Verify failed at 0x{:05x}", address as usize + i);
                }
                info!("Verified {}", bytefmt::format(data.len() as u64));
            }
        }
        Operation::ReadEeprom {
            address,
            length,
            file,
        } => {
            let mut data = vec![0u8; length as usize];
            p.enter_progmode()?;
            p.read_eeprom(address, &mut data).context("Error reading EEPROM")?;

            match file {
                Some(f) => fs::write(&f, &data)
                    .with_context(|| format!("Error writing {}", f.display()))?,
                None => dump(address, &data),
            }
        }
        Operation::WriteEeprom { address, file } => {
            let data =
                fs::read(&file).with_context(|| format!("Error reading {}", file.display()))?;

            info!("Writing {} to EEPROM", bytefmt::format(data.len() as u64));

            p.enter_progmode()?;
            p.program_eeprom(address, &data).context("Error writing EEPROM")?;
        }
    }

    // Leaving starts the application
    p.leave_progmode()?;

    Ok(())
}
