//! Firmware upload into controller RAM.
//!
//! The EZ-USB boot ROM answers vendor request `0xA0` by writing on-chip RAM, even while the 8051
//! is held in reset. Firmware is loaded by stopping the CPU through its `CPUCS` register, poking
//! the image into RAM and releasing the CPU again. Memory outside the chip is only reachable
//! once a second-stage loader that implements request `0xA3` is running.

use std::fmt;
use std::time::Duration;

use rusb::{DeviceHandle, UsbContext};

use crate::config::{FirmwareConfig, CONFIG_ADDR};
use crate::firmware::Image;
use crate::prop::ChipType;
use crate::{Error, ErrorKind, Result, REQ_WRITE};

/// Writes on-chip RAM (handled by the boot ROM).
pub const RW_INTERNAL: u8 = 0xa0;
/// Writes external RAM (handled by a second-stage loader).
pub const RW_MEMORY: u8 = 0xa3;

/// Timeout for a single RAM write.
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// A device that accepts vendor RAM write requests.
pub trait RamWrite {
    /// Writes `data` to controller memory at `addr` using vendor request `request`.
    ///
    /// Must fail unless every byte was transferred.
    fn write_ram(&mut self, request: u8, addr: u32, data: &[u8]) -> Result<()>;
}

impl<T: UsbContext> RamWrite for DeviceHandle<T> {
    fn write_ram(&mut self, request: u8, addr: u32, data: &[u8]) -> Result<()> {
        log::trace!(
            "write_ram(request = 0x{:02x}, addr = 0x{:04x}, len = {})",
            request,
            addr,
            data.len()
        );
        let n = self
            .write_control(
                REQ_WRITE,
                request,
                (addr & 0xffff) as u16,
                (addr >> 16) as u16,
                data,
                WRITE_TIMEOUT,
            )
            .map_err(Error::usb)?;
        if n != data.len() {
            return Err(Error::other(format!(
                "wrote {} bytes, expected {}",
                n,
                data.len()
            )));
        }
        Ok(())
    }
}

/// Which upload an image belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    /// Upload into on-chip RAM through the boot ROM.
    First,
    /// Upload through an already running second-stage loader.
    Second,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::First => f.write_str("stage 0"),
            Stage::Second => f.write_str("stage 1"),
        }
    }
}

/// Hook invoked right before the CPU is released from reset.
pub type PreReset<'a, W> = &'a mut dyn FnMut(&mut W) -> Result<()>;

fn set_cpu_reset<W: RamWrite>(dev: &mut W, chip: ChipType, reset: bool) -> Result<()> {
    log::debug!(
        "{} 8051 (CPUCS at 0x{:04x})",
        if reset { "stopping" } else { "starting" },
        chip.cpucs_addr()
    );
    dev.write_ram(RW_INTERNAL, chip.cpucs_addr().into(), &[reset as u8])
}

fn poke_records<W: RamWrite>(
    dev: &mut W,
    image: &Image,
    chip: ChipType,
    external: bool,
) -> Result<usize> {
    let mut total = 0;
    for record in image.records() {
        if chip.is_external(record.address, record.data.len()) != external {
            continue;
        }
        let request = if external { RW_MEMORY } else { RW_INTERNAL };
        dev.write_ram(request, record.address, &record.data)?;
        total += record.data.len();
    }
    Ok(total)
}

/// Uploads `image` into controller RAM and starts the CPU.
///
/// `pre_reset` is called after the image is in place but before the CPU is released from reset.
pub fn load_ram<W: RamWrite>(
    dev: &mut W,
    image: &Image,
    chip: ChipType,
    stage: Stage,
    pre_reset: Option<PreReset<'_, W>>,
) -> Result<()> {
    upload(dev, image, chip, stage, pre_reset)
        .map_err(|e| e.context(ErrorKind::Bootstrap, format!("{}, {}", image.name(), stage)))
}

fn upload<W: RamWrite>(
    dev: &mut W,
    image: &Image,
    chip: ChipType,
    stage: Stage,
    pre_reset: Option<PreReset<'_, W>>,
) -> Result<()> {
    let written = match stage {
        Stage::First => {
            if let Some(rec) = image
                .records()
                .iter()
                .find(|r| chip.is_external(r.address, r.data.len()))
            {
                return Err(Error::firmware(format!(
                    "record at 0x{:04x} ({} bytes) is outside on-chip RAM; \
                     a second stage loader is required",
                    rec.address,
                    rec.data.len()
                )));
            }

            set_cpu_reset(dev, chip, true)?;
            poke_records(dev, image, chip, false)?
        }
        Stage::Second => {
            // The running loader writes external memory, on-chip RAM needs the CPU stopped.
            let external = poke_records(dev, image, chip, true)?;
            set_cpu_reset(dev, chip, true)?;
            external + poke_records(dev, image, chip, false)?
        }
    };
    log::info!("{}: wrote {} bytes ({})", image.name(), written, stage);

    if let Some(hook) = pre_reset {
        hook(dev)?;
    }

    set_cpu_reset(dev, chip, false)
}

/// Writes the slave FIFO configuration block to its fixed RAM address.
pub fn write_config<W: RamWrite>(dev: &mut W, config: &FirmwareConfig) -> Result<()> {
    log::info!("Firmware configuration: {}", config);
    dev.write_ram(RW_INTERNAL, CONFIG_ADDR.into(), &config.to_bytes())
}

/// Uploads the streaming firmware and arms its configuration.
///
/// Without a `loader`, `firmware` is loaded directly. Otherwise the loader is uploaded first and
/// then used to upload `firmware`. In both cases `config` is written exactly once, right before
/// the first CPU release.
///
/// A failed write aborts the sequence and leaves the device in an undefined state.
pub fn bootstrap<W: RamWrite>(
    dev: &mut W,
    chip: ChipType,
    config: &FirmwareConfig,
    firmware: &Image,
    loader: Option<&Image>,
) -> Result<()> {
    let mut hook = |dev: &mut W| write_config(dev, config);

    match loader {
        None => {
            log::debug!("single stage: load on-chip memory");
            load_ram(dev, firmware, chip, Stage::First, Some(&mut hook))
        }
        Some(loader) => {
            log::debug!("1st stage: load 2nd stage loader");
            load_ram(dev, loader, chip, Stage::First, Some(&mut hook))?;
            log::debug!("2nd stage: load on-chip memory");
            load_ram(dev, firmware, chip, Stage::Second, None)
        }
    }
}
