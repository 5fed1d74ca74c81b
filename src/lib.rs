//! Streams data through the slave FIFO of a Cypress EZ-USB FX2 at bulk-transfer speed.
//!
//! A freshly plugged EZ-USB chip runs nothing but its boot ROM. [`Fx2::load_firmware`] uploads
//! streaming firmware into its RAM along with a [`FirmwareConfig`] describing the FIFO interface.
//! After that, [`Fx2::open_port`] claims the bulk endpoint and a [`Stream`] keeps a pool of
//! transfers in flight until the byte budget is used up, the input ends, or the process is asked
//! to stop.
//!
//! ```no_run
//! use fx2stream::{Budget, Direction, FirmwareConfig, Fx2, Image, SignalFd, StreamState, Writer};
//! use std::io;
//!
//! let config = FirmwareConfig::default();
//! let firmware = Image::open("fx2pipe.ihx")?;
//!
//! let mut fx2 = Fx2::open_unique()?;
//! fx2.load_firmware(&config, &firmware, None)?;
//! let fx2 = fx2.reopen()?;
//!
//! let port = fx2.open_port(Direction::DeviceToHost)?;
//! let mut signals = SignalFd::termination()?;
//! let stdout = io::stdout();
//! let mut state =
//!     StreamState::device_to_host(16384, Budget::Limited(1 << 20), Writer(stdout.lock()));
//! let stats = port.stream(&mut signals, &mut state)?;
//! eprintln!("{}", stats);
//! # Ok::<(), fx2stream::Error>(())
//! ```
//!
//! [`Fx2::load_firmware`]: struct.Fx2.html#method.load_firmware
//! [`Fx2::open_port`]: struct.Fx2.html#method.open_port
//! [`FirmwareConfig`]: struct.FirmwareConfig.html
//! [`Stream`]: struct.Stream.html

#![doc(html_root_url = "https://docs.rs/fx2stream/0.0.0")]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod adapter;
mod config;
mod error;
mod firmware;
mod loader;
mod pool;
mod port;
mod prop;
mod reactor;
mod stream;
#[cfg(test)]
mod testutil;
mod transfer;

use std::{cell::RefCell, cell::RefMut, fmt, rc::Rc, thread, time::Duration};

pub use adapter::{Discard, Reader, Sink, Source, Writer, Zeros};
pub use config::{
    BusWidth, Buffering, ClockOption, CpuClock, CpuOption, Direction, FifoMode, FirmwareConfig,
    IfClockFreq, InterfaceClock, PinPolarity, CONFIG_ADDR,
};
pub use error::{Error, ErrorKind};
pub use firmware::{Image, ImageFormat, Record, MAX_RECORD_LEN};
pub use loader::{bootstrap, load_ram, write_config, RamWrite, Stage, RW_INTERNAL, RW_MEMORY};
pub use pool::{Owner, TransferPool};
pub use port::Port;
pub use prop::{lookup, ChipType, KnownDevice, KNOWN_DEVICES};
pub use reactor::{EventLoop, SignalFd, SignalSource, FALLBACK_TIMEOUT};
pub use stream::{
    Budget, SignalAction, Stats, Stream, StreamState, DEFAULT_CAPACITY, MAX_BLOCK_SIZE,
    MAX_SIGNALS, TRANSFER_TIMEOUT,
};
pub use transfer::{Completion, LibusbTransport, TransferStatus, Transport};

/// A result type with the error hardwired to [`Error`].
///
/// [`Error`]: struct.Error.html
pub type Result<T> = std::result::Result<T, Error>;

/// USB device type providing shared access from multiple ports.
type UsbHandle = Rc<RefCell<rusb::DeviceHandle<rusb::GlobalContext>>>;

const REQ_TYPE_VENDOR: u8 = 0x02 << 5;
const REQ_RECIPIENT_DEVICE: u8 = 0x00;
const REQ_DIR_OUT: u8 = 0x00;

const REQ_WRITE: u8 = REQ_TYPE_VENDOR | REQ_RECIPIENT_DEVICE | REQ_DIR_OUT;

/// The interface carrying both the boot ROM requests and the streaming endpoints.
const INTERFACE: u8 = 0;

/// Criteria for picking the device to open.
///
/// Without an `id` or `addr`, only devices listed in [`KNOWN_DEVICES`] match. A device outside
/// that table can be used by naming its `chip` type explicitly.
///
/// [`KNOWN_DEVICES`]: static.KNOWN_DEVICES.html
#[derive(Debug, Default, Clone)]
pub struct Selector {
    /// Chip type, overriding the one from the known device table.
    pub chip: Option<ChipType>,
    /// USB vendor and product ID.
    pub id: Option<(u16, u16)>,
    /// Bus number and device address.
    pub addr: Option<(u8, u8)>,
}

impl Selector {
    /// Returns the chip type of `device` if it matches, or `None`.
    fn matches(&self, device: &rusb::Device<rusb::GlobalContext>) -> Result<Option<ChipType>> {
        if let Some((bus, addr)) = self.addr {
            if device.bus_number() != bus || device.address() != addr {
                return Ok(None);
            }
        }

        let descr = device.device_descriptor().map_err(Error::usb)?;
        let (vid, pid) = (descr.vendor_id(), descr.product_id());
        if let Some(id) = self.id {
            if id != (vid, pid) {
                return Ok(None);
            }
        }

        let known = prop::lookup(vid, pid).map(|known| known.chip);
        if self.id.is_some() || self.addr.is_some() {
            return Ok(self.chip.or(known));
        }
        Ok(match (self.chip, known) {
            (Some(chip), Some(known)) if chip != known => None,
            (_, known) => known,
        })
    }
}

/// An EZ-USB device.
pub struct Fx2 {
    device: UsbHandle,
    chip: ChipType,
}

impl Fx2 {
    /// Opens the only known EZ-USB device connected to the system.
    pub fn open_unique() -> Result<Self> {
        Self::open(&Selector::default())
    }

    /// Opens the unique device matching `selector`.
    ///
    /// If multiple devices match, an error will be returned.
    pub fn open(selector: &Selector) -> Result<Self> {
        let list = rusb::devices().map_err(Error::usb)?;
        let mut selected_device = None;
        for device in list.iter() {
            if let Some(chip) = selector.matches(&device)? {
                if selected_device.is_some() {
                    return Err(Error::from_kind(ErrorKind::MultipleDevicesFound));
                }
                selected_device = Some((device, chip));
            }
        }

        match selected_device {
            Some((device, chip)) => Self::from_device(device, chip),
            None => Err(Error::from_kind(ErrorKind::NoDeviceFound)),
        }
    }

    fn from_device(device: rusb::Device<rusb::GlobalContext>, chip: ChipType) -> Result<Self> {
        log::debug!("Fx2::open(device = {:?}, chip = {})", device, chip);

        let device = device.open().map_err(|e| {
            if cfg!(windows) && matches!(e, rusb::Error::NotSupported | rusb::Error::NotFound) {
                // Provide a more helpful error message on non-plug-and-play platforms.
                Error::new(
                    ErrorKind::Usb,
                    format!(
                        "{} (this error may be caused by not having the WinUSB driver installed; \
                            use Zadig (https://zadig.akeo.ie/) to install it for the EZ-USB \
                            device; this will replace any existing driver)",
                        e
                    ),
                )
            } else {
                Error::new(ErrorKind::Usb, e)
            }
        })?;

        Ok(Self {
            device: Rc::new(RefCell::new(device)),
            chip,
        })
    }

    fn dev(&self) -> RefMut<'_, rusb::DeviceHandle<rusb::GlobalContext>> {
        self.device.borrow_mut()
    }

    fn dev_descr(&self) -> rusb::DeviceDescriptor {
        // This is infallible since libusb 1.0.16, which is from 2013, so we just assume that it
        // won't fail.
        self.dev().device().device_descriptor().unwrap()
    }

    /// Returns the chip type the device is driven as.
    pub fn chip(&self) -> ChipType {
        self.chip
    }

    /// Returns the USB Product ID of this device.
    pub fn pid(&self) -> u16 {
        self.dev_descr().product_id()
    }

    /// Returns the USB Vendor ID of this device.
    pub fn vid(&self) -> u16 {
        self.dev_descr().vendor_id()
    }

    /// Returns the USB bus number this device is attached to.
    ///
    /// Alongside `device_address()`, this uniquely identifies a device connected to the system.
    pub fn bus_number(&self) -> u8 {
        self.dev().device().bus_number()
    }

    /// Returns the USB address assigned to the device on its bus.
    ///
    /// Alongside `bus_number()`, this uniquely identifies a device connected to the system.
    pub fn device_address(&self) -> u8 {
        self.dev().device().address()
    }

    /// Returns the designation from the known device table, if the device is listed there.
    pub fn designation(&self) -> Option<&'static str> {
        prop::lookup(self.vid(), self.pid()).map(|known| known.designation)
    }

    /// Reads the product description string from the device.
    ///
    /// Unprogrammed chips usually don't have one.
    pub fn product(&self) -> Result<String> {
        let descr = self.dev_descr();
        Ok(self
            .dev()
            .read_product_string_ascii(&descr)
            .map_err(Error::usb)?)
    }

    /// Uploads `firmware` (through `loader`, if given) and starts it with `config`.
    ///
    /// The firmware usually re-enumerates, so the device should be reopened with [`reopen`]
    /// before streaming.
    ///
    /// [`reopen`]: #method.reopen
    pub fn load_firmware(
        &mut self,
        config: &FirmwareConfig,
        firmware: &Image,
        loader: Option<&Image>,
    ) -> Result<()> {
        let mut dev = self.dev();
        if let Err(e) = dev.set_auto_detach_kernel_driver(true) {
            log::debug!("kernel driver auto-detach unavailable: {}", e);
        }
        dev.claim_interface(INTERFACE).map_err(Error::usb)?;

        let result = loader::bootstrap(&mut *dev, self.chip, config, firmware, loader);
        dev.release_interface(INTERFACE).ok();
        result
    }

    /// Closes the device and opens it again.
    ///
    /// Waits for `settle` first to give the new firmware time to come up.
    pub fn reopen_after(self, settle: Duration) -> Result<Self> {
        let device = self.dev().device();
        let chip = self.chip;
        drop(self);

        thread::sleep(settle);
        Self::from_device(device, chip)
    }

    /// Closes the device and opens it again.
    pub fn reopen(self) -> Result<Self> {
        self.reopen_after(Duration::from_millis(0))
    }

    /// Opens the streaming endpoint for `direction`.
    ///
    /// This will claim the USB interface and lock it for other applications.
    pub fn open_port(&self, direction: Direction) -> Result<Port> {
        Port::open(self, direction)
    }
}

impl fmt::Debug for Fx2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fx2").field("chip", &self.chip).finish()
    }
}

/// Returns an iterator over all known EZ-USB devices on the system.
///
/// This will try to open every device whose VID and PID are listed in [`KNOWN_DEVICES`].
///
/// [`KNOWN_DEVICES`]: static.KNOWN_DEVICES.html
pub fn devices() -> Result<impl Iterator<Item = Result<Fx2>>> {
    devices_filtered(&Selector::default())
}

/// Returns an iterator over all devices matching `selector`.
pub fn devices_filtered(selector: &Selector) -> Result<impl Iterator<Item = Result<Fx2>>> {
    let list = rusb::devices().map_err(Error::usb)?;
    let mut vec = Vec::new();
    for device in list.iter() {
        match selector.matches(&device) {
            Ok(Some(chip)) => vec.push(Fx2::from_device(device, chip)),
            Ok(None) => {}
            Err(e) => vec.push(Err(e)),
        }
    }

    Ok(vec.into_iter())
}
