//! The streaming endpoint.
//!
//! `lib.rs` deals with device selection and firmware upload, while this module deals with
//! claiming the interface the firmware streams through.

use std::cell::RefMut;
use std::fmt;
use std::time::Duration;

use crate::config::Direction;
use crate::reactor::SignalSource;
use crate::stream::{Stats, Stream, StreamState, TRANSFER_TIMEOUT};
use crate::transfer::LibusbTransport;
use crate::{Error, Fx2, Result, UsbHandle, INTERFACE};

/// Alternate setting exposing the bulk endpoints.
const ALT_SETTING: u8 = 1;

// FIXME: Hack needed since you can't move out of types that impl `Drop`.
struct ReleaseOnDrop {
    /// Interface number.
    index: u8,
    device: UsbHandle,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.device.borrow_mut().release_interface(self.index).ok();
    }
}

/// The claimed bulk endpoint of a device running streaming firmware.
pub struct Port {
    device: ReleaseOnDrop,
    direction: Direction,
}

impl Port {
    pub(crate) fn open(parent: &Fx2, direction: Direction) -> Result<Self> {
        let dev = parent.dev();
        dev.claim_interface(INTERFACE).map_err(Error::usb)?;
        drop(dev);

        let this = Self {
            device: ReleaseOnDrop {
                device: parent.device.clone(),
                index: INTERFACE,
            },
            direction,
        };

        this.dev()
            .set_alternate_setting(INTERFACE, ALT_SETTING)
            .map_err(Error::usb)?;
        log::debug!(
            "claimed interface {} alt {}, endpoint 0x{:02x}",
            INTERFACE,
            ALT_SETTING,
            this.endpoint()
        );

        Ok(this)
    }

    pub(crate) fn dev(&self) -> RefMut<'_, rusb::DeviceHandle<rusb::GlobalContext>> {
        self.device.device.borrow_mut()
    }

    pub(crate) fn raw_handle(&self) -> *mut rusb::ffi::libusb_device_handle {
        self.dev().as_raw()
    }

    /// Returns the direction data flows in.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the bulk endpoint address.
    pub fn endpoint(&self) -> u8 {
        self.direction.endpoint()
    }

    /// Prepares `capacity` asynchronous transfers on this endpoint.
    pub fn transport(&self, capacity: usize, timeout: Duration) -> Result<LibusbTransport<'_>> {
        LibusbTransport::new(self, capacity, timeout)
    }

    /// Runs a stream with the default pool size and transfer timeout.
    ///
    /// `state` must have been created for this port's direction.
    pub fn stream<S: SignalSource>(
        &self,
        signals: &mut S,
        state: &mut StreamState<'_>,
    ) -> Result<Stats> {
        if state.direction() != self.direction {
            return Err(Error::config(format!(
                "{:?} stream on a {:?} port",
                state.direction(),
                self.direction
            )));
        }

        let stream = Stream::new();
        let transport = self.transport(stream.capacity(), TRANSFER_TIMEOUT)?;
        stream.run(transport, signals, state)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("interface", &self.device.index)
            .field("direction", &self.direction)
            .field("endpoint", &self.endpoint())
            .finish()
    }
}
