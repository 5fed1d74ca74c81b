//! Slave FIFO configuration block.
//!
//! The streaming firmware reads 6 configuration bytes from a fixed RAM address when it starts.
//! They are copied almost verbatim into the controller's `IFCONFIG`, `EPxCFG`, `EPxFIFOCFG`,
//! `CPUCS` and `FIFOPINPOLAR` registers, so the encoding here is a fixed device contract.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::{Error, Result};

/// Controller RAM address the configuration block is written to.
pub const CONFIG_ADDR: u16 = 0x1003;

/// Transfer direction of a stream, as seen from the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Data flows from the FIFO bus to the host (`IN` endpoint 6).
    DeviceToHost,
    /// Data flows from the host to the FIFO bus (`OUT` endpoint 2).
    HostToDevice,
}

impl Direction {
    /// Returns the address of the bulk endpoint the firmware uses for this direction.
    pub fn endpoint(self) -> u8 {
        match self {
            Direction::DeviceToHost => 0x86,
            Direction::HostToDevice => 0x02,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::DeviceToHost
    }
}

/// Width of the slave FIFO data bus.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BusWidth {
    Eight,
    Sixteen,
}

impl Default for BusWidth {
    fn default() -> Self {
        BusWidth::Sixteen
    }
}

/// Number of 512-byte endpoint buffers backing the FIFO.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Buffering {
    Double,
    Triple,
    Quad,
}

impl Buffering {
    /// Returns the number of buffers (2, 3 or 4).
    pub fn depth(self) -> u8 {
        match self {
            Buffering::Double => 2,
            Buffering::Triple => 3,
            Buffering::Quad => 4,
        }
    }

    /// Converts a buffer count into a `Buffering` value.
    pub fn from_depth(depth: u8) -> Result<Self> {
        match depth {
            2 => Ok(Buffering::Double),
            3 => Ok(Buffering::Triple),
            4 => Ok(Buffering::Quad),
            _ => Err(Error::config(format!(
                "buffering depth must be 2, 3 or 4 (got {})",
                depth
            ))),
        }
    }
}

impl Default for Buffering {
    fn default() -> Self {
        Buffering::Quad
    }
}

/// Whether the FIFO bus is clocked (`Sync`) or strobed (`Async`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FifoMode {
    Sync,
    Async,
}

impl Default for FifoMode {
    fn default() -> Self {
        FifoMode::Sync
    }
}

/// Frequency of the internally generated interface clock.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IfClockFreq {
    Mhz30,
    Mhz48,
}

/// Source of the FIFO interface clock (IFCLK).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum InterfaceClock {
    /// IFCLK is supplied externally on the IFCLK pin.
    External,
    /// IFCLK is generated internally.
    Internal {
        freq: IfClockFreq,
        /// Drive the internal clock out on the IFCLK pin.
        output: bool,
    },
}

impl Default for InterfaceClock {
    fn default() -> Self {
        InterfaceClock::Internal {
            freq: IfClockFreq::Mhz48,
            output: false,
        }
    }
}

/// 8051 core clock frequency.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CpuClock {
    Mhz12,
    Mhz24,
    Mhz48,
}

impl CpuClock {
    /// Returns the frequency in MHz.
    pub fn mhz(self) -> u8 {
        match self {
            CpuClock::Mhz12 => 12,
            CpuClock::Mhz24 => 24,
            CpuClock::Mhz48 => 48,
        }
    }
}

impl Default for CpuClock {
    fn default() -> Self {
        CpuClock::Mhz48
    }
}

bitflags! {
    /// FIFO pins whose polarity is inverted (asserted high instead of low).
    #[derive(Default)]
    pub struct PinPolarity: u8 {
        /// "Queue full" flag output.
        const FULL = 1 << 0;
        /// "Queue empty" flag output.
        const EMPTY = 1 << 1;
        /// SLWR write strobe input.
        const SLWR = 1 << 2;
        /// SLRD read strobe input.
        const SLRD = 1 << 3;
        /// SLOE output enable input.
        const SLOE = 1 << 4;
        /// PKTEND packet end input.
        const PKTEND = 1 << 5;
    }
}

/// Settings applied by the streaming firmware at startup.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FirmwareConfig {
    pub direction: Direction,
    pub bus_width: BusWidth,
    pub buffering: Buffering,
    pub fifo_mode: FifoMode,
    pub if_clock: InterfaceClock,
    /// Invert the interface clock.
    pub invert_if_clock: bool,
    pub cpu_clock: CpuClock,
    /// Drive the CPU clock out on the CLKOUT pin (otherwise it is tristated).
    pub clkout_enable: bool,
    /// Invert the CLKOUT signal.
    pub invert_clkout: bool,
    pub polarity: PinPolarity,
}

// Byte 1 (IFCONFIG).
const IFC_INTERNAL: u8 = 1 << 7;
const IFC_48MHZ: u8 = 1 << 6;
const IFC_OUTPUT: u8 = 1 << 5;
const IFC_INVERT: u8 = 1 << 4;
const IFC_ASYNC: u8 = 1 << 3;
const IFC_SLAVE_FIFO: u8 = 0x03;

// Byte 2 (EPxCFG).
const EPCFG_VALID: u8 = 1 << 7;
const EPCFG_IN: u8 = 1 << 6;
const EPCFG_BULK_512: u8 = 0x20;
const EPCFG_BUF_MASK: u8 = 0x03;

// Byte 3 (EPxFIFOCFG).
const FIFOCFG_IN: u8 = 0x0d;
const FIFOCFG_OUT: u8 = 0x11;
const FIFOCFG_WORDWIDE: u8 = 0x01;

// Byte 4 (CPUCS).
const CPUCS_24MHZ: u8 = 0x08;
const CPUCS_48MHZ: u8 = 0x10;
const CPUCS_CLKINV: u8 = 1 << 2;
const CPUCS_CLKOE: u8 = 1 << 1;

impl FirmwareConfig {
    /// Packs the configuration into the 6-byte block expected by the firmware.
    ///
    /// # Examples
    ///
    /// ```
    /// use fx2stream::FirmwareConfig;
    ///
    /// let bytes = FirmwareConfig::default().to_bytes();
    /// assert_eq!(bytes, [0x12, 0xc3, 0xe0, 0x0d, 0x10, 0x00]);
    /// ```
    pub fn to_bytes(&self) -> [u8; 6] {
        let input = self.direction == Direction::DeviceToHost;
        let mut bytes = [0; 6];

        bytes[0] = if input { 0x12 } else { 0x21 };

        bytes[1] = IFC_SLAVE_FIFO;
        match self.if_clock {
            // The 48 MHz bit is left at its default, IFCLK ignores it in external mode.
            InterfaceClock::External => bytes[1] |= IFC_48MHZ,
            InterfaceClock::Internal { freq, output } => {
                bytes[1] |= IFC_INTERNAL;
                if freq == IfClockFreq::Mhz48 {
                    bytes[1] |= IFC_48MHZ;
                }
                if output {
                    bytes[1] |= IFC_OUTPUT;
                }
            }
        }
        if self.invert_if_clock {
            bytes[1] |= IFC_INVERT;
        }
        if self.fifo_mode == FifoMode::Async {
            bytes[1] |= IFC_ASYNC;
        }

        bytes[2] = EPCFG_VALID | EPCFG_BULK_512;
        if input {
            bytes[2] |= EPCFG_IN;
        }
        bytes[2] |= match self.buffering {
            Buffering::Quad => 0x00,
            Buffering::Double => 0x02,
            Buffering::Triple => 0x03,
        };

        bytes[3] = if input { FIFOCFG_IN } else { FIFOCFG_OUT };
        if self.bus_width == BusWidth::Eight {
            bytes[3] &= !FIFOCFG_WORDWIDE;
        }

        bytes[4] = match self.cpu_clock {
            CpuClock::Mhz12 => 0x00,
            CpuClock::Mhz24 => CPUCS_24MHZ,
            CpuClock::Mhz48 => CPUCS_48MHZ,
        };
        if self.invert_clkout {
            bytes[4] |= CPUCS_CLKINV;
        }
        if self.clkout_enable {
            bytes[4] |= CPUCS_CLKOE;
        }

        bytes[5] = self.polarity.bits();

        bytes
    }

    /// Decodes a configuration block.
    ///
    /// Every block produced by [`to_bytes`] is accepted and decodes to the original value. Bytes
    /// that no configuration can produce are rejected.
    ///
    /// [`to_bytes`]: #method.to_bytes
    pub fn from_bytes(bytes: &[u8; 6]) -> Result<Self> {
        let invalid = |what: &str, byte: u8| {
            Err(Error::config(format!(
                "invalid {} byte 0x{:02x} in firmware configuration",
                what, byte
            )))
        };

        let direction = match bytes[0] {
            0x12 => Direction::DeviceToHost,
            0x21 => Direction::HostToDevice,
            b => return invalid("direction", b),
        };
        let input = direction == Direction::DeviceToHost;

        let ifc = bytes[1];
        if ifc & 0x07 != IFC_SLAVE_FIFO {
            return invalid("IFCONFIG", ifc);
        }
        let if_clock = if ifc & IFC_INTERNAL != 0 {
            let freq = if ifc & IFC_48MHZ != 0 {
                IfClockFreq::Mhz48
            } else {
                IfClockFreq::Mhz30
            };
            InterfaceClock::Internal {
                freq,
                output: ifc & IFC_OUTPUT != 0,
            }
        } else {
            if ifc & (IFC_48MHZ | IFC_OUTPUT) != IFC_48MHZ {
                return invalid("IFCONFIG", ifc);
            }
            InterfaceClock::External
        };
        let invert_if_clock = ifc & IFC_INVERT != 0;
        let fifo_mode = if ifc & IFC_ASYNC != 0 {
            FifoMode::Async
        } else {
            FifoMode::Sync
        };

        let epcfg = bytes[2];
        let expected = EPCFG_VALID | EPCFG_BULK_512 | if input { EPCFG_IN } else { 0 };
        if epcfg & !EPCFG_BUF_MASK != expected {
            return invalid("EPxCFG", epcfg);
        }
        let buffering = match epcfg & EPCFG_BUF_MASK {
            0x00 => Buffering::Quad,
            0x02 => Buffering::Double,
            0x03 => Buffering::Triple,
            _ => return invalid("EPxCFG", epcfg),
        };

        let fifocfg = bytes[3];
        let base = if input { FIFOCFG_IN } else { FIFOCFG_OUT };
        let bus_width = if fifocfg == base {
            BusWidth::Sixteen
        } else if fifocfg == base & !FIFOCFG_WORDWIDE {
            BusWidth::Eight
        } else {
            return invalid("EPxFIFOCFG", fifocfg);
        };

        let cpucs = bytes[4];
        if cpucs & !(CPUCS_24MHZ | CPUCS_48MHZ | CPUCS_CLKINV | CPUCS_CLKOE) != 0 {
            return invalid("CPUCS", cpucs);
        }
        let cpu_clock = match cpucs & (CPUCS_24MHZ | CPUCS_48MHZ) {
            0x00 => CpuClock::Mhz12,
            CPUCS_24MHZ => CpuClock::Mhz24,
            CPUCS_48MHZ => CpuClock::Mhz48,
            _ => return invalid("CPUCS", cpucs),
        };

        let polarity = match PinPolarity::from_bits(bytes[5]) {
            Some(p) => p,
            None => return invalid("FIFOPINPOLAR", bytes[5]),
        };

        Ok(Self {
            direction,
            bus_width,
            buffering,
            fifo_mode,
            if_clock,
            invert_if_clock,
            cpu_clock,
            clkout_enable: cpucs & CPUCS_CLKOE != 0,
            invert_clkout: cpucs & CPUCS_CLKINV != 0,
            polarity,
        })
    }
}

impl fmt::Display for FirmwareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(
            f,
            "{}, {}, {}, {}, {}, {}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        )
    }
}

/// Interface clock option, in the form `[x|30[o]|48[o]][i]`.
///
/// `x` selects the external clock, `30`/`48` an internal one, `o` drives the internal clock out
/// on the IFCLK pin and `i` inverts IFCLK. Omitted parts keep their defaults.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ClockOption {
    pub clock: InterfaceClock,
    pub invert: bool,
}

impl FromStr for ClockOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut opt = ClockOption::default();
        let mut rest = s;

        let freq = if eat(&mut rest, "x") {
            opt.clock = InterfaceClock::External;
            None
        } else if eat(&mut rest, "30") {
            Some(IfClockFreq::Mhz30)
        } else if eat(&mut rest, "48") {
            Some(IfClockFreq::Mhz48)
        } else {
            None
        };
        if let Some(freq) = freq {
            let output = eat(&mut rest, "o");
            opt.clock = InterfaceClock::Internal { freq, output };
        }

        opt.invert = eat(&mut rest, "i");

        if !rest.is_empty() {
            return Err(Error::config(format!(
                "invalid interface clock `{}` (expected `[x|30[o]|48[o]][i]`)",
                s
            )));
        }
        Ok(opt)
    }
}

/// CPU clock option, in the form `[12|24|48][o|z][i]`.
///
/// `o` enables the CLKOUT driver, `z` tristates it and `i` inverts CLKOUT.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CpuOption {
    pub clock: CpuClock,
    pub clkout_enable: bool,
    pub invert_clkout: bool,
}

impl FromStr for CpuOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut opt = CpuOption::default();
        let mut rest = s;

        if eat(&mut rest, "12") {
            opt.clock = CpuClock::Mhz12;
        } else if eat(&mut rest, "24") {
            opt.clock = CpuClock::Mhz24;
        } else if eat(&mut rest, "48") {
            opt.clock = CpuClock::Mhz48;
        }

        if eat(&mut rest, "o") {
            opt.clkout_enable = true;
        } else if eat(&mut rest, "z") {
            opt.clkout_enable = false;
        }

        opt.invert_clkout = eat(&mut rest, "i");

        if !rest.is_empty() {
            return Err(Error::config(format!(
                "invalid CPU clock `{}` (expected `[12|24|48][o|z][i]`)",
                s
            )));
        }
        Ok(opt)
    }
}

/// Strips `prefix` off `s`, returning whether it was present.
fn eat(s: &mut &str, prefix: &str) -> bool {
    match s.strip_prefix(prefix) {
        Some(rest) => {
            *s = rest;
            true
        }
        None => false,
    }
}
