//! Chip property database.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// EZ-USB controller generation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ChipType {
    An21,
    Fx,
    Fx2,
    Fx2Lp,
}

impl ChipType {
    const NAMES: &'static [(&'static str, ChipType)] = &[
        ("an21", ChipType::An21),
        ("fx", ChipType::Fx),
        ("fx2", ChipType::Fx2),
        ("fx2lp", ChipType::Fx2Lp),
    ];

    /// Returns the RAM address of the CPU control and status register.
    ///
    /// Writing 1 to it holds the 8051 in reset, writing 0 releases it.
    pub fn cpucs_addr(self) -> u16 {
        match self {
            ChipType::An21 | ChipType::Fx => 0x7f92,
            ChipType::Fx2 | ChipType::Fx2Lp => 0xe600,
        }
    }

    /// Returns whether the memory range `addr..addr + len` must be written through the
    /// second-stage loader.
    ///
    /// Only on-chip RAM can be written by the boot ROM. A range straddling the end of on-chip RAM
    /// counts as external.
    pub fn is_external(self, addr: u32, len: usize) -> bool {
        let end = addr + len as u32;
        let (code_end, scratch) = match self {
            ChipType::An21 | ChipType::Fx => (0x1b40, None),
            ChipType::Fx2 => (0x2000, Some(0xe000..0xe200)),
            ChipType::Fx2Lp => (0x4000, Some(0xe000..0xe200)),
        };

        if addr < code_end {
            return end > code_end;
        }
        match scratch {
            Some(range) if range.contains(&addr) => end > range.end,
            _ => true,
        }
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = ChipType::NAMES
            .iter()
            .find(|(_, ty)| ty == self)
            .map(|(name, _)| *name)
            .unwrap_or("?");
        f.write_str(name)
    }
}

impl FromStr for ChipType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ChipType::NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, ty)| *ty)
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown chip type `{}` (expected an21, fx, fx2 or fx2lp)",
                    s
                ))
            })
    }
}

/// A device recognized without further configuration.
#[derive(Debug)]
pub struct KnownDevice {
    pub vid: u16,
    pub pid: u16,
    pub chip: ChipType,
    pub designation: &'static str,
}

/// VID/PID pairs of unprogrammed EZ-USB parts.
pub static KNOWN_DEVICES: &[KnownDevice] = &[
    KnownDevice {
        vid: 0x0547,
        pid: 0x2122,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2122S)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2125,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2121S/2125S)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2126,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2126S)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2131,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2131Q/2131S/2135S)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2136,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2136S)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2225,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2225)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2226,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2226)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2235,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2235)",
    },
    KnownDevice {
        vid: 0x0547,
        pid: 0x2236,
        chip: ChipType::An21,
        designation: "Cypress EZ-USB (2236)",
    },
    KnownDevice {
        vid: 0x04b4,
        pid: 0x6473,
        chip: ChipType::Fx,
        designation: "Cypress EZ-USB FX1",
    },
    KnownDevice {
        vid: 0x04b4,
        pid: 0x8613,
        chip: ChipType::Fx2Lp,
        designation: "Cypress EZ-USB FX2LP (68013A/68014A/68015A/68016A)",
    },
];

/// Looks up a VID/PID pair in [`KNOWN_DEVICES`].
///
/// [`KNOWN_DEVICES`]: static.KNOWN_DEVICES.html
pub fn lookup(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES
        .iter()
        .find(|dev| dev.vid == vid && dev.pid == pid)
}
