//! PCIe bus/device/function addressing.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A PCIe `BB:DD.F` address.
///
/// The canonical form is the 7-character colon-hex rendering. Parsing also
/// accepts a leading `0000:` domain prefix, which some subsystems prepend
/// when addressing the primary function. The domain-qualified form used by
/// sysfs and the hot-plug driver is produced by [`Bdf::with_domain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bdf {
    bus: u8,
    device: u8,
    function: u8,
}

impl Bdf {
    /// Parses a BDF from `BB:DD.F` or `0000:BB:DD.F`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let text = text.strip_prefix("0000:").unwrap_or(text);
        let parse = || -> Option<Self> {
            let (bus, rest) = text.split_once(':')?;
            let (device, function) = rest.split_once('.')?;
            if bus.len() != 2 || device.len() != 2 || function.len() != 1 {
                return None;
            }
            Some(Self {
                bus: u8::from_str_radix(bus, 16).ok()?,
                device: u8::from_str_radix(device, 16).ok()?,
                function: u8::from_str_radix(function, 16).ok()?,
            })
        };
        parse().ok_or_else(|| Error::HardwareNotFound(text.to_string()))
    }

    /// The two-hex-digit bus number, as used in DMA device paths.
    pub fn bus_str(&self) -> String {
        format!("{:02x}", self.bus)
    }

    /// The domain-qualified form `0000:BB:DD.F`.
    pub fn with_domain(&self) -> String {
        format!("0000:{self}")
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl FromStr for Bdf {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
