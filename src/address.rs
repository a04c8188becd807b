//! Bluetooth device addresses.
//!
//! An [`Address`] is the stable hardware identifier of a remote device. It is what the
//! [`Coordinator`][crate::Coordinator] uses to tell devices apart, and what BlueZ encodes into
//! the object path of every device it knows about.

use core::fmt;
use std::{fmt::Write, num::ParseIntError, str::FromStr};

/// A 6-Byte Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    const PATH_SEGMENT_PREFIX: &'static str = "dev_";

    #[inline]
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Extracts the device address from a BlueZ device object path.
    ///
    /// BlueZ names device objects after their address, eg. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
    /// Returns [`None`] if the last path segment does not follow that scheme.
    pub fn from_device_path(path: &str) -> Option<Self> {
        let segment = path.rsplit('/').next()?;
        let digits = segment.strip_prefix(Self::PATH_SEGMENT_PREFIX)?;
        digits.replace('_', ":").parse().ok()
    }

    /// Builds the BlueZ object path of this device below the given adapter path.
    pub fn device_path(&self, adapter_path: &str) -> String {
        let mut path = format!("{}/{}", adapter_path, Self::PATH_SEGMENT_PREFIX);
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                path.push('_');
            }
            // Writing to a `String` cannot fail.
            let _ = write!(path, "{:02X}", byte);
        }
        path
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl From<Address> for [u8; 6] {
    #[inline]
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(':')?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Parses a Bluetooth [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(ParseAddressError::other)?;
            if part.len() != 2 {
                return Err(ParseAddressError::other());
            }
            *byte = u8::from_str_radix(part, 16).map_err(ParseAddressError::parse_int)?;
        }

        if parts.next().is_some() {
            return Err(ParseAddressError::other());
        }

        Ok(Address(bytes))
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Address`].
#[derive(Debug)]
pub struct ParseAddressError(ParseAddressErrorKind);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ParseAddressErrorKind::ParseInt(e) => e.fmt(f),
            ParseAddressErrorKind::Other => f.write_str("invalid device address"),
        }
    }
}

impl std::error::Error for ParseAddressError {}

#[derive(Debug)]
enum ParseAddressErrorKind {
    ParseInt(ParseIntError),
    Other,
}

impl ParseAddressError {
    fn parse_int(e: ParseIntError) -> Self {
        Self(ParseAddressErrorKind::ParseInt(e))
    }

    fn other() -> Self {
        Self(ParseAddressErrorKind::Other)
    }
}
