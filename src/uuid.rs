//! Bluetooth service UUIDs.

use core::fmt;
use std::str::FromStr;

/// A 128-bit UUID, identifying a service offered by a remote device.
///
/// BlueZ reports the services a device advertises as hyphenated UUID strings; those are parsed
/// via the [`FromStr`] implementation. Well-known services assigned by the Bluetooth SIG can be
/// constructed from their 16-bit alias with [`Uuid::from_u16`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The Bluetooth Base UUID (`00000000-0000-1000-8000-00805f9b34fb`) that 16-bit aliases are
    /// expanded into.
    const BASE: [u8; 16] = [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34,
        0xfb,
    ];

    /// Byte offsets after which the textual form carries a `-`.
    const DASHES_AFTER: [usize; 4] = [3, 5, 7, 9];

    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Creates a [`Uuid`] from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        let [hi, lo] = short.to_be_bytes();
        let mut bytes = Self::BASE;
        bytes[2] = hi;
        bytes[3] = lo;
        Self(bytes)
    }

    /// Returns the 16-bit alias of this [`Uuid`], if it is derived from the Base UUID.
    pub fn as_u16(&self) -> Option<u16> {
        let mut masked = self.0;
        masked[2] = 0;
        masked[3] = 0;
        if masked == Self::BASE {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }
}

fn nibble(digit: u8) -> Result<u8, ParseUuidError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(ParseUuidError(ErrorKind::InvalidDigit)),
    }
}

/// Parses a [`Uuid`] in its hyphenated form, eg. `0000110b-0000-1000-8000-00805f9b34fb`.
impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut input = s.bytes();
        let mut next = || input.next().ok_or(ParseUuidError(ErrorKind::Eof));

        let mut out = [0; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            let high = nibble(next()?)?;
            let low = nibble(next()?)?;
            *byte = (high << 4) | low;

            if Self::DASHES_AFTER.contains(&i) && next()? != b'-' {
                return Err(ParseUuidError(ErrorKind::InvalidDash));
            }
        }

        if next().is_ok() {
            return Err(ParseUuidError(ErrorKind::TrailingData));
        }

        Ok(Self(out))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            write!(f, "{:02x}", byte)?;
            if Self::DASHES_AFTER.contains(&i) {
                f.write_str("-")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Uuid`].
#[derive(Debug)]
pub struct ParseUuidError(ErrorKind);

#[derive(Debug)]
enum ErrorKind {
    Eof,
    InvalidDigit,
    InvalidDash,
    TrailingData,
}

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self.0 {
            ErrorKind::Eof => "unexpected end of input",
            ErrorKind::InvalidDigit => "invalid hex digit",
            ErrorKind::InvalidDash => "invalid character (`-` expected)",
            ErrorKind::TrailingData => "invalid trailing data",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ParseUuidError {}
