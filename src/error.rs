use std::fmt;

use crate::{address::ParseAddressError, address::Address, uuid::ParseUuidError};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
}

impl Error {
    pub(crate) fn from(e: impl Into<ErrorKind>) -> Self {
        Self { inner: e.into() }
    }

    pub(crate) fn rejected(command: &'static str) -> Self {
        Self {
            inner: ErrorKind::Rejected(command),
        }
    }

    pub(crate) fn conflict(in_flight: Address) -> Self {
        Self {
            inner: ErrorKind::Conflict(in_flight),
        }
    }

    pub(crate) fn closed() -> Self {
        Self {
            inner: ErrorKind::Closed,
        }
    }

    /// Returns whether the platform refused to carry out a command (eg. starting discovery
    /// while the adapter is powered off).
    pub fn is_rejected(&self) -> bool {
        matches!(self.inner, ErrorKind::Rejected(_))
    }

    /// Returns whether a pairing request was refused because another one is still in flight.
    pub fn is_conflict(&self) -> bool {
        matches!(self.inner, ErrorKind::Conflict(_))
    }

    /// Returns whether an event source has ended and will not yield further events.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner, ErrorKind::Closed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorKind::Zbus(e) => e.fmt(f),
            ErrorKind::Fdo(e) => e.fmt(f),
            ErrorKind::ParseAddressError(e) => e.fmt(f),
            ErrorKind::ParseUuidError(e) => e.fmt(f),
            ErrorKind::Rejected(command) => write!(f, "platform rejected {}", command),
            ErrorKind::Conflict(addr) => write!(f, "already pairing with {}", addr),
            ErrorKind::Closed => f.write_str("event source closed"),
            ErrorKind::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    ParseAddressError(ParseAddressError),
    ParseUuidError(ParseUuidError),
    Rejected(&'static str),
    Conflict(Address),
    Closed,
    Other(String),
}

impl From<zbus::Error> for ErrorKind {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for ErrorKind {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<ParseAddressError> for ErrorKind {
    fn from(value: ParseAddressError) -> Self {
        Self::ParseAddressError(value)
    }
}

impl From<ParseUuidError> for ErrorKind {
    fn from(value: ParseUuidError) -> Self {
        Self::ParseUuidError(value)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}
