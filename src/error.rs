//! Error type shared by every fallible operation in the crate.

use std::fmt;

/// Errors that can occur while allocating or managing GPU memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A parameter failed validation (zero size, non-power-of-two alignment,
    /// inconsistent pool description, ...).
    InvalidArgument(&'static str),
    /// No existing block could satisfy the request and no new block or
    /// committed resource may be created.
    OutOfMemory,
    /// The device rejected a heap or resource creation call. The message is
    /// forwarded from the device verbatim.
    Device(String),
    /// The device or this build lacks support for the requested operation.
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Device(msg) => write!(f, "device error: {}", msg),
            Error::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

impl std::error::Error for Error {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            Error::InvalidArgument("size must not be zero").to_string(),
            "invalid argument: size must not be zero"
        );
        assert_eq!(
            Error::Device("heap creation failed".into()).to_string(),
            "device error: heap creation failed"
        );
    }
}
