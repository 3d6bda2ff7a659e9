use std::fmt;

use crate::framework::SurfaceId;

#[derive(Debug)]
pub enum RelayError {
    /// The device instance is not registered, or teardown already began.
    NotInitialized,

    /// The consumer did not reply within the configured window.
    Timeout,

    InvalidArgument(String),

    ResourceExhausted(String),

    /// A surface identifier was announced twice without being destroyed
    /// in between. This is a defect in the calling framework.
    DuplicateIdentifier(SurfaceId),

    UnsupportedMode(String),

    /// A non-blocking read found no pending event.
    WouldBlock,

    /// The channel was closed while a reader was waiting.
    Cancelled,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl RelayError {
    pub fn class(&self) -> RelayErrorClass {
        match self {
            Self::InvalidArgument(_) | Self::DuplicateIdentifier(_) => {
                RelayErrorClass::InvalidInput
            }
            Self::UnsupportedMode(_) => RelayErrorClass::Unsupported,
            Self::NotInitialized | Self::Timeout | Self::WouldBlock | Self::Cancelled => {
                RelayErrorClass::Transient
            }
            Self::ResourceExhausted(_) | Self::Platform(_) => RelayErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::WouldBlock)
    }

    /// Negative errno equivalent, for hosts that expose the channel through
    /// a file-descriptor style interface.
    pub fn errno(&self) -> i32 {
        const EINTR: i32 = 4;
        const EIO: i32 = 5;
        const EAGAIN: i32 = 11;
        const ENOMEM: i32 = 12;
        const EEXIST: i32 = 17;
        const ENODEV: i32 = 19;
        const EINVAL: i32 = 22;
        const EOPNOTSUPP: i32 = 95;
        const ETIMEDOUT: i32 = 110;

        -match self {
            Self::NotInitialized => ENODEV,
            Self::Timeout => ETIMEDOUT,
            Self::InvalidArgument(_) => EINVAL,
            Self::ResourceExhausted(_) => ENOMEM,
            Self::DuplicateIdentifier(_) => EEXIST,
            Self::UnsupportedMode(_) => EOPNOTSUPP,
            Self::WouldBlock => EAGAIN,
            Self::Cancelled => EINTR,
            Self::Platform(_) => EIO,
        }
    }

    /// Create a string-based copy of this error suitable for sending
    /// through channels. The `Platform` variant loses its inner
    /// `anyhow::Error` chain and becomes a formatted string.
    pub fn to_sendable(&self) -> Self {
        match self {
            Self::NotInitialized => Self::NotInitialized,
            Self::Timeout => Self::Timeout,
            Self::InvalidArgument(s) => Self::InvalidArgument(s.clone()),
            Self::ResourceExhausted(s) => Self::ResourceExhausted(s.clone()),
            Self::DuplicateIdentifier(id) => Self::DuplicateIdentifier(*id),
            Self::UnsupportedMode(s) => Self::UnsupportedMode(s.clone()),
            Self::WouldBlock => Self::WouldBlock,
            Self::Cancelled => Self::Cancelled,
            Self::Platform(inner) => Self::Platform(anyhow::anyhow!("{inner:#}")),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "device instance is not active"),
            Self::Timeout => write!(f, "timed out waiting for consumer reply"),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::ResourceExhausted(message) => write!(f, "allocation failed: {message}"),
            Self::DuplicateIdentifier(id) => {
                write!(f, "surface identifier {id} is already registered")
            }
            Self::UnsupportedMode(message) => write!(f, "unsupported buffer mode: {message}"),
            Self::WouldBlock => write!(f, "no event pending"),
            Self::Cancelled => write!(f, "channel was closed while waiting"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_matches_kernel_conventions() {
        assert_eq!(RelayError::Timeout.errno(), -110);
        assert_eq!(RelayError::InvalidArgument("x".into()).errno(), -22);
        assert_eq!(RelayError::WouldBlock.errno(), -11);
        assert_eq!(RelayError::DuplicateIdentifier(SurfaceId(3)).errno(), -17);
    }

    #[test]
    fn sendable_copy_keeps_platform_message() {
        let err = RelayError::Platform(anyhow::anyhow!("framework refused attach"));
        let copy = err.to_sendable();
        assert_eq!(copy.to_string(), "framework refused attach");
        assert_eq!(copy.class(), RelayErrorClass::Fatal);
    }

    #[test]
    fn only_waits_are_retryable() {
        assert!(RelayError::Timeout.is_retryable());
        assert!(RelayError::WouldBlock.is_retryable());
        assert!(!RelayError::Cancelled.is_retryable());
        assert!(!RelayError::UnsupportedMode("24bpp".into()).is_retryable());
    }
}
