//! Session error types

use alloc::string::String;
use core::fmt;

use crate::capability::CapError;

/// Errors returned by session operations
///
/// Resource-exhaustion and identity errors leave every registry unchanged.
/// `DeviceEnableFailed` is reported after the acquire has been rolled back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformError {
    /// No device of that name is visible to the session
    NotFound,
    /// Device is owned by another session
    AlreadyOwned,
    /// Capability-slot quota exhausted
    OutOfCaps,
    /// Memory quota or backing memory exhausted
    OutOfMemory,
    /// No device is visible to the session
    NoAcquirableDevice,
    /// More than one device is visible to the session
    AmbiguousSelection,
    /// Capability does not resolve to an object of this session
    InvalidCapability,
    /// Enable hook or IOMMU attachment failed
    DeviceEnableFailed,
    /// Session was torn down
    SessionClosed,
    /// Malformed request (e.g. zero-sized buffer)
    InvalidArgument,
    /// Policy or device description could not be parsed
    InvalidConfig(String),
    /// Report could not be rendered
    Serialization(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NotFound => write!(f, "device not found"),
            PlatformError::AlreadyOwned => write!(f, "device already owned by another session"),
            PlatformError::OutOfCaps => write!(f, "capability quota exceeded"),
            PlatformError::OutOfMemory => write!(f, "memory quota exceeded"),
            PlatformError::NoAcquirableDevice => write!(f, "no acquirable device"),
            PlatformError::AmbiguousSelection => {
                write!(f, "more than one device is acquirable")
            }
            PlatformError::InvalidCapability => write!(f, "invalid capability"),
            PlatformError::DeviceEnableFailed => write!(f, "device enable failed"),
            PlatformError::SessionClosed => write!(f, "session closed"),
            PlatformError::InvalidArgument => write!(f, "invalid argument"),
            PlatformError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            PlatformError::Serialization(msg) => write!(f, "serialization failed: {}", msg),
        }
    }
}

impl From<CapError> for PlatformError {
    fn from(_: CapError) -> Self {
        PlatformError::InvalidCapability
    }
}
