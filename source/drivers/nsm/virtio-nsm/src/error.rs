// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the NSM driver and its errno mapping.

use nexus_hal::{QueueError, VirtioError};
use thiserror::Error;

use crate::cbor::CborError;

/// Result alias used across the driver.
pub type Result<T> = core::result::Result<T, NsmError>;

pub(crate) mod errno {
    pub const ENOENT: i32 = 2;
    pub const ENXIO: i32 = 6;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENODATA: i32 = 61;
    pub const EMSGSIZE: i32 = 90;
    pub const ETIMEDOUT: i32 = 110;
}

/// Failures surfaced synchronously to the immediate caller. The driver never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NsmError {
    /// Malformed or contradictory call.
    #[error("invalid argument")]
    InvalidArgument,
    /// Request exceeds `NSM_REQUEST_MAX_SIZE`.
    #[error("request exceeds maximum size")]
    MessageTooLarge,
    #[error("out of memory")]
    OutOfMemory,
    /// A copy across the user boundary failed.
    #[error("bad address")]
    Fault,
    /// No NSM device is bound, or it has no queue.
    #[error("no nsm device")]
    NoDevice,
    /// The device could not be notified.
    #[error("i/o error")]
    Io,
    #[error("device response timed out")]
    TimedOut,
    /// The device handed back a buffer other than the one expected.
    #[error("completion does not match submitted buffer")]
    Desync,
    #[error("malformed response: {0}")]
    Decode(#[from] CborError),
    /// Non-blocking access while another exchange is in flight.
    #[error("device busy")]
    Busy,
    #[error("virtqueue: {0}")]
    Queue(#[from] QueueError),
    /// Queue initialisation failed while binding a device.
    #[error("device setup: {0}")]
    Setup(#[from] VirtioError),
}

impl NsmError {
    /// Negative errno reported to ioctl and hwrng callers.
    pub fn errno(self) -> i32 {
        let code = match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::MessageTooLarge => errno::EMSGSIZE,
            Self::OutOfMemory => errno::ENOMEM,
            Self::Fault | Self::Decode(_) => errno::EFAULT,
            Self::NoDevice => errno::ENXIO,
            Self::Io => errno::EIO,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::Desync => errno::ENODATA,
            Self::Busy => errno::EBUSY,
            Self::Queue(QueueError::NoSpace) => errno::ENOSPC,
            Self::Queue(QueueError::NoMemory) => errno::ENOMEM,
            Self::Queue(QueueError::Broken) => errno::EIO,
            Self::Setup(VirtioError::QueueNotFound) => errno::ENOENT,
            Self::Setup(VirtioError::Setup(rc)) if rc < 0 => -rc,
            Self::Setup(VirtioError::Setup(_)) => errno::EIO,
        };
        -code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negative_linux_codes() {
        assert_eq!(NsmError::InvalidArgument.errno(), -22);
        assert_eq!(NsmError::MessageTooLarge.errno(), -90);
        assert_eq!(NsmError::TimedOut.errno(), -110);
        assert_eq!(NsmError::Busy.errno(), -16);
        assert_eq!(NsmError::Desync.errno(), -61);
        assert_eq!(NsmError::Decode(CborError::Truncated).errno(), -14);
        assert_eq!(NsmError::Queue(QueueError::NoSpace).errno(), -28);
        assert_eq!(NsmError::Setup(VirtioError::Setup(-12)).errno(), -12);
        assert_eq!(NsmError::Setup(VirtioError::Setup(3)).errno(), -5);
    }

    #[test]
    fn timeout_is_distinct_from_io() {
        assert_ne!(NsmError::TimedOut.errno(), NsmError::Io.errno());
    }
}
