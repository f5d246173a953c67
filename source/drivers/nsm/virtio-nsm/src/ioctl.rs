// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ioctl entry point of the `nsm` misc device.

use log::debug;
use nexus_hal::{UserAddr, UserMemory};

use crate::driver::{NsmDriver, Wait};
use crate::error::{NsmError, Result};
use crate::message::{KernelMessage, NSM_MESSAGE_SIZE};

const NSM_IOCTL_MAGIC: u32 = 0x0A;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn iowr(ty: u32, nr: u32, size: usize) -> u32 {
    ((IOC_READ | IOC_WRITE) << 30) | ((size as u32) << 16) | (ty << 8) | nr
}

/// `_IOWR(0x0A, 0, struct nsm_message)`
pub const NSM_IO_REQUEST: u32 = iowr(NSM_IOCTL_MAGIC, 0, NSM_MESSAGE_SIZE);

impl NsmDriver {
    pub fn open(&self) {
        debug!("nsm: device file opened");
    }

    pub fn release(&self) {
        debug!("nsm: device file closed");
    }

    /// Handles `NSM_IO_REQUEST`: copies the request in, exchanges it with the
    /// device and copies the response out, holding the gate throughout.
    pub fn ioctl(&self, user: &dyn UserMemory, cmd: u32, arg: UserAddr) -> Result<()> {
        if cmd != NSM_IO_REQUEST {
            return Err(NsmError::InvalidArgument);
        }

        let mut session = self.acquire(Wait::Blocking)?;
        let mut message = KernelMessage::new();
        message.import(user, arg)?;
        session.exchange(&mut message)?;
        message.export(user, arg)
    }

    /// [`NsmDriver::ioctl`] with the result folded into a syscall return value.
    pub fn ioctl_errno(&self, user: &dyn UserMemory, cmd: u32, arg: UserAddr) -> i64 {
        match self.ioctl(user, cmd, arg) {
            Ok(()) => 0,
            Err(err) => i64::from(err.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NsmConfig;
    use crate::loopback::SimUserMemory;

    #[test]
    fn request_code_matches_linux_encoding() {
        assert_eq!(NSM_IO_REQUEST, 0xC020_0A00);
    }

    #[test]
    fn unknown_command_is_invalid() {
        let driver = NsmDriver::new(NsmConfig::default());
        let mem = SimUserMemory::new();
        assert_eq!(driver.ioctl_errno(&mem, NSM_IO_REQUEST + 1, UserAddr(0x1000)), -22);
    }

    #[test]
    fn no_device_reported_after_import() {
        let driver = NsmDriver::new(NsmConfig::default());
        let mem = SimUserMemory::new();
        let req = mem.map(b"ping");
        let rsp = mem.alloc(8);
        let desc = crate::message::NsmMessage {
            request: crate::message::IoVec::new(req, 4),
            response: crate::message::IoVec::new(rsp, 8),
        };
        let arg = mem.map(&desc.to_bytes());
        assert_eq!(driver.ioctl(&mem, NSM_IO_REQUEST, arg), Err(NsmError::NoDevice));
    }
}
