// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware abstraction traits shared by user drivers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 4 unit tests + tests/queue_buffer.rs
//!
//! PUBLIC API:
//!   - UserMemory: copies across the user/driver trust boundary
//!   - Virtqueue: submit/kick/retrieve on a single virtqueue
//!   - VirtioDevice: bus-level device owning its virtqueues
//!   - HwRng: hardware random number provider
//!   - QueueBuffer: owned buffer carrying its identity through a queue
//!
//! DEPENDENCIES:
//!   - thiserror: error derives (no_std)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

/// Address in a caller's (untrusted) address space.
///
/// Never dereferenced directly; only handed to [`UserMemory`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserAddr(pub u64);

impl UserAddr {
    pub const NULL: UserAddr = UserAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `off` bytes past `self`, or `None` on overflow.
    pub fn offset(self, off: u64) -> Option<UserAddr> {
        self.0.checked_add(off).map(UserAddr)
    }
}

/// A cross-boundary copy touched memory the caller does not own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("user copy faulted at {addr:#x} ({len} bytes)")]
pub struct CopyFault {
    pub addr: u64,
    pub len: usize,
}

/// Copy primitives for a foreign address space.
pub trait UserMemory {
    fn copy_from_user(&self, dst: &mut [u8], src: UserAddr) -> Result<(), CopyFault>;
    fn copy_to_user(&self, dst: UserAddr, src: &[u8]) -> Result<(), CopyFault>;
}

/// Owned buffer submitted to a [`Virtqueue`].
///
/// The queue holds the buffer until the device hands it back, so its heap
/// address stays unique among live buffers and can serve as its identity.
#[derive(Debug)]
pub struct QueueBuffer {
    data: Vec<u8>,
}

impl QueueBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Identity of the buffer while it is owned by a queue.
    pub fn addr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the buffer spans real memory a device can be pointed at.
    /// Zero-length buffers only carry a dangling pointer.
    pub fn is_dma_capable(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Failures while adding buffers to a virtqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("no free descriptors")]
    NoSpace,
    #[error("descriptor allocation failed")]
    NoMemory,
    #[error("virtqueue is broken")]
    Broken,
}

/// A single virtqueue with strictly positional completion order.
pub trait Virtqueue: Send + Sync {
    /// Adds a device-readable buffer.
    fn add_outbuf(&self, buf: QueueBuffer) -> Result<(), QueueError>;
    /// Adds a device-writable buffer.
    fn add_inbuf(&self, buf: QueueBuffer) -> Result<(), QueueError>;
    /// Notifies the device. Returns `false` if the notification was not delivered.
    fn kick(&self) -> bool;
    /// Takes the next completed buffer with the number of bytes the device wrote.
    fn get_buf(&self) -> Option<(QueueBuffer, usize)>;
}

/// Interrupt-context completion callback installed on a virtqueue.
pub type VqCallback = Arc<dyn Fn() + Send + Sync>;

/// Errors raised while setting up a device's queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VirtioError {
    #[error("virtqueue not found")]
    QueueNotFound,
    #[error("device rejected queue setup ({0})")]
    Setup(i32),
}

/// A discovered virtio device.
pub trait VirtioDevice: Send + Sync {
    /// Virtio device id (e.g. 33 for NSM).
    fn device_id(&self) -> u32;
    /// Initialises the single queue `name`, installing `callback` for completions.
    fn find_single_vq(&self, name: &str, callback: VqCallback) -> Result<(), VirtioError>;
    /// First initialised queue, if any.
    fn primary_vq(&self) -> Option<Arc<dyn Virtqueue>>;
    /// Tears down every queue of the device.
    fn del_vqs(&self);
}

/// Hardware random number provider.
pub trait HwRng {
    fn name(&self) -> &str;
    /// Entropy estimate per 1024 bits.
    fn quality(&self) -> u16;
    /// Fills up to `data.len()` bytes. Returns the count written or a negative errno.
    fn read(&self, data: &mut [u8], wait: bool) -> i32;
}
