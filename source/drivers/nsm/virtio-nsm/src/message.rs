// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded message marshalling between a caller's address space and
//! driver-owned buffers.
//!
//! The external descriptor mirrors `struct nsm_message`: two `struct iovec`
//! (base, len) pairs, native endian, 32 bytes in total.

use log::debug;
use nexus_hal::{UserAddr, UserMemory};

use crate::config::{NSM_REQUEST_MAX_SIZE, NSM_RESPONSE_MAX_SIZE};
use crate::error::{NsmError, Result};

/// Size of one `struct iovec`.
const IOVEC_SIZE: usize = 16;
/// Size of the user descriptor.
pub const NSM_MESSAGE_SIZE: usize = 2 * IOVEC_SIZE;

/// A region in the caller's address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoVec {
    pub base: UserAddr,
    pub len: u64,
}

impl IoVec {
    pub fn new(base: UserAddr, len: u64) -> Self {
        Self { base, len }
    }

    fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.base.0.to_ne_bytes());
        out[8..IOVEC_SIZE].copy_from_slice(&self.len.to_ne_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        let mut base = [0u8; 8];
        let mut len = [0u8; 8];
        base.copy_from_slice(&raw[..8]);
        len.copy_from_slice(&raw[8..IOVEC_SIZE]);
        Self { base: UserAddr(u64::from_ne_bytes(base)), len: u64::from_ne_bytes(len) }
    }
}

/// Request/response descriptor as laid out by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NsmMessage {
    pub request: IoVec,
    pub response: IoVec,
}

impl NsmMessage {
    pub fn to_bytes(&self) -> [u8; NSM_MESSAGE_SIZE] {
        let mut raw = [0u8; NSM_MESSAGE_SIZE];
        self.request.encode(&mut raw[..IOVEC_SIZE]);
        self.response.encode(&mut raw[IOVEC_SIZE..]);
        raw
    }

    pub fn from_bytes(raw: &[u8; NSM_MESSAGE_SIZE]) -> Self {
        Self { request: IoVec::decode(&raw[..IOVEC_SIZE]), response: IoVec::decode(&raw[IOVEC_SIZE..]) }
    }

    /// Shallow copy of the descriptor at `addr`.
    pub fn read_from(user: &dyn UserMemory, addr: UserAddr) -> core::result::Result<Self, nexus_hal::CopyFault> {
        let mut raw = [0u8; NSM_MESSAGE_SIZE];
        user.copy_from_user(&mut raw, addr)?;
        Ok(Self::from_bytes(&raw))
    }

    pub fn write_to(&self, user: &dyn UserMemory, addr: UserAddr) -> core::result::Result<(), nexus_hal::CopyFault> {
        user.copy_to_user(addr, &self.to_bytes())
    }
}

/// Driver-side copies of one request and its response space.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageBuffers {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// Message owned by the driver for the duration of one exchange.
///
/// Either both buffers exist or neither does; dropping the message frees them.
#[derive(Debug, Default)]
pub struct KernelMessage {
    buffers: Option<MessageBuffers>,
}

fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| NsmError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

impl KernelMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a message from a request payload and a response capacity.
    ///
    /// The same bounds as [`KernelMessage::import`] apply.
    pub fn with_request(request: &[u8], response_capacity: usize) -> Result<Self> {
        if request.len() > NSM_REQUEST_MAX_SIZE {
            return Err(NsmError::MessageTooLarge);
        }
        let mut req = alloc_zeroed(request.len())?;
        req.copy_from_slice(request);
        let response = alloc_zeroed(response_capacity.min(NSM_RESPONSE_MAX_SIZE))?;
        Ok(Self { buffers: Some(MessageBuffers { request: req, response }) })
    }

    pub fn buffers(&self) -> Option<&MessageBuffers> {
        self.buffers.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_none()
    }

    pub fn request(&self) -> Option<&[u8]> {
        self.buffers.as_ref().map(|b| b.request.as_slice())
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.buffers.as_ref().map(|b| b.response.as_slice())
    }

    pub(crate) fn take_buffers(&mut self) -> Option<MessageBuffers> {
        self.buffers.take()
    }

    pub(crate) fn restore(&mut self, request: Vec<u8>, response: Vec<u8>) {
        self.buffers = Some(MessageBuffers { request, response });
    }

    /// Copies the descriptor at `src` and the request it points to into
    /// driver memory, allocating a response buffer of at most
    /// `NSM_RESPONSE_MAX_SIZE` bytes.
    ///
    /// Nothing stays allocated when this fails.
    pub fn import(&mut self, user: &dyn UserMemory, src: UserAddr) -> Result<()> {
        if src.is_null() || self.buffers.is_some() {
            return Err(NsmError::InvalidArgument);
        }

        let desc = NsmMessage::read_from(user, src).map_err(|_| NsmError::InvalidArgument)?;

        if desc.request.len > NSM_REQUEST_MAX_SIZE as u64 {
            return Err(NsmError::MessageTooLarge);
        }
        let mut request = alloc_zeroed(desc.request.len as usize)?;
        user.copy_from_user(&mut request, desc.request.base).map_err(|_| NsmError::Fault)?;

        let response_len = desc.response.len.min(NSM_RESPONSE_MAX_SIZE as u64) as usize;
        if (response_len as u64) < desc.response.len {
            debug!("nsm: clamping response buffer {} -> {}", desc.response.len, response_len);
        }
        let response = alloc_zeroed(response_len)?;

        self.buffers = Some(MessageBuffers { request, response });
        Ok(())
    }

    /// Writes the response back into the caller's response region and
    /// records how many bytes were written in the caller's descriptor.
    ///
    /// The request region is left as the caller supplied it.
    pub fn export(&self, user: &dyn UserMemory, dst: UserAddr) -> Result<()> {
        let buffers = self.buffers.as_ref().ok_or(NsmError::InvalidArgument)?;
        if dst.is_null() {
            return Err(NsmError::InvalidArgument);
        }

        let mut desc = NsmMessage::read_from(user, dst).map_err(|_| NsmError::Fault)?;
        let written = (buffers.response.len() as u64).min(desc.response.len);
        desc.response.len = written;

        user.copy_to_user(desc.response.base, &buffers.response[..written as usize])
            .map_err(|_| NsmError::Fault)?;
        desc.write_to(user, dst).map_err(|_| NsmError::Fault)
    }

    /// Frees both buffers. Safe to call on an already released message.
    pub fn release(&mut self) {
        self.buffers = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::SimUserMemory;
    use proptest::prelude::*;

    fn stage(mem: &SimUserMemory, request: &[u8], response_len: u64) -> (UserAddr, UserAddr) {
        let req = mem.map(request);
        let rsp = mem.alloc(response_len as usize);
        let desc = NsmMessage {
            request: IoVec::new(req, request.len() as u64),
            response: IoVec::new(rsp, response_len),
        };
        (mem.map(&desc.to_bytes()), rsp)
    }

    #[test]
    fn descriptor_layout_is_two_iovecs() {
        let desc = NsmMessage {
            request: IoVec::new(UserAddr(0x1000), 10),
            response: IoVec::new(UserAddr(0x2000), 20),
        };
        let raw = desc.to_bytes();
        assert_eq!(&raw[..8], &0x1000u64.to_ne_bytes());
        assert_eq!(&raw[24..], &20u64.to_ne_bytes());
        assert_eq!(NsmMessage::from_bytes(&raw), desc);
    }

    #[test]
    fn import_rejects_populated_destination() {
        let mem = SimUserMemory::new();
        let (desc, _) = stage(&mem, b"req", 16);
        let mut msg = KernelMessage::with_request(b"x", 1).unwrap();
        assert_eq!(msg.import(&mem, desc), Err(NsmError::InvalidArgument));
        assert_eq!(msg.request(), Some(&b"x"[..]));
    }

    #[test]
    fn import_rejects_null_and_unmapped_descriptor() {
        let mem = SimUserMemory::new();
        let mut msg = KernelMessage::new();
        assert_eq!(msg.import(&mem, UserAddr::NULL), Err(NsmError::InvalidArgument));
        assert_eq!(msg.import(&mem, UserAddr(0xdead_0000)), Err(NsmError::InvalidArgument));
        assert!(msg.is_empty());
    }

    #[test]
    fn import_oversized_request_allocates_nothing() {
        let mem = SimUserMemory::new();
        let (desc, _) = stage(&mem, &[0u8; NSM_REQUEST_MAX_SIZE + 1], 16);
        let mut msg = KernelMessage::new();
        assert_eq!(msg.import(&mem, desc), Err(NsmError::MessageTooLarge));
        assert!(msg.is_empty());
    }

    #[test]
    fn import_request_copy_fault_leaves_message_empty() {
        let mem = SimUserMemory::new();
        let desc = NsmMessage {
            request: IoVec::new(UserAddr(0x7777_0000), 8),
            response: IoVec::new(mem.alloc(8), 8),
        };
        let addr = mem.map(&desc.to_bytes());
        let mut msg = KernelMessage::new();
        assert_eq!(msg.import(&mem, addr), Err(NsmError::Fault));
        assert!(msg.is_empty());
    }

    #[test]
    fn export_writes_only_filled_response() {
        let mem = SimUserMemory::new();
        let (desc, rsp) = stage(&mem, b"hello", 64);
        let mut msg = KernelMessage::new();
        msg.import(&mem, desc).unwrap();

        let MessageBuffers { request, .. } = msg.take_buffers().unwrap();
        msg.restore(request, b"device says hi".to_vec());
        msg.export(&mem, desc).unwrap();

        let back = NsmMessage::read_from(&mem, desc).unwrap();
        assert_eq!(back.response.len, 14);
        assert_eq!(back.request.len, 5);
        assert_eq!(mem.read(rsp, 14), b"device says hi");
        assert_eq!(mem.read(rsp.offset(14).unwrap(), 50), vec![0u8; 50]);
    }

    #[test]
    fn export_without_buffers_is_invalid() {
        let mem = SimUserMemory::new();
        let (desc, _) = stage(&mem, b"x", 1);
        assert_eq!(KernelMessage::new().export(&mem, desc), Err(NsmError::InvalidArgument));
    }

    #[test]
    fn export_fault_on_unmapped_response() {
        let mem = SimUserMemory::new();
        let req = mem.map(b"abc");
        let desc = NsmMessage {
            request: IoVec::new(req, 3),
            response: IoVec::new(UserAddr(0x9999_0000), 8),
        };
        let addr = mem.map(&desc.to_bytes());
        let mut msg = KernelMessage::new();
        msg.import(&mem, addr).unwrap();
        assert_eq!(msg.export(&mem, addr), Err(NsmError::Fault));
    }

    #[test]
    fn release_is_idempotent() {
        let mut msg = KernelMessage::with_request(b"abc", 4).unwrap();
        msg.release();
        assert!(msg.is_empty());
        msg.release();
        assert!(msg.is_empty());
        KernelMessage::new().release();
    }

    proptest! {
        #[test]
        fn import_copies_bounded_requests_exactly(request in proptest::collection::vec(any::<u8>(), 0..=NSM_REQUEST_MAX_SIZE)) {
            let mem = SimUserMemory::new();
            let (desc, _) = stage(&mem, &request, 32);
            let mut msg = KernelMessage::new();
            msg.import(&mem, desc).unwrap();
            prop_assert_eq!(msg.request().unwrap(), request.as_slice());
        }

        #[test]
        fn response_capacity_is_clamped(declared in 0u64..(4 * NSM_RESPONSE_MAX_SIZE as u64)) {
            let mem = SimUserMemory::new();
            let req = mem.map(b"r");
            // Response region is never touched by import, so it need not be mapped.
            let desc = NsmMessage {
                request: IoVec::new(req, 1),
                response: IoVec::new(UserAddr(0x5000_0000), declared),
            };
            let addr = mem.map(&desc.to_bytes());
            let mut msg = KernelMessage::new();
            msg.import(&mem, addr).unwrap();
            let expected = declared.min(NSM_RESPONSE_MAX_SIZE as u64) as usize;
            prop_assert_eq!(msg.response().unwrap().len(), expected);
        }
    }
}
