// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process NSM device and user address space for host testing
//!
//! PUBLIC API:
//!   - SimUserMemory: sparse caller address space with mapped regions
//!   - SimDevice: virtio NSM device answering through a responder closure
//!   - SimQueue: the device's single virtqueue
//!   - Behavior: how the device treats submitted buffers
//!   - encode_random_response(): well-formed GetRandom reply
//!
//! Completions are delivered from the kicking thread, or from a worker thread
//! when a latency is configured, mirroring an interrupt arriving later.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nexus_hal::{
    CopyFault, QueueBuffer, QueueError, UserAddr, UserMemory, VirtioDevice, VirtioError, Virtqueue,
    VqCallback,
};
use parking_lot::Mutex;

use crate::rng::GET_RANDOM_RESPONSE_HEADER;

const USER_BASE: u64 = 0x1000_0000;
const USER_PAGE: u64 = 0x1000;
const QUEUE_SIZE: usize = 8;
const NSM_DEVICE_ID: u32 = 33;

/// Caller address space made of disjoint mapped regions.
#[derive(Debug)]
pub struct SimUserMemory {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: Mutex<u64>,
}

impl Default for SimUserMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimUserMemory {
    pub fn new() -> Self {
        Self { regions: Mutex::new(BTreeMap::new()), next: Mutex::new(USER_BASE) }
    }

    /// Maps a copy of `bytes` and returns its address.
    pub fn map(&self, bytes: &[u8]) -> UserAddr {
        let mut next = self.next.lock();
        let base = *next;
        // leave an unmapped guard page between regions
        let pages = (bytes.len() as u64).div_ceil(USER_PAGE) + 1;
        *next += pages * USER_PAGE;
        self.regions.lock().insert(base, bytes.to_vec());
        UserAddr(base)
    }

    /// Maps `len` zeroed bytes.
    pub fn alloc(&self, len: usize) -> UserAddr {
        self.map(&vec![0; len])
    }

    /// Reads back `len` bytes. Panics if the range is not mapped.
    pub fn read(&self, addr: UserAddr, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.copy_from_user(&mut out, addr).expect("range is mapped");
        out
    }

    fn with_range<R>(
        &self,
        addr: UserAddr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, CopyFault> {
        let fault = CopyFault { addr: addr.0, len };
        let mut regions = self.regions.lock();
        let (&base, region) = regions.range_mut(..=addr.0).next_back().ok_or(fault)?;
        let start = (addr.0 - base) as usize;
        let end = start.checked_add(len).ok_or(fault)?;
        let chunk = region.get_mut(start..end).ok_or(fault)?;
        Ok(f(chunk))
    }
}

impl UserMemory for SimUserMemory {
    fn copy_from_user(&self, dst: &mut [u8], src: UserAddr) -> Result<(), CopyFault> {
        if dst.is_empty() {
            return Ok(());
        }
        self.with_range(src, dst.len(), |chunk| dst.copy_from_slice(chunk))
    }

    fn copy_to_user(&self, dst: UserAddr, src: &[u8]) -> Result<(), CopyFault> {
        if src.is_empty() {
            return Ok(());
        }
        self.with_range(dst, src.len(), |chunk| chunk.copy_from_slice(src))
    }
}

/// Maps a request payload to the bytes the device writes back.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// What the device does with buffers when kicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Complete request then response.
    Respond,
    /// Consume the buffers and never complete.
    Swallow,
    /// Refuse the notification.
    RejectKick,
    /// Complete response first, then request.
    Reorder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Request buffers added to the queue.
    pub submitted: usize,
    /// Exchanges completed back to the driver.
    pub served: usize,
    /// Highest number of exchanges outstanding at once.
    pub max_outstanding: usize,
    /// Queue teardowns.
    pub teardowns: usize,
}

struct Settings {
    responder: Responder,
    behavior: Mutex<Behavior>,
    latency: Mutex<Option<Duration>>,
    stats: Mutex<SimStats>,
}

enum Slot {
    Out(QueueBuffer),
    In(QueueBuffer),
}

#[derive(Default)]
struct Ring {
    avail: VecDeque<Slot>,
    used: VecDeque<(QueueBuffer, usize)>,
    outstanding: usize,
}

struct QueueCore {
    settings: Arc<Settings>,
    ring: Mutex<Ring>,
    callback: VqCallback,
}

impl QueueCore {
    fn take_pairs(&self) -> Vec<(QueueBuffer, QueueBuffer)> {
        let mut ring = self.ring.lock();
        let mut pairs = Vec::new();
        while ring.avail.len() >= 2 {
            match (ring.avail.pop_front(), ring.avail.pop_front()) {
                (Some(Slot::Out(req)), Some(Slot::In(rsp))) => pairs.push((req, rsp)),
                _ => ring.outstanding = ring.outstanding.saturating_sub(1),
            }
        }
        pairs
    }

    fn complete(&self, pairs: Vec<(QueueBuffer, QueueBuffer)>, behavior: Behavior) {
        if pairs.is_empty() {
            return;
        }
        {
            let mut ring = self.ring.lock();
            for (req, mut rsp) in pairs {
                let reply = (self.settings.responder)(req.as_slice());
                let written = reply.len().min(rsp.len());
                rsp.as_mut_slice()[..written].copy_from_slice(&reply[..written]);
                if behavior == Behavior::Reorder {
                    ring.used.push_back((rsp, written));
                    ring.used.push_back((req, 0));
                } else {
                    ring.used.push_back((req, 0));
                    ring.used.push_back((rsp, written));
                }
                ring.outstanding = ring.outstanding.saturating_sub(1);
                self.settings.stats.lock().served += 1;
            }
        }
        (self.callback)();
    }
}

/// The single virtqueue of a [`SimDevice`].
pub struct SimQueue {
    core: Arc<QueueCore>,
}

impl Virtqueue for SimQueue {
    fn add_outbuf(&self, buf: QueueBuffer) -> Result<(), QueueError> {
        let mut ring = self.core.ring.lock();
        if ring.avail.len() >= QUEUE_SIZE {
            return Err(QueueError::NoSpace);
        }
        ring.avail.push_back(Slot::Out(buf));
        ring.outstanding += 1;
        let mut stats = self.core.settings.stats.lock();
        stats.submitted += 1;
        stats.max_outstanding = stats.max_outstanding.max(ring.outstanding);
        Ok(())
    }

    fn add_inbuf(&self, buf: QueueBuffer) -> Result<(), QueueError> {
        let mut ring = self.core.ring.lock();
        if ring.avail.len() >= QUEUE_SIZE {
            return Err(QueueError::NoSpace);
        }
        ring.avail.push_back(Slot::In(buf));
        Ok(())
    }

    fn kick(&self) -> bool {
        let behavior = *self.core.settings.behavior.lock();
        match behavior {
            Behavior::RejectKick => false,
            Behavior::Swallow => {
                let swallowed = self.core.take_pairs();
                let mut ring = self.core.ring.lock();
                ring.outstanding = ring.outstanding.saturating_sub(swallowed.len());
                true
            }
            Behavior::Respond | Behavior::Reorder => {
                let pairs = self.core.take_pairs();
                let latency = *self.core.settings.latency.lock();
                match latency {
                    Some(delay) => {
                        let core = Arc::clone(&self.core);
                        thread::spawn(move || {
                            thread::sleep(delay);
                            core.complete(pairs, behavior);
                        });
                    }
                    None => self.core.complete(pairs, behavior),
                }
                true
            }
        }
    }

    fn get_buf(&self) -> Option<(QueueBuffer, usize)> {
        self.core.ring.lock().used.pop_front()
    }
}

/// Emulated NSM virtio device.
pub struct SimDevice {
    settings: Arc<Settings>,
    queue: Mutex<Option<Arc<SimQueue>>>,
    setup_error: Mutex<Option<VirtioError>>,
}

impl SimDevice {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        Self {
            settings: Arc::new(Settings {
                responder: Arc::new(responder),
                behavior: Mutex::new(Behavior::Respond),
                latency: Mutex::new(None),
                stats: Mutex::new(SimStats::default()),
            }),
            queue: Mutex::new(None),
            setup_error: Mutex::new(None),
        }
    }

    /// Device answering every request with `random` as GetRandom output.
    pub fn random_source(random: Vec<u8>) -> Self {
        let reply = encode_random_response(&random);
        Self::new(move |_| reply.clone())
    }

    /// Completes exchanges from a worker thread after `delay`.
    pub fn with_latency(self, delay: Duration) -> Self {
        self.set_latency(Some(delay));
        self
    }

    pub fn set_latency(&self, delay: Option<Duration>) {
        *self.settings.latency.lock() = delay;
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.settings.behavior.lock() = behavior;
    }

    /// Makes the next `find_single_vq` fail with `err`.
    pub fn fail_queue_setup(&self, err: VirtioError) {
        *self.setup_error.lock() = Some(err);
    }

    pub fn stats(&self) -> SimStats {
        *self.settings.stats.lock()
    }

    pub fn has_queue(&self) -> bool {
        self.queue.lock().is_some()
    }
}

impl VirtioDevice for SimDevice {
    fn device_id(&self) -> u32 {
        NSM_DEVICE_ID
    }

    fn find_single_vq(&self, _name: &str, callback: VqCallback) -> Result<(), VirtioError> {
        if let Some(err) = self.setup_error.lock().take() {
            return Err(err);
        }
        let core = QueueCore {
            settings: Arc::clone(&self.settings),
            ring: Mutex::new(Ring::default()),
            callback,
        };
        *self.queue.lock() = Some(Arc::new(SimQueue { core: Arc::new(core) }));
        Ok(())
    }

    fn primary_vq(&self) -> Option<Arc<dyn Virtqueue>> {
        self.queue.lock().as_ref().map(|q| Arc::clone(q) as Arc<dyn Virtqueue>)
    }

    fn del_vqs(&self) {
        if self.queue.lock().take().is_some() {
            self.settings.stats.lock().teardowns += 1;
        }
    }
}

/// Definite-length CBOR byte string header for `len`.
pub fn encode_array_header(len: usize) -> Vec<u8> {
    let len = len as u64;
    match len {
        0..=23 => vec![0x40 | len as u8],
        24..=0xff => vec![0x58, len as u8],
        0x100..=0xffff => [&[0x59][..], &(len as u16).to_be_bytes()[..]].concat(),
        0x1_0000..=0xffff_ffff => [&[0x5a][..], &(len as u32).to_be_bytes()[..]].concat(),
        _ => [&[0x5b][..], &len.to_be_bytes()[..]].concat(),
    }
}

/// `{"GetRandom": {"random": bytes}}` as the device encodes it.
pub fn encode_random_response(random: &[u8]) -> Vec<u8> {
    let mut out = GET_RANDOM_RESPONSE_HEADER.to_vec();
    out.extend(encode_array_header(random.len()));
    out.extend_from_slice(random);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_memory_faults_on_guard_page() {
        let mem = SimUserMemory::new();
        let a = mem.map(&[1, 2, 3, 4]);
        let mut buf = [0u8; 5];
        assert!(mem.copy_from_user(&mut buf, a).is_err());
        assert!(mem.copy_to_user(a.offset(2).unwrap(), &[9, 9]).is_ok());
        assert_eq!(mem.read(a, 4), vec![1, 2, 9, 9]);
        assert!(mem.copy_from_user(&mut buf, UserAddr(0x10)).is_err());
    }

    #[test]
    fn random_response_layout() {
        let reply = encode_random_response(&[0xaa; 30]);
        assert_eq!(&reply[..GET_RANDOM_RESPONSE_HEADER.len()], GET_RANDOM_RESPONSE_HEADER);
        assert_eq!(reply[GET_RANDOM_RESPONSE_HEADER.len()], 0x58);
        assert_eq!(reply.len(), GET_RANDOM_RESPONSE_HEADER.len() + 2 + 30);
    }

    #[test]
    fn del_vqs_counts_teardown_once() {
        let dev = SimDevice::new(|_| Vec::new());
        dev.find_single_vq("q", Arc::new(|| {})).unwrap();
        assert!(dev.has_queue());
        dev.del_vqs();
        dev.del_vqs();
        assert!(!dev.has_queue());
        assert_eq!(dev.stats().teardowns, 1);
    }
}
