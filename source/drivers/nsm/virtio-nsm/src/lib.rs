// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: VirtIO driver for the Nitro Secure Module (NSM) attestation/RNG device
//! OWNERS: @runtime @security
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests per module + tests/{scenarios,ioctl,lifecycle}.rs
//!
//! PUBLIC API:
//!   - NsmDriver: gate, device lifecycle, ioctl and RNG entry points
//!   - NsmRng: hwrng provider backed by the device's GetRandom command
//!   - KernelMessage / NsmMessage: bounded request/response marshalling
//!   - cbor::{is_array, get_array}: byte-array header decoding
//!   - NsmConfig: registration identity and response timeout
//!   - loopback: in-process device and user memory for host tests
//!
//! DEPENDENCIES:
//!   - nexus-hal::{UserMemory, Virtqueue, VirtioDevice, HwRng}
//!   - nexus-sync::Completion: interrupt -> waiter wake
//!   - parking_lot, log, thiserror, serde/serde_json
//!
//! SECURITY INVARIANTS:
//!   - Requests are bounded to NSM_REQUEST_MAX_SIZE, responses to NSM_RESPONSE_MAX_SIZE
//!   - Caller memory is only touched through UserMemory copies
//!   - At most one exchange is in flight on the device queue
//!   - Random bytes MUST NOT be logged

#![forbid(unsafe_code)]

pub mod cbor;
pub mod config;
pub mod driver;
pub mod error;
pub mod ioctl;
pub mod loopback;
pub mod message;
pub mod rng;
pub mod transport;

pub use config::{NsmConfig, NSM_REQUEST_MAX_SIZE, NSM_RESPONSE_MAX_SIZE};
pub use driver::{NsmDriver, Session, Wait};
pub use error::{NsmError, Result};
pub use ioctl::NSM_IO_REQUEST;
pub use message::{IoVec, KernelMessage, NsmMessage};
pub use rng::NsmRng;
