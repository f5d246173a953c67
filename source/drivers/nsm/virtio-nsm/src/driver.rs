// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NSM driver state: access gate, active device slot, lifecycle
//! OWNERS: @runtime @security
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 unit tests + tests/lifecycle.rs
//!
//! The gate is a single mutex around the active device slot. Every exchange
//! and every device swap holds it, so at most one request is in flight and the
//! device cannot change under an exchange. The completion is shared with the
//! virtqueue callback, which runs without the gate.

use std::sync::Arc;

use log::{debug, error};
use nexus_hal::{VirtioDevice, VqCallback};
use nexus_sync::Completion;
use parking_lot::{Mutex, MutexGuard};

use crate::config::NsmConfig;
use crate::error::{NsmError, Result};
use crate::message::KernelMessage;
use crate::transport;

/// How to acquire the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Sleep until the gate is free.
    Blocking,
    /// Fail with [`NsmError::Busy`] if an exchange is in flight.
    NonBlocking,
}

impl Wait {
    pub fn from_hint(may_block: bool) -> Self {
        if may_block {
            Wait::Blocking
        } else {
            Wait::NonBlocking
        }
    }
}

#[derive(Default)]
struct Channel {
    device: Option<Arc<dyn VirtioDevice>>,
}

fn same_device(a: &Arc<dyn VirtioDevice>, b: &Arc<dyn VirtioDevice>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Driver instance. One per NSM misc device.
pub struct NsmDriver {
    config: NsmConfig,
    gate: Mutex<Channel>,
    completion: Arc<Completion>,
}

/// Exclusive access to the device for one exchange.
pub struct Session<'a> {
    channel: MutexGuard<'a, Channel>,
    driver: &'a NsmDriver,
}

impl Session<'_> {
    /// Runs one exchange on the active device's primary queue.
    pub fn exchange(&mut self, message: &mut KernelMessage) -> Result<()> {
        let device = self.channel.device.as_ref().ok_or(NsmError::NoDevice)?;
        let vq = device.primary_vq().ok_or(NsmError::NoDevice)?;
        transport::exchange(
            vq.as_ref(),
            &self.driver.completion,
            message,
            self.driver.config.response_timeout(),
        )
    }
}

impl NsmDriver {
    pub fn new(config: NsmConfig) -> Self {
        Self { config, gate: Mutex::new(Channel::default()), completion: Arc::new(Completion::new()) }
    }

    pub fn config(&self) -> &NsmConfig {
        &self.config
    }

    pub fn acquire(&self, wait: Wait) -> Result<Session<'_>> {
        let channel = match wait {
            Wait::Blocking => self.gate.lock(),
            Wait::NonBlocking => self.gate.try_lock().ok_or(NsmError::Busy)?,
        };
        Ok(Session { channel, driver: self })
    }

    /// Sends a driver-built message to the device.
    pub fn exchange(&self, message: &mut KernelMessage, wait: Wait) -> Result<()> {
        self.acquire(wait)?.exchange(message)
    }

    /// Whether a device is bound. Waits for any in-flight exchange.
    pub fn is_bound(&self) -> bool {
        self.gate.lock().device.is_some()
    }

    /// Binds a newly discovered device.
    pub fn probe(&self, dev: Arc<dyn VirtioDevice>) -> Result<()> {
        if dev.device_id() != self.config.virtio_device_id {
            error!("nsm: refusing device id {}", dev.device_id());
            return Err(NsmError::NoDevice);
        }
        match self.update_device(Some(dev)) {
            Ok(()) => {
                debug!("nsm: device probed");
                Ok(())
            }
            Err(err) => {
                error!("nsm: device probing failed: {}", err.errno());
                Err(err)
            }
        }
    }

    /// Unbinds `dev` if it is the active device.
    pub fn remove(&self, dev: &Arc<dyn VirtioDevice>) {
        let mut channel = self.gate.lock();
        let active = channel.device.as_ref().is_some_and(|cur| same_device(cur, dev));
        if !active {
            error!("nsm: invalid device to remove");
            return;
        }
        match self.swap_device(&mut channel, None) {
            Ok(()) => debug!("nsm: device removed"),
            Err(err) => error!("nsm: device could not be removed: {}", err.errno()),
        }
    }

    /// Re-binds after a configuration change.
    pub fn config_changed(&self, dev: Arc<dyn VirtioDevice>) {
        match self.update_device(Some(dev)) {
            Ok(()) => debug!("nsm: device configuration changed"),
            Err(err) => error!("nsm: device configuration change failed: {}", err.errno()),
        }
    }

    /// Swaps the active device. No-op when `dev` is already active; the old
    /// device's queues are torn down before the new queue is set up.
    fn update_device(&self, dev: Option<Arc<dyn VirtioDevice>>) -> Result<()> {
        let mut channel = self.gate.lock();
        self.swap_device(&mut channel, dev)
    }

    fn swap_device(&self, channel: &mut Channel, dev: Option<Arc<dyn VirtioDevice>>) -> Result<()> {
        let unchanged = match (&channel.device, &dev) {
            (Some(cur), Some(new)) => same_device(cur, new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        if let Some(old) = channel.device.take() {
            old.del_vqs();
        }

        if let Some(new) = dev {
            if let Err(err) = new.find_single_vq(&self.config.queue_name, self.callback()) {
                error!("nsm: device queue failed to initialize: {err}");
                return Err(err.into());
            }
            channel.device = Some(new);
        }
        Ok(())
    }

    fn callback(&self) -> VqCallback {
        let completion = Arc::clone(&self.completion);
        Arc::new(move || {
            if !completion.signal() {
                debug!("nsm: spurious virtqueue callback");
            }
        })
    }
}
