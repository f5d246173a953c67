// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Driver configuration: registration identity and the response timeout.
//!
//! Loaded once when the driver is constructed. Callers of the ioctl and
//! hwrng paths cannot change any of it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest request accepted from a caller.
pub const NSM_REQUEST_MAX_SIZE: usize = 0x1000;
/// Largest response buffer the driver allocates. Larger caller buffers are clamped.
pub const NSM_RESPONSE_MAX_SIZE: usize = 0x3000;
/// Default time to wait for the device to complete an exchange.
pub const NSM_DEFAULT_TIMEOUT_MSECS: u64 = 120_000;

/// Upper bound of the hwrng quality scale.
const HWRNG_QUALITY_MAX: u16 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NsmConfig {
    /// Misc device node name.
    pub device_name: String,
    pub device_minor: u32,
    /// Virtio device id the driver binds to.
    pub virtio_device_id: u32,
    pub queue_name: String,
    pub hwrng_name: String,
    pub hwrng_quality: u16,
    pub response_timeout_ms: u64,
}

impl Default for NsmConfig {
    fn default() -> Self {
        Self {
            device_name: "nsm".into(),
            device_minor: 147,
            virtio_device_id: 33,
            queue_name: "nsm.vq.0".into(),
            hwrng_name: "nsm-hwrng".into(),
            hwrng_quality: 1000,
            response_timeout_ms: NSM_DEFAULT_TIMEOUT_MSECS,
        }
    }
}

impl NsmConfig {
    /// Parses and validates a JSON config. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: NsmConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Invalid("device_name is empty"));
        }
        if self.queue_name.is_empty() {
            return Err(ConfigError::Invalid("queue_name is empty"));
        }
        if self.hwrng_name.is_empty() {
            return Err(ConfigError::Invalid("hwrng_name is empty"));
        }
        if self.hwrng_quality > HWRNG_QUALITY_MAX {
            return Err(ConfigError::Invalid("hwrng_quality above 1024"));
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("response_timeout_ms is zero"));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_registration() {
        let cfg = NsmConfig::default();
        assert_eq!(cfg.device_minor, 147);
        assert_eq!(cfg.virtio_device_id, 33);
        assert_eq!(cfg.queue_name, "nsm.vq.0");
        assert_eq!(cfg.response_timeout(), Duration::from_secs(120));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = NsmConfig::from_json(r#"{ "response_timeout_ms": 250 }"#).unwrap();
        assert_eq!(cfg.response_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.hwrng_name, "nsm-hwrng");
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = NsmConfig::from_json(r#"{ "response_timeout_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = NsmConfig::from_json(r#"{ "timeout": 5 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_quality_out_of_range() {
        let err = NsmConfig::from_json(r#"{ "hwrng_quality": 2000 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
