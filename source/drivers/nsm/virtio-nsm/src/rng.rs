// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware RNG bridge: a fixed GetRandom request and extraction of the
//! returned byte array.
//!
//! SECURITY: random bytes are never logged, only their count.

use std::sync::Arc;

use log::{debug, error};
use nexus_hal::HwRng;

use crate::cbor::{self, CborError};
use crate::config::NSM_RESPONSE_MAX_SIZE;
use crate::driver::{NsmDriver, Wait};
use crate::error::{NsmError, Result};
use crate::message::KernelMessage;

/// `"GetRandom"` as a CBOR text string.
pub const GET_RANDOM_REQUEST: &[u8] = &[0x69, b'G', b'e', b't', b'R', b'a', b'n', b'd', b'o', b'm'];

/// `{"GetRandom": {"random": ...` up to the byte array holding the output.
pub const GET_RANDOM_RESPONSE_HEADER: &[u8] = &[
    0xA1, 0x69, b'G', b'e', b't', b'R', b'a', b'n', b'd', b'o', b'm', // map(1), "GetRandom"
    0xA1, 0x66, b'r', b'a', b'n', b'd', b'o', b'm', // map(1), "random"
];

/// Locates the random payload in a GetRandom response.
///
/// Error replies from the device carry a different header and fail here.
pub fn extract_random(response: &[u8]) -> Result<&[u8]> {
    if response.len() <= GET_RANDOM_RESPONSE_HEADER.len() {
        error!("nsm rng: short response ({} bytes), possible error reply", response.len());
        return Err(NsmError::Fault);
    }
    let (header, body) = response.split_at(GET_RANDOM_RESPONSE_HEADER.len());
    if header != GET_RANDOM_RESPONSE_HEADER {
        error!("nsm rng: invalid response header, possible error reply");
        return Err(NsmError::Fault);
    }
    if !cbor::is_array(body) {
        error!("nsm rng: expected a byte array response");
        return Err(CborError::NotArray.into());
    }
    let array = cbor::get_array(body).inspect_err(|err| error!("nsm rng: invalid cbor encoding: {err}"))?;
    Ok(array.payload(body))
}

impl NsmDriver {
    /// Fills up to `data.len()` bytes with device randomness.
    ///
    /// Returns the number of bytes written, which may be fewer than requested.
    pub fn get_random(&self, data: &mut [u8], wait: Wait) -> Result<usize> {
        let mut session = self.acquire(wait)?;
        let mut message = KernelMessage::with_request(GET_RANDOM_REQUEST, NSM_RESPONSE_MAX_SIZE)?;
        session.exchange(&mut message)?;

        let response = message.response().ok_or(NsmError::InvalidArgument)?;
        let random = extract_random(response)?;

        let count = data.len().min(i32::MAX as usize).min(random.len());
        data[..count].copy_from_slice(&random[..count]);
        debug!("nsm rng: returning {count} random bytes");
        Ok(count)
    }
}

/// `nsm-hwrng` registration handed to the hwrng framework.
pub struct NsmRng {
    driver: Arc<NsmDriver>,
}

impl NsmRng {
    pub fn new(driver: Arc<NsmDriver>) -> Self {
        Self { driver }
    }
}

impl HwRng for NsmRng {
    fn name(&self) -> &str {
        &self.driver.config().hwrng_name
    }

    fn quality(&self) -> u16 {
        self.driver.config().hwrng_quality
    }

    fn read(&self, data: &mut [u8], wait: bool) -> i32 {
        match self.driver.get_random(data, Wait::from_hint(wait)) {
            Ok(count) => count as i32,
            Err(err) => err.errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{encode_array_header, encode_random_response};

    #[test]
    fn request_is_text_getrandom() {
        assert_eq!(GET_RANDOM_REQUEST[0], 0x60 | 9);
        assert_eq!(&GET_RANDOM_REQUEST[1..], b"GetRandom");
        assert_eq!(GET_RANDOM_RESPONSE_HEADER.len(), 19);
    }

    #[test]
    fn extracts_payload() {
        let reply = encode_random_response(&[5; 40]);
        assert_eq!(extract_random(&reply).unwrap(), &[5u8; 40][..]);
    }

    #[test]
    fn header_only_is_short() {
        assert_eq!(extract_random(GET_RANDOM_RESPONSE_HEADER), Err(NsmError::Fault));
    }

    #[test]
    fn error_reply_is_rejected() {
        // {"Error": "InvalidOperation"}
        let mut reply = vec![0xA1, 0x65, b'E', b'r', b'r', b'o', b'r', 0x70];
        reply.extend_from_slice(b"InvalidOperation");
        assert_eq!(extract_random(&reply), Err(NsmError::Fault));
    }

    #[test]
    fn non_array_body_is_decode_error() {
        let mut reply = GET_RANDOM_RESPONSE_HEADER.to_vec();
        reply.push(0x01);
        assert_eq!(extract_random(&reply), Err(NsmError::Decode(CborError::NotArray)));
    }

    #[test]
    fn truncated_payload_is_decode_error() {
        let mut reply = GET_RANDOM_RESPONSE_HEADER.to_vec();
        reply.extend(encode_array_header(32));
        reply.extend([0u8; 16]);
        assert_eq!(extract_random(&reply), Err(NsmError::Decode(CborError::PayloadShort)));
    }
}
