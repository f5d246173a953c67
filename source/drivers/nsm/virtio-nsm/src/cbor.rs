// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal CBOR decoding: recognise one byte-array header and return where
//! its payload lives. Nothing else of CBOR is parsed here.

use thiserror::Error;

/// Major type carried in the top 3 bits of the initial byte.
const CBOR_TYPE_ARRAY: u8 = 0x2;

const MINOR_MASK: u8 = 0x1f;
const SHORT_SIZE_MAX: u8 = 23;

/// Payload lengths are returned through a signed-length contract.
const ARRAY_LEN_MAX: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CborError {
    #[error("not a byte array")]
    NotArray,
    #[error("header truncated")]
    Truncated,
    #[error("payload shorter than declared length")]
    PayloadShort,
    #[error("declared length too large")]
    TooLarge,
    #[error("unsupported length encoding")]
    UnsupportedLength,
}

/// Location of an array payload inside the buffer it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayHeader {
    /// Header size; the payload starts here.
    pub offset: usize,
    pub len: usize,
}

impl ArrayHeader {
    /// Payload slice of `buf`, the buffer this header was decoded from.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.offset..self.offset + self.len]
    }
}

pub fn is_array(buf: &[u8]) -> bool {
    buf.first().is_some_and(|&b| (b >> 5) & 0x7 == CBOR_TYPE_ARRAY)
}

/// Header size and number of big-endian length bytes for a minor value.
fn length_encoding(minor: u8) -> Result<(usize, usize), CborError> {
    match minor {
        0..=SHORT_SIZE_MAX => Ok((1, 0)),
        24 => Ok((2, 1)),
        25 => Ok((3, 2)),
        26 => Ok((5, 4)),
        27 => Ok((9, 8)),
        _ => Err(CborError::UnsupportedLength),
    }
}

pub fn get_array(buf: &[u8]) -> Result<ArrayHeader, CborError> {
    if !is_array(buf) {
        return Err(CborError::NotArray);
    }
    let minor = buf[0] & MINOR_MASK;
    let (offset, width) = length_encoding(minor)?;
    if buf.len() < offset {
        return Err(CborError::Truncated);
    }

    let len = if width == 0 {
        u64::from(minor)
    } else {
        buf[1..offset].iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    };

    let len = bound_len(len, buf.len() - offset)?;
    Ok(ArrayHeader { offset, len })
}

/// Checks a decoded length against the bytes available after the header.
fn bound_len(len: u64, available: usize) -> Result<usize, CborError> {
    if (available as u64) < len {
        return Err(CborError::PayloadShort);
    }
    if len > ARRAY_LEN_MAX {
        return Err(CborError::TooLarge);
    }
    Ok(len as usize)
}
