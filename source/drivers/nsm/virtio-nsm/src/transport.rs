// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One request/response exchange over the NSM virtqueue.
//!
//! Submission order is fixed (request out, then response in) because
//! completions are matched positionally. Any failure after submission drains
//! the used ring so the next exchange starts clean.

use std::time::Duration;

use log::{debug, error};
use nexus_hal::{QueueBuffer, Virtqueue};
use nexus_sync::Completion;

use crate::error::{NsmError, Result};
use crate::message::{KernelMessage, MessageBuffers};

/// Sends `message` to the device and waits up to `timeout` for the reply.
///
/// On success the message holds the response, truncated to the number of
/// bytes the device wrote. On failure the message is left empty.
pub fn exchange(
    vq: &dyn Virtqueue,
    completion: &Completion,
    message: &mut KernelMessage,
    timeout: Duration,
) -> Result<()> {
    let usable = message
        .buffers()
        .is_some_and(|b| !b.request.is_empty() && !b.response.is_empty());
    if !usable {
        return Err(NsmError::InvalidArgument);
    }
    let Some(MessageBuffers { request, response }) = message.take_buffers() else {
        return Err(NsmError::InvalidArgument);
    };

    let request = QueueBuffer::new(request);
    let response = QueueBuffer::new(response);
    let (request_id, response_id) = (request.addr(), response.addr());

    vq.add_outbuf(request)?;

    let result = complete(vq, completion, response, timeout, request_id, response_id);
    match result {
        Ok((request, response)) => {
            message.restore(request, response);
            Ok(())
        }
        Err(err) => {
            drain(vq);
            Err(err)
        }
    }
}

fn complete(
    vq: &dyn Virtqueue,
    completion: &Completion,
    response: QueueBuffer,
    timeout: Duration,
    request_id: usize,
    response_id: usize,
) -> Result<(Vec<u8>, Vec<u8>)> {
    vq.add_inbuf(response)?;

    let ticket = completion.arm();
    if !vq.kick() {
        error!("nsm: failed to kick virtqueue");
        return Err(NsmError::Io);
    }

    if !completion.wait_timeout(ticket, timeout) {
        error!("nsm: device did not respond within {}ms", timeout.as_millis());
        return Err(NsmError::TimedOut);
    }

    let request = match vq.get_buf() {
        Some((buf, _)) if buf.addr() == request_id => buf,
        _ => {
            error!("nsm: device returned wrong request buffer");
            return Err(NsmError::Desync);
        }
    };
    let (response, written) = match vq.get_buf() {
        Some((buf, written)) if buf.addr() == response_id => (buf, written),
        _ => {
            error!("nsm: device returned wrong response buffer");
            return Err(NsmError::Desync);
        }
    };

    let mut response = response.into_inner();
    if written < response.len() {
        response.truncate(written);
    }
    Ok((request.into_inner(), response))
}

/// Discards every completed buffer still on the used ring.
pub(crate) fn drain(vq: &dyn Virtqueue) -> usize {
    let mut stale = 0;
    while vq.get_buf().is_some() {
        stale += 1;
    }
    if stale > 0 {
        debug!("nsm: drained {stale} stale completions");
    }
    stale
}
