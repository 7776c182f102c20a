// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol for the reserve-and-execute stream.
//!
//! Every connection between the pool and a worker carries length-prefixed
//! JSON frames: a `u32` big-endian length followed by a serialized
//! [`WorkerRequest`] or [`WorkerResponse`]. The client sends
//! [`WorkerRequest::ReserveCore`] first; the server's first response on a
//! reservation stream must be [`WorkerResponse::CoreAssigned`] — anything
//! else, or stream termination before it arrives, is a failed
//! reservation. After confirmation the same stream multiplexes
//! task-execution request/response pairs until either side closes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Bumped on any incompatible wire or discovery change; part of the
/// advertised service name, so incompatible fleets never see each other.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames above this are treated as a protocol error (64 MB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Identity of one reserved execution slot, issued by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAssignment {
    /// Machine name of the worker backing the slot.
    pub machine_name: String,
    /// Core index on that worker, `0..capacity`.
    pub core_number: u32,
    /// Unique id for this assignment, distinct across all reservations.
    pub assignment_id: Uuid,
}

/// One compilation task to run on a reserved core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
}

/// Result of one task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Client → worker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Reserve one execution core on this stream.
    ReserveCore,
    /// Run a task on the core reserved by this stream.
    Task(TaskSpec),
    /// Reachability probe; answered with [`WorkerResponse::Pong`].
    Ping,
}

/// Worker → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Reservation confirmed; must be the first message on a
    /// reservation stream.
    CoreAssigned(CoreAssignment),
    /// Output of the most recent [`WorkerRequest::Task`].
    TaskOutput(TaskOutput),
    /// Answer to [`WorkerRequest::Ping`].
    Pong,
    /// Reservation declined (e.g. no free cores).
    Rejected { reason: String },
}

/// Length-prefixed JSON codec, usable for either message direction.
///
/// Wire format per frame:
/// - `len: u32` (big-endian)
/// - `body: len` bytes of JSON
pub struct FrameCodec<T> {
    max_frame: usize,
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            max_frame: MAX_FRAME_BYTES,
            _marker: PhantomData,
        }
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("failed to serialize frame: {e}"),
            )
        })?;
        if body.len() > self.max_frame {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes", body.len()),
            ));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds limit {}", self.max_frame),
            ));
        }
        if src.len() < 4 + len {
            // Wait for the rest of the frame.
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let body: Bytes = src.split_to(len).freeze();
        let item = serde_json::from_slice(&body).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to deserialize frame: {e}"),
            )
        })?;
        Ok(Some(item))
    }
}
