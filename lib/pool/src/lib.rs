// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Forge worker pool
//!
//! Reserves execution cores on a fleet of build workers — one local worker
//! plus any number of remote workers discovered on the local network — and
//! streams task execution over those reservations. The scheduling core is
//! the [`fulfiller::Fulfiller`] reconciliation loop, which matches demand
//! for cores against an unreliable, dynamically-changing supply using
//! speculative forward reservation.

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod client;
pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod fulfiller;
pub mod logging;
pub mod observer;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stream_buffer;
pub mod subpool;
pub mod worker;

pub use client::{TcpWorkerClient, WorkerClient, WorkerStream};
pub use config::{LocalWorkerConfig, PoolConfig, PoolTunables};
pub use crate::core::{Core, CoreProvider};
pub use error::{ErrorKind, PoolError};
pub use pool::{AllocationPreference, CoreLease, WorkerPool};
pub use protocol::{CoreAssignment, TaskOutput, TaskSpec};
pub use server::{TaskExecutor, WorkerServer};
pub use stream_buffer::StreamBuffer;
pub use tokio_util::sync::CancellationToken;
pub use worker::Worker;
