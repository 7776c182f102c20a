// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker-side protocol server.
//!
//! Accepts framed TCP connections, answers reachability pings, and serves
//! reservation streams against a fixed core capacity. Task execution
//! behind a reserved core is delegated to a [`TaskExecutor`]; the actual
//! compiler invocation lives outside this crate.

use crate::protocol::{CoreAssignment, FrameCodec, TaskOutput, TaskSpec, WorkerRequest, WorkerResponse};
use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Executes one task on behalf of a reserved core.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, spec: TaskSpec) -> TaskOutput;
}

/// Free-list of core indices; one reservation holds one index.
struct SlotPool {
    free: Mutex<Vec<u32>>,
}

impl SlotPool {
    fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..capacity).rev().collect()),
        })
    }

    fn acquire(&self) -> Option<u32> {
        self.free.lock().pop()
    }

    fn release(&self, slot: u32) {
        self.free.lock().push(slot);
    }
}

/// A worker process serving reservation streams.
pub struct WorkerServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerServer {
    /// Binds and starts accepting. `capacity` bounds concurrently
    /// reserved cores; further reservations are rejected.
    pub async fn bind(
        addr: SocketAddr,
        machine_name: impl Into<String>,
        capacity: u32,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let machine_name = machine_name.into();
        let cancel = CancellationToken::new();
        let slots = SlotPool::new(capacity);

        let accept_cancel = cancel.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "worker accepted connection");
                        let machine_name = machine_name.clone();
                        let slots = slots.clone();
                        let executor = executor.clone();
                        let conn_cancel = accept_cancel.child_token();
                        tokio::spawn(async move {
                            handle_connection(stream, machine_name, slots, executor, conn_cancel)
                                .await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("worker accept failed: {}", e);
                    }
                }
            }
        });

        tracing::info!(%local_addr, capacity, "worker server listening");
        Ok(Self {
            local_addr,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_connection(
    stream: TcpStream,
    machine_name: String,
    slots: Arc<SlotPool>,
    executor: Arc<dyn TaskExecutor>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, FrameCodec::<WorkerRequest>::new());
    let mut writer = FramedWrite::new(write_half, FrameCodec::<WorkerResponse>::new());
    let mut reserved: Option<u32> = None;

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = reader.next() => request,
        };
        let request = match request {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                tracing::debug!("worker stream decode failed: {}", e);
                break;
            }
            // Client half-closed: the reservation (if any) is released.
            None => break,
        };

        let response = match request {
            WorkerRequest::Ping => WorkerResponse::Pong,
            WorkerRequest::ReserveCore => {
                if reserved.is_some() {
                    WorkerResponse::Rejected {
                        reason: "stream already holds a core".to_string(),
                    }
                } else {
                    match slots.acquire() {
                        Some(core_number) => {
                            reserved = Some(core_number);
                            WorkerResponse::CoreAssigned(CoreAssignment {
                                machine_name: machine_name.clone(),
                                core_number,
                                assignment_id: Uuid::new_v4(),
                            })
                        }
                        None => WorkerResponse::Rejected {
                            reason: "no free cores".to_string(),
                        },
                    }
                }
            }
            WorkerRequest::Task(spec) => {
                if reserved.is_none() {
                    WorkerResponse::Rejected {
                        reason: "no core reserved on this stream".to_string(),
                    }
                } else {
                    WorkerResponse::TaskOutput(executor.execute(spec).await)
                }
            }
        };

        if let Err(e) = writer.send(response).await {
            tracing::debug!("worker stream write failed: {}", e);
            break;
        }
    }

    if let Some(core_number) = reserved {
        slots.release(core_number);
    }
}
