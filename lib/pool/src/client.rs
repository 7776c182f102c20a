// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network client seam for talking to one worker.
//!
//! [`WorkerClient`] is the capability the rest of the pool programs
//! against; [`TcpWorkerClient`] is the production implementation, opening
//! one framed TCP connection per bidirectional stream.

use crate::error::PoolError;
use crate::protocol::{FrameCodec, WorkerRequest, WorkerResponse};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Outbound request buffer per stream (backpressure control).
const REQUEST_CHANNEL_BUFFER: usize = 32;

/// One open bidirectional stream to a worker.
///
/// Dropping `requests` closes the write half cleanly (half-close); the
/// response side keeps draining until the worker closes or fails.
pub struct WorkerStream {
    pub requests: mpsc::Sender<WorkerRequest>,
    pub responses: BoxStream<'static, Result<WorkerResponse>>,
}

/// Capability to open reservation streams against exactly one worker and
/// to probe its reachability.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Opens a fresh bidirectional stream.
    async fn open_stream(&self) -> Result<WorkerStream>;

    /// Bounded-deadline reachability probe.
    async fn ping(&self, deadline: Duration) -> Result<()>;
}

/// TCP-backed [`WorkerClient`].
#[derive(Debug, Clone)]
pub struct TcpWorkerClient {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpWorkerClient {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn configure_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        // Task frames are small and latency-sensitive; disable Nagle.
        let sock_ref = SockRef::from(stream);
        sock_ref.set_nodelay(true)?;
        Ok(())
    }
}

#[async_trait]
impl WorkerClient for TcpWorkerClient {
    async fn open_stream(&self) -> Result<WorkerStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                PoolError::timeout(format!("connect to {} timed out", self.addr))
            })?
            .map_err(|e| PoolError::unavailable(format!("connect to {} failed: {e}", self.addr)))?;

        Self::configure_socket(&stream)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut framed_write = FramedWrite::new(write_half, FrameCodec::<WorkerRequest>::new());

        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(REQUEST_CHANNEL_BUFFER);
        let addr = self.addr;
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(e) = framed_write.send(request).await {
                    tracing::debug!("write to {} failed: {}", addr, e);
                    return;
                }
            }
            // All senders dropped: best-effort clean half-close. The
            // worker may already be gone, so errors are swallowed.
            let _ = framed_write.close().await;
        });

        let responses = FramedRead::new(read_half, FrameCodec::<WorkerResponse>::new())
            .map(move |result| {
                result.map_err(|e| {
                    anyhow::Error::new(PoolError::unavailable(format!(
                        "stream from {addr} failed: {e}"
                    )))
                })
            })
            .boxed();

        Ok(WorkerStream {
            requests: tx,
            responses,
        })
    }

    async fn ping(&self, deadline: Duration) -> Result<()> {
        let probe = async {
            let stream = self.open_stream().await?;
            stream
                .requests
                .send(WorkerRequest::Ping)
                .await
                .map_err(|_| PoolError::unavailable(format!("{} closed before ping", self.addr)))?;
            let mut responses = stream.responses;
            match responses.next().await {
                Some(Ok(WorkerResponse::Pong)) => Ok(()),
                Some(Ok(other)) => Err(anyhow::Error::new(PoolError::malformed(format!(
                    "expected Pong from {}, got {:?}",
                    self.addr, other
                )))),
                Some(Err(e)) => Err(e),
                None => Err(anyhow::Error::new(PoolError::unavailable(format!(
                    "{} closed before answering ping",
                    self.addr
                )))),
            }
        };
        tokio::time::timeout(deadline, probe)
            .await
            .map_err(|_| PoolError::timeout(format!("ping to {} timed out", self.addr)))?
    }
}
