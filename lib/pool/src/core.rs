// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A reserved execution core and the provider that obtains one.
//!
//! A [`Core`] is a live slot on a worker, backed by one bidirectional
//! stream. A [`CoreProvider`] knows how to open a reservation attempt
//! against exactly one worker and produce a core; the pool treats local
//! and remote workers through this one capability interface.

use crate::client::WorkerStream;
use crate::error::PoolError;
use crate::observer::{ObserverList, SubscriptionId};
use crate::protocol::{CoreAssignment, TaskOutput, TaskSpec, WorkerRequest, WorkerResponse};
use crate::stream_buffer::StreamBuffer;
use crate::worker::Worker;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Broadcast when a provider's worker turns out to be gone or broken;
/// the owning collection evicts the provider in response.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub worker_id: String,
}

type DisposeHook = Box<dyn FnOnce(bool) + Send>;

/// A reserved execution slot.
///
/// The slot stays reserved on the worker for as long as the backing
/// stream is open; disposal half-closes the stream and releases the
/// worker-side bookkeeping exactly once, no matter how often (or how
/// concurrently) it is called.
pub struct Core {
    assignment: CoreAssignment,
    worker: Arc<Worker>,
    requests: Mutex<Option<tokio::sync::mpsc::Sender<WorkerRequest>>>,
    buffer: StreamBuffer<WorkerResponse>,
    end_subscription: SubscriptionId,
    alive: Arc<AtomicBool>,
    dead: Mutex<bool>,
    handed_out: AtomicBool,
    on_dispose: Mutex<Option<DisposeHook>>,
}

impl Core {
    fn new(
        assignment: CoreAssignment,
        worker: Arc<Worker>,
        requests: tokio::sync::mpsc::Sender<WorkerRequest>,
        buffer: StreamBuffer<WorkerResponse>,
        end_subscription: SubscriptionId,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            assignment,
            worker,
            requests: Mutex::new(Some(requests)),
            buffer,
            end_subscription,
            alive,
            dead: Mutex::new(false),
            handed_out: AtomicBool::new(false),
            on_dispose: Mutex::new(None),
        }
    }

    pub fn assignment(&self) -> &CoreAssignment {
        &self.assignment
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Advisory liveness probe: false once the backing stream has
    /// terminated. A core can die between this check and use; execution
    /// failure on a dead core is transient — re-request, don't panic.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Sends one request on the core's stream.
    pub async fn send(&self, request: WorkerRequest) -> Result<()> {
        let sender = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| PoolError::unavailable("core already released"))?;
        sender.send(request).await.map_err(|_| {
            anyhow::Error::new(PoolError::unavailable(format!(
                "stream to {} closed",
                self.assignment.machine_name
            )))
        })
    }

    /// Pulls the next response from the core's stream.
    pub async fn next_output(&mut self) -> Option<Result<WorkerResponse>> {
        self.buffer.next().await
    }

    /// Runs one task to completion over the reserved core.
    pub async fn run_task(&mut self, spec: TaskSpec) -> Result<TaskOutput> {
        self.send(WorkerRequest::Task(spec)).await?;
        match self.next_output().await {
            Some(Ok(WorkerResponse::TaskOutput(output))) => Ok(output),
            Some(Ok(other)) => Err(anyhow::Error::new(PoolError::malformed(format!(
                "expected task output from {}, got {:?}",
                self.assignment.machine_name, other
            )))),
            Some(Err(e)) => Err(e),
            None => Err(anyhow::Error::new(PoolError::unavailable(format!(
                "stream to {} ended mid-task",
                self.assignment.machine_name
            )))),
        }
    }

    /// Marks the core as handed out to a requester; its eventual disposal
    /// then also retires that requester's demand unit.
    pub(crate) fn mark_handed_out(&self) {
        self.handed_out.store(true, Ordering::Relaxed);
    }

    /// Installs the subpool-side bookkeeping hook, run exactly once on
    /// disposal with the handed-out flag.
    pub(crate) fn set_dispose_hook(&self, hook: DisposeHook) {
        *self.on_dispose.lock() = Some(hook);
    }

    /// Releases the core: half-closes the stream (best effort, errors
    /// swallowed), unregisters the termination callback, and decrements
    /// the owning worker's reservation bookkeeping exactly once.
    pub fn dispose(&self) {
        {
            let mut dead = self.dead.lock();
            if *dead {
                return;
            }
            *dead = true;
        }
        self.buffer.unsubscribe_end(self.end_subscription);
        self.buffer.dispose();
        // Dropping the sender closes the write half; the worker frees the
        // slot when it observes the close.
        self.requests.lock().take();
        self.worker.release_reservation(self.assignment.assignment_id);
        if let Some(hook) = self.on_dispose.lock().take() {
            hook(self.handed_out.load(Ordering::Relaxed));
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("machine_name", &self.assignment.machine_name)
            .field("core_number", &self.assignment.core_number)
            .field("assignment_id", &self.assignment.assignment_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Capability to reserve cores on one worker.
#[async_trait]
pub trait CoreProvider: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    fn worker(&self) -> &Arc<Worker>;

    /// Opens one reservation attempt. Exactly one terminal outcome:
    /// `Ok(core)`, or an error classifying as unavailable, malformed,
    /// or cancelled.
    async fn request_core(&self, cancel: &CancellationToken) -> Result<Core>;

    /// Registers a disconnect observer; broadcast order is unspecified.
    fn subscribe_disconnect(
        &self,
        callback: Box<dyn Fn(&Disconnected) + Send + Sync>,
    ) -> SubscriptionId;

    fn unsubscribe_disconnect(&self, id: SubscriptionId);
}

/// The one production provider, parameterized over the worker's client —
/// the local worker and remote workers differ only in transport.
pub struct WorkerCoreProvider {
    worker: Arc<Worker>,
    disconnects: Arc<ObserverList<Disconnected>>,
}

impl WorkerCoreProvider {
    pub fn new(worker: Arc<Worker>) -> Arc<Self> {
        Arc::new(Self {
            worker,
            disconnects: Arc::new(ObserverList::new()),
        })
    }

    fn notify_disconnected(&self) {
        self.disconnects.broadcast(&Disconnected {
            worker_id: self.worker.id().to_string(),
        });
    }
}

#[async_trait]
impl CoreProvider for WorkerCoreProvider {
    fn id(&self) -> &str {
        self.worker.id()
    }

    fn display_name(&self) -> &str {
        self.worker.display_name()
    }

    fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    async fn request_core(&self, cancel: &CancellationToken) -> Result<Core> {
        let WorkerStream {
            requests,
            responses,
        } = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(PoolError::cancelled("reservation attempt cancelled").into());
            }
            opened = self.worker.client().open_stream() => match opened {
                Ok(stream) => stream,
                Err(e) => {
                    self.worker.record_timeout();
                    self.notify_disconnected();
                    return Err(e.context(format!(
                        "could not reach worker {}",
                        self.worker.display_name()
                    )));
                }
            },
        };

        if requests.send(WorkerRequest::ReserveCore).await.is_err() {
            self.worker.record_timeout();
            self.notify_disconnected();
            return Err(PoolError::unavailable(format!(
                "worker {} closed before reservation request",
                self.worker.display_name()
            ))
            .into());
        }

        let mut buffer = StreamBuffer::start_observing(responses);

        let first = tokio::select! {
            _ = cancel.cancelled() => {
                buffer.dispose();
                return Err(PoolError::cancelled("reservation attempt cancelled").into());
            }
            item = buffer.next() => item,
        };

        match first {
            Some(Ok(WorkerResponse::CoreAssigned(assignment))) => {
                let alive = Arc::new(AtomicBool::new(true));
                let alive_cb = alive.clone();
                let disconnects = self.disconnects.clone();
                let worker_id = self.worker.id().to_string();
                // Disposal unsubscribes before half-closing, so this only
                // fires for terminations the pool did not initiate — the
                // worker failing or going away mid-reservation. Either
                // way the provider is broken; let the collection evict it.
                let subscription = buffer.subscribe_end(move |_end| {
                    alive_cb.store(false, Ordering::Relaxed);
                    disconnects.broadcast(&Disconnected {
                        worker_id: worker_id.clone(),
                    });
                });
                tracing::debug!(
                    worker = %self.worker.display_name(),
                    core = assignment.core_number,
                    assignment_id = %assignment.assignment_id,
                    "core reserved"
                );
                Ok(Core::new(
                    assignment,
                    self.worker.clone(),
                    requests,
                    buffer,
                    subscription,
                    alive,
                ))
            }
            Some(Ok(WorkerResponse::Rejected { reason })) => {
                buffer.dispose();
                self.worker.record_timeout();
                Err(PoolError::unavailable(format!(
                    "worker {} rejected reservation: {reason}",
                    self.worker.display_name()
                ))
                .into())
            }
            Some(Ok(other)) => {
                buffer.dispose();
                self.worker.record_timeout();
                self.notify_disconnected();
                Err(PoolError::malformed(format!(
                    "worker {} sent {:?} before a core assignment",
                    self.worker.display_name(),
                    other
                ))
                .into())
            }
            Some(Err(e)) => {
                self.worker.record_timeout();
                self.notify_disconnected();
                Err(e.context("reservation stream failed before confirmation"))
            }
            None => {
                self.worker.record_timeout();
                self.notify_disconnected();
                Err(PoolError::unavailable(format!(
                    "worker {} closed the stream before confirming",
                    self.worker.display_name()
                ))
                .into())
            }
        }
    }

    fn subscribe_disconnect(
        &self,
        callback: Box<dyn Fn(&Disconnected) + Send + Sync>,
    ) -> SubscriptionId {
        self.disconnects.subscribe(move |event| callback(event))
    }

    fn unsubscribe_disconnect(&self, id: SubscriptionId) {
        self.disconnects.unsubscribe(id);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::make_core;
    use super::*;

    fn test_core() -> (
        Core,
        Arc<Worker>,
        tokio::sync::mpsc::Sender<Result<WorkerResponse>>,
    ) {
        make_core(None)
    }

    #[tokio::test]
    async fn test_concurrent_dispose_decrements_once() {
        let (core, worker, _resp_tx) = test_core();
        assert_eq!(worker.active_reservations(), 1);

        let core = Arc::new(core);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let core = core.clone();
            handles.push(tokio::spawn(async move {
                core.dispose();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(worker.active_reservations(), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_flips_alive_flag() {
        let (core, _worker, resp_tx) = test_core();
        assert!(core.is_alive());

        resp_tx
            .send(Err(anyhow::anyhow!("transport unavailable")))
            .await
            .unwrap();
        drop(resp_tx);
        tokio::task::yield_now().await;

        assert!(!core.is_alive());
    }

    #[tokio::test]
    async fn test_dispose_hook_runs_once_with_handed_out_flag() {
        let (core, _worker, _resp_tx) = test_core();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_hook = ran.clone();
        core.set_dispose_hook(Box::new(move |handed_out| {
            assert!(handed_out);
            ran_hook.store(true, Ordering::SeqCst);
        }));
        core.mark_handed_out();
        core.dispose();
        core.dispose();
        assert!(ran.load(Ordering::SeqCst));
    }
}
