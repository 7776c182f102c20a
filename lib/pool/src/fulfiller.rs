// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The reservation reconciliation loop.
//!
//! A [`Fulfiller`] continuously matches outstanding demand against the
//! supply of one worker collection, deciding how many speculative
//! reservation attempts to open or cancel. The pool runs one instance
//! over the single local worker and one over the dynamic remote
//! collection fed by discovery.
//!
//! The forward heuristic targets `(requested − reserved) ×
//! forward_multiplier` concurrent in-flight attempts. Remote reservation
//! latency is unpredictable while overlapping speculative attempts are
//! cheap, and a successful attempt beyond immediate demand is queued for
//! the next requester rather than discarded — over-provisioning only
//! shifts latency earlier.

use crate::core::CoreProvider;
use crate::observer::SubscriptionId;
use crate::subpool::Subpool;
use crate::worker::Worker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tunables for one reconciliation loop.
#[derive(Debug, Clone, Copy)]
pub struct FulfillerSettings {
    /// Speculative over-provisioning factor for in-flight attempts.
    pub forward_multiplier: usize,
    /// Scale-down only when in-flight exceeds target by more than this,
    /// except when requested demand has collapsed to zero.
    pub scale_down_hysteresis: usize,
    /// Hold a failed attempt's slot this long before retrying, so a
    /// rejecting or unreachable worker is re-probed at a bounded rate.
    pub failed_attempt_backoff: std::time::Duration,
}

impl Default for FulfillerSettings {
    fn default() -> Self {
        Self {
            forward_multiplier: 4,
            scale_down_hysteresis: 2,
            failed_attempt_backoff: std::time::Duration::from_millis(100),
        }
    }
}

struct Attempt {
    seq: u64,
    worker: Arc<Worker>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct RegisteredProvider {
    provider: Arc<dyn CoreProvider>,
    disconnect_subscription: SubscriptionId,
}

#[derive(Default)]
struct FulfillerState {
    providers: HashMap<String, RegisteredProvider>,
    attempts: HashMap<String, Attempt>,
}

/// One reconciliation loop over one worker collection.
pub struct Fulfiller {
    name: &'static str,
    subpool: Arc<Subpool>,
    settings: FulfillerSettings,
    state: Mutex<FulfillerState>,
    cancel: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    attempt_seq: AtomicU64,
}

impl Fulfiller {
    pub fn new(
        name: &'static str,
        subpool: Arc<Subpool>,
        settings: FulfillerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            subpool,
            settings,
            state: Mutex::new(FulfillerState::default()),
            cancel: CancellationToken::new(),
            loop_task: Mutex::new(None),
            attempt_seq: AtomicU64::new(0),
        })
    }

    pub fn subpool(&self) -> &Arc<Subpool> {
        &self.subpool
    }

    /// Spawns the reconciliation loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run().await;
        });
        *self.loop_task.lock() = Some(task);
    }

    async fn run(self: Arc<Self>) {
        tracing::debug!("{} fulfiller loop started", self.name);
        loop {
            self.reconcile().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.subpool.wakeup() => {}
            }
        }
        tracing::debug!("{} fulfiller loop stopped", self.name);
    }

    /// One reconciliation cycle: prune finished attempts, compare target
    /// against in-flight, scale in whichever direction is off.
    async fn reconcile(self: &Arc<Self>) {
        self.prune_finished();

        let counts = self.subpool.counts();
        let target = counts.requested.saturating_sub(counts.reserved)
            * self.settings.forward_multiplier;
        let in_flight = self.state.lock().attempts.len();

        if target > in_flight {
            self.scale_up(target - in_flight);
        } else if in_flight > target + self.settings.scale_down_hysteresis
            || (counts.requested == 0 && in_flight > target)
        {
            self.scale_down(in_flight - target).await;
        }
    }

    fn prune_finished(&self) {
        self.state.lock().attempts.retain(|_, attempt| {
            attempt
                .task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(true)
        });
    }

    /// Opens up to `want` attempts on workers with none in flight,
    /// ordered local-first, then fewest completed tasks, then oldest
    /// reservation timeout.
    fn scale_up(self: &Arc<Self>, want: usize) {
        let candidates: Vec<Arc<dyn CoreProvider>> = {
            let state = self.state.lock();
            let mut available: Vec<_> = state
                .providers
                .values()
                .map(|registered| registered.provider.clone())
                .filter(|provider| !provider.worker().attempt_pending())
                .collect();
            available.sort_by_key(|provider| provider.worker().scale_up_key());
            available.truncate(want);
            available
        };
        for provider in candidates {
            self.spawn_attempt(provider);
        }
    }

    fn spawn_attempt(self: &Arc<Self>, provider: Arc<dyn CoreProvider>) {
        let worker = provider.worker().clone();
        if !worker.begin_attempt() {
            return;
        }

        let seq = self.attempt_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let worker_id = worker.id().to_string();

        // Register the attempt before the task can possibly finish, so
        // no terminal outcome ever leaves dangling attempt state.
        self.state.lock().attempts.insert(
            worker_id.clone(),
            Attempt {
                seq,
                worker: worker.clone(),
                cancel: cancel.clone(),
                task: None,
            },
        );

        let subpool = self.subpool.clone();
        let attempt_cancel = cancel.clone();
        let backoff = self.settings.failed_attempt_backoff;
        let name = self.name;
        let task = tokio::spawn(async move {
            match provider.request_core(&attempt_cancel).await {
                Ok(core) => {
                    // A success racing a cancellation still lands here:
                    // the reservation is never discarded, only queued.
                    provider
                        .worker()
                        .record_reservation(core.assignment().assignment_id);
                    let hook_subpool = subpool.clone();
                    core.set_dispose_hook(Box::new(move |handed_out| {
                        hook_subpool.on_core_disposed(handed_out);
                    }));
                    subpool.offer(core);
                }
                Err(e) if crate::error::is_cancelled(&e) => {
                    tracing::debug!(
                        "{} attempt on {} cancelled",
                        name,
                        provider.display_name()
                    );
                }
                Err(e) => {
                    // Absorbed: the loop simply tries another worker or
                    // waits for the next cycle. Keep the slot occupied
                    // briefly so an unhealthy worker is not re-probed in
                    // a tight loop.
                    tracing::debug!(
                        "{} attempt on {} failed: {:#}",
                        name,
                        provider.display_name(),
                        e
                    );
                    tokio::select! {
                        _ = attempt_cancel.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
            provider.worker().finish_attempt();
            subpool.wake_loop();
        });

        let mut state = self.state.lock();
        if let Some(attempt) = state.attempts.get_mut(&worker_id) {
            if attempt.seq == seq {
                attempt.task = Some(task);
            }
        }
    }

    /// Cancels `excess` in-flight attempts, fewest-completed-tasks
    /// workers first, awaiting each cancellation before proceeding.
    async fn scale_down(&self, excess: usize) {
        let victims: Vec<Attempt> = {
            let mut state = self.state.lock();
            let mut order: Vec<(u64, String)> = state
                .attempts
                .values()
                .map(|attempt| (attempt.worker.tasks_completed(), attempt.worker.id().to_string()))
                .collect();
            order.sort();
            order.truncate(excess);
            order
                .into_iter()
                .filter_map(|(_, id)| state.attempts.remove(&id))
                .collect()
        };

        for attempt in victims {
            attempt.cancel.cancel();
            if let Some(task) = attempt.task {
                if let Err(e) = task.await {
                    tracing::debug!("{} cancelled attempt task failed: {}", self.name, e);
                }
            }
            // The attempt task clears this on every path; repeat here so
            // the marker can never be left set, whatever the outcome.
            attempt.worker.finish_attempt();
        }
    }

    /// Registers a worker's provider outside discovery (e.g. the local
    /// worker at startup). Serialized through the same wake mechanism as
    /// reconciliation; duplicate ids are refused.
    pub fn register_provider(self: &Arc<Self>, provider: Arc<dyn CoreProvider>) -> bool {
        let worker = provider.worker().clone();
        if !self.subpool.register_worker(worker) {
            return false;
        }

        let weak = Arc::downgrade(self);
        let subscription = provider.subscribe_disconnect(Box::new(move |event| {
            if let Some(this) = weak.upgrade() {
                this.evict(&event.worker_id);
            }
        }));

        self.state.lock().providers.insert(
            provider.id().to_string(),
            RegisteredProvider {
                provider,
                disconnect_subscription: subscription,
            },
        );
        self.subpool.wake_loop();
        true
    }

    /// Removes a provider and its worker, cancelling any in-flight
    /// attempt against it. Runs synchronously so disconnect broadcasts
    /// can self-evict from any task.
    pub fn evict(&self, worker_id: &str) {
        let (removed_provider, removed_attempt) = {
            let mut state = self.state.lock();
            (
                state.providers.remove(worker_id),
                state.attempts.remove(worker_id),
            )
        };
        if let Some(registered) = &removed_provider {
            registered
                .provider
                .unsubscribe_disconnect(registered.disconnect_subscription);
        }
        if let Some(attempt) = removed_attempt {
            attempt.cancel.cancel();
        }
        if self.subpool.remove_worker(worker_id) {
            tracing::info!("{} evicted worker {}", self.name, worker_id);
        }
    }

    pub fn contains_provider(&self, worker_id: &str) -> bool {
        self.state.lock().providers.contains_key(worker_id)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.state.lock().providers.keys().cloned().collect()
    }

    /// Currently outstanding reservation attempts.
    pub fn in_flight(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Stops the loop, then cancels and awaits every in-flight attempt,
    /// then disposes any cores still queued.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let attempts: Vec<Attempt> = {
            let mut state = self.state.lock();
            state.attempts.drain().map(|(_, attempt)| attempt).collect()
        };
        for attempt in attempts {
            attempt.cancel.cancel();
            if let Some(task) = attempt.task {
                let _ = task.await;
            }
            attempt.worker.finish_attempt();
        }

        for core in self.subpool.drain_ready() {
            core.dispose();
        }
        tracing::debug!("{} fulfiller stopped", self.name);
    }
}
