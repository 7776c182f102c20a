// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping for one supply source: demand/supply counters, the set of
//! known workers, and the ready queue of cores awaiting a requester.
//!
//! Counter semantics: `requested` counts demand units currently held by
//! callers — incremented when a reservation request arrives, decremented
//! when the request is cancelled before hand-out or when its handed-out
//! core is disposed. `reserved` counts live reservations (ready-queued
//! plus handed out). The reconciliation loop targets
//! `(requested − reserved) × forward_multiplier` in-flight attempts.

use crate::core::Core;
use crate::worker::Worker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SubpoolState {
    requested: usize,
    reserved: usize,
    workers: Vec<Arc<Worker>>,
    ready: VecDeque<Core>,
}

/// Counters snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpoolCounts {
    pub requested: usize,
    pub reserved: usize,
    pub ready: usize,
    pub workers: usize,
}

/// Per-source bookkeeping shared between the reconciliation loop, the
/// discovery loop, and requesters. Locks are held only across in-memory
/// mutation.
pub struct Subpool {
    name: &'static str,
    state: Mutex<SubpoolState>,
    /// Wakes the reconciliation loop.
    wake: Notify,
    /// Wakes one waiter when a core lands in the ready queue.
    core_ready: Notify,
}

impl Subpool {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(SubpoolState::default()),
            wake: Notify::new(),
            core_ready: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers one unit of demand and wakes the reconciliation loop.
    pub fn add_request(&self) {
        self.state.lock().requested += 1;
        self.wake.notify_one();
    }

    /// Retires one unit of demand that never received a core.
    pub fn cancel_request(&self) {
        let mut state = self.state.lock();
        state.requested = state.requested.saturating_sub(1);
        drop(state);
        self.wake.notify_one();
    }

    /// Records a successful reservation: the core becomes available to
    /// any waiter — first ready, first served, not FIFO by requester.
    pub fn offer(&self, core: Core) {
        {
            let mut state = self.state.lock();
            state.reserved += 1;
            state.ready.push_back(core);
        }
        self.core_ready.notify_one();
        self.wake.notify_one();
    }

    /// Pops a ready core, discarding any that died while queued.
    pub fn try_take(&self) -> Option<Core> {
        loop {
            let core = {
                let mut state = self.state.lock();
                let core = state.ready.pop_front()?;
                if !state.ready.is_empty() {
                    // notify_one stores at most one permit; chain the
                    // wakeup so one hand-out cannot strand other waiters
                    // when several cores arrived back to back.
                    self.core_ready.notify_one();
                }
                core
            };
            if core.is_alive() {
                core.mark_handed_out();
                return Some(core);
            }
            // Died in the queue: dispose (decrements `reserved` through
            // its hook) and keep looking.
            core.dispose();
        }
    }

    /// Subpool-side teardown for one disposed core. `handed_out` retires
    /// the demand unit the core was serving.
    pub fn on_core_disposed(&self, handed_out: bool) {
        {
            let mut state = self.state.lock();
            state.reserved = state.reserved.saturating_sub(1);
            if handed_out {
                state.requested = state.requested.saturating_sub(1);
            }
        }
        self.wake.notify_one();
    }

    /// Adds a worker if its id is not already present. Returns whether it
    /// was added.
    pub fn register_worker(&self, worker: Arc<Worker>) -> bool {
        let added = {
            let mut state = self.state.lock();
            if state.workers.iter().any(|w| w.id() == worker.id()) {
                false
            } else {
                state.workers.push(worker);
                true
            }
        };
        if added {
            self.wake.notify_one();
        }
        added
    }

    pub fn remove_worker(&self, worker_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.workers.len();
            state.workers.retain(|w| w.id() != worker_id);
            state.workers.len() != before
        };
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.state.lock().workers.clone()
    }

    pub fn contains_worker(&self, worker_id: &str) -> bool {
        self.state
            .lock()
            .workers
            .iter()
            .any(|w| w.id() == worker_id)
    }

    pub fn counts(&self) -> SubpoolCounts {
        let state = self.state.lock();
        SubpoolCounts {
            requested: state.requested,
            reserved: state.reserved,
            ready: state.ready.len(),
            workers: state.workers.len(),
        }
    }

    /// Awaits the next ready-queue arrival. Callers must re-check
    /// [`Subpool::try_take`] after waking; hand-out is best-effort, not
    /// FIFO-fair by design.
    pub async fn core_ready(&self) {
        self.core_ready.notified().await;
    }

    /// Awaits the next reconciliation wake.
    pub async fn wakeup(&self) {
        self.wake.notified().await;
    }

    pub fn wake_loop(&self) {
        self.wake.notify_one();
    }

    /// Empties the ready queue for shutdown; callers dispose the drained
    /// cores outside the lock.
    pub fn drain_ready(&self) -> Vec<Core> {
        let mut state = self.state.lock();
        state.ready.drain(..).collect()
    }
}

impl std::fmt::Debug for Subpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.counts();
        f.debug_struct("Subpool")
            .field("name", &self.name)
            .field("requested", &counts.requested)
            .field("reserved", &counts.reserved)
            .field("ready", &counts.ready)
            .field("workers", &counts.workers)
            .finish()
    }
}
