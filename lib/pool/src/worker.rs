// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-worker identity and reservation bookkeeping.

use crate::client::WorkerClient;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// A process capable of hosting execution cores — the one local worker or
/// a network-discovered remote one.
///
/// All mutable bookkeeping lives behind one mutex, held only across
/// in-memory mutation, never across network I/O.
pub struct Worker {
    id: String,
    display_name: String,
    client: Arc<dyn WorkerClient>,
    is_local: bool,
    state: Mutex<WorkerState>,
}

#[derive(Debug, Default)]
struct WorkerState {
    /// Completed reservations recorded against this worker; scale-up
    /// orders ascending on this to spread first-use warm-up cost.
    tasks_completed: u64,
    /// At most one reservation attempt may be in flight per worker.
    attempt_pending: bool,
    last_reservation_at: Option<Instant>,
    /// Set when a reservation attempt failed to produce a confirmation;
    /// scale-up deprioritizes recently timed-out workers.
    last_timeout_at: Option<Instant>,
    active_assignments: Vec<Uuid>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        client: Arc<dyn WorkerClient>,
        is_local: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            display_name: display_name.into(),
            client,
            is_local,
            state: Mutex::new(WorkerState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.client
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Claims the single attempt slot. Returns false if an attempt is
    /// already in flight.
    pub fn begin_attempt(&self) -> bool {
        let mut state = self.state.lock();
        if state.attempt_pending {
            return false;
        }
        state.attempt_pending = true;
        state.last_reservation_at = Some(Instant::now());
        true
    }

    /// Clears the attempt slot. Always called when an attempt reaches a
    /// terminal outcome, whatever that outcome was.
    pub fn finish_attempt(&self) {
        self.state.lock().attempt_pending = false;
    }

    pub fn attempt_pending(&self) -> bool {
        self.state.lock().attempt_pending
    }

    /// Records a successful reservation.
    pub fn record_reservation(&self, assignment_id: Uuid) {
        let mut state = self.state.lock();
        state.active_assignments.push(assignment_id);
        state.tasks_completed += 1;
    }

    /// Removes one assignment. Returns whether it was present, so core
    /// disposal can guarantee exactly one decrement.
    pub fn release_reservation(&self, assignment_id: Uuid) -> bool {
        let mut state = self.state.lock();
        let before = state.active_assignments.len();
        state.active_assignments.retain(|id| *id != assignment_id);
        state.active_assignments.len() != before
    }

    /// Marks a reservation attempt that failed to produce a confirmation.
    pub fn record_timeout(&self) {
        self.state.lock().last_timeout_at = Some(Instant::now());
    }

    pub fn tasks_completed(&self) -> u64 {
        self.state.lock().tasks_completed
    }

    pub fn active_reservations(&self) -> usize {
        self.state.lock().active_assignments.len()
    }

    pub fn last_reservation_at(&self) -> Option<Instant> {
        self.state.lock().last_reservation_at
    }

    pub fn last_timeout_at(&self) -> Option<Instant> {
        self.state.lock().last_timeout_at
    }

    /// Scale-up ordering key: local first, then fewest completed tasks,
    /// then the oldest (or no) reservation timeout.
    pub fn scale_up_key(&self) -> (bool, u64, Option<Instant>) {
        let state = self.state.lock();
        (!self.is_local, state.tasks_completed, state.last_timeout_at)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("is_local", &self.is_local)
            .field("tasks_completed", &state.tasks_completed)
            .field("attempt_pending", &state.attempt_pending)
            .field("active_assignments", &state.active_assignments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkerStream;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullClient;

    #[async_trait]
    impl WorkerClient for NullClient {
        async fn open_stream(&self) -> anyhow::Result<WorkerStream> {
            anyhow::bail!("not reachable")
        }

        async fn ping(&self, _deadline: Duration) -> anyhow::Result<()> {
            anyhow::bail!("not reachable")
        }
    }

    fn worker(is_local: bool) -> Arc<Worker> {
        Worker::new(
            Uuid::new_v4().to_string(),
            "test-worker",
            Arc::new(NullClient),
            is_local,
        )
    }

    #[test]
    fn test_single_attempt_slot() {
        let w = worker(false);
        assert!(w.begin_attempt());
        assert!(!w.begin_attempt());
        w.finish_attempt();
        assert!(w.begin_attempt());
    }

    #[test]
    fn test_release_is_exactly_once() {
        let w = worker(false);
        let id = Uuid::new_v4();
        w.record_reservation(id);
        assert_eq!(w.active_reservations(), 1);
        assert!(w.release_reservation(id));
        assert!(!w.release_reservation(id));
        assert_eq!(w.active_reservations(), 0);
    }

    #[test]
    fn test_scale_up_key_prefers_local_and_idle() {
        let local = worker(true);
        let remote = worker(false);
        assert!(local.scale_up_key() < remote.scale_up_key());

        let fresh = worker(false);
        let used = worker(false);
        used.record_reservation(Uuid::new_v4());
        assert!(fresh.scale_up_key() < used.scale_up_key());

        let never_timed_out = worker(false);
        let timed_out = worker(false);
        timed_out.record_timeout();
        assert!(never_timed_out.scale_up_key() < timed_out.scale_up_key());
    }
}
