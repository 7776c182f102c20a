// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Explicit observer lists for disconnect and stream-termination events.
//!
//! Broadcast order across observers is not guaranteed. Observers run on
//! the broadcasting task; keep them short and non-blocking.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ObserverList::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A list of event observers with add/remove/broadcast.
pub struct ObserverList<E> {
    observers: Mutex<Vec<(u64, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    /// Removes one subscription. Unknown ids are a no-op, so double
    /// unsubscribe is safe.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.lock().retain(|(sid, _)| *sid != id.0);
    }

    /// Invokes every observer subscribed at the start of the broadcast.
    ///
    /// The list is snapshotted before any callback runs, so observers may
    /// subscribe or unsubscribe from within a callback; an observer
    /// removed mid-broadcast may still see that broadcast once.
    pub fn broadcast(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }
}
