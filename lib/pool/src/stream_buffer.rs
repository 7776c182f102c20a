// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Converts the push-driven response side of a bidirectional stream into
//! a cancellable, ordered, single-pass pull sequence.
//!
//! One background reader drains the network stream into an unbounded
//! ordered queue. Consumers pull with [`StreamBuffer::next`]. On graceful
//! completion the queue simply ends; on stream failure the error is
//! enqueued as the terminal element, so the consumer receives every item
//! that arrived before the failure and then the error — exactly one
//! terminal outcome, never both, never neither.

use crate::observer::{ObserverList, SubscriptionId};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of an observed stream, delivered to end observers.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// The remote side completed the stream cleanly.
    Completed,
    /// The stream failed (remote cancellation, transport error).
    Failed { message: String },
}

impl StreamEnd {
    pub fn is_failure(&self) -> bool {
        matches!(self, StreamEnd::Failed { .. })
    }
}

/// Buffered pull view over one push-driven stream.
pub struct StreamBuffer<T> {
    queue: mpsc::UnboundedReceiver<anyhow::Result<T>>,
    cancel: CancellationToken,
    on_end: Arc<ObserverList<StreamEnd>>,
    ended: Arc<Mutex<Option<StreamEnd>>>,
    terminal_seen: bool,
}

impl<T: Send + 'static> StreamBuffer<T> {
    /// Launches the background reader and starts buffering immediately.
    pub fn start_observing<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let on_end = Arc::new(ObserverList::new());
        let ended = Arc::new(Mutex::new(None));

        let reader_cancel = cancel.clone();
        let reader_on_end = on_end.clone();
        let reader_ended = ended.clone();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                let item = tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        // Disposed mid-stream: stop observing without an
                        // end event. The stream itself did not terminate.
                        return;
                    }
                    item = stream.next() => item,
                };
                let end = match item {
                    Some(Ok(value)) => {
                        if tx.send(Ok(value)).is_err() {
                            // Consumer is gone; nothing left to buffer for.
                            return;
                        }
                        continue;
                    }
                    Some(Err(err)) => {
                        let end = StreamEnd::Failed {
                            message: err.to_string(),
                        };
                        let _ = tx.send(Err(err));
                        end
                    }
                    None => StreamEnd::Completed,
                };
                // Record under the lock before broadcasting: subscribers
                // check `ended` under the same lock, so each observer is
                // either in the broadcast snapshot or fires immediately
                // from the recorded outcome — never neither, never both.
                *reader_ended.lock() = Some(end.clone());
                drop(tx);
                reader_on_end.broadcast(&end);
                return;
            }
        });

        Self {
            queue: rx,
            cancel,
            on_end,
            ended,
            terminal_seen: false,
        }
    }

    /// Pulls the next buffered item.
    ///
    /// Yields `Some(Ok(_))` for each item in arrival order, then either
    /// `None` (graceful end) or `Some(Err(_))` exactly once — after which
    /// every further call returns `None`.
    pub async fn next(&mut self) -> Option<anyhow::Result<T>> {
        if self.terminal_seen {
            return None;
        }
        match self.queue.recv().await {
            Some(Ok(value)) => Some(Ok(value)),
            Some(Err(err)) => {
                self.terminal_seen = true;
                Some(Err(err))
            }
            None => {
                self.terminal_seen = true;
                None
            }
        }
    }

    /// Registers a one-shot callback for the stream's terminal outcome.
    ///
    /// If the stream already ended, the callback fires immediately on the
    /// calling task and the returned id refers to an inert subscription.
    pub fn subscribe_end(
        &self,
        callback: impl Fn(&StreamEnd) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let guard = self.ended.lock();
        if let Some(end) = guard.clone() {
            drop(guard);
            callback(&end);
            // The stream will never broadcast again; hand back an inert
            // subscription so unsubscribe stays uniform for callers.
            return self.on_end.subscribe(|_| {});
        }
        // Subscribed while `ended` is still unset, under its lock — the
        // reader takes the broadcast snapshot only after setting `ended`,
        // so this subscription is guaranteed to be in it.
        let id = self.on_end.subscribe(callback);
        drop(guard);
        id
    }

    /// Removes a previously registered end callback.
    pub fn unsubscribe_end(&self, id: SubscriptionId) {
        self.on_end.unsubscribe(id);
    }

    /// Stops the background reader. Safe to call at any point and any
    /// number of times, whether or not the consumer finished iterating.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for StreamBuffer<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::ReceiverStream;

    fn feed() -> (
        mpsc::Sender<anyhow::Result<u32>>,
        ReceiverStream<anyhow::Result<u32>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        (tx, ReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn test_items_in_order_then_graceful_end() {
        let (tx, stream) = feed();
        let mut buffer = StreamBuffer::start_observing(stream);

        for v in 0..4u32 {
            tx.send(Ok(v)).await.unwrap();
        }
        drop(tx);

        for v in 0..4u32 {
            assert_eq!(buffer.next().await.unwrap().unwrap(), v);
        }
        assert!(buffer.next().await.is_none());
        // The terminal outcome is observed exactly once; further pulls
        // keep returning None.
        assert!(buffer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_delivered_after_buffered_items() {
        let (tx, stream) = feed();
        let mut buffer = StreamBuffer::start_observing(stream);

        tx.send(Ok(1)).await.unwrap();
        tx.send(Ok(2)).await.unwrap();
        tx.send(Err(anyhow::anyhow!("connection reset"))).await.unwrap();
        drop(tx);

        // Give the reader a chance to buffer everything before we pull,
        // proving the error does not overtake earlier items.
        tokio::task::yield_now().await;

        assert_eq!(buffer.next().await.unwrap().unwrap(), 1);
        assert_eq!(buffer.next().await.unwrap().unwrap(), 2);
        let err = buffer.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(buffer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_end_callback_fires_once_on_failure() {
        let (tx, stream) = feed();
        let buffer = StreamBuffer::<u32>::start_observing(stream);

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_cb = failures.clone();
        buffer.subscribe_end(move |end| {
            if end.is_failure() {
                failures_cb.fetch_add(1, Ordering::SeqCst);
            }
        });

        tx.send(Err(anyhow::anyhow!("unavailable"))).await.unwrap();
        drop(tx);
        tokio::task::yield_now().await;

        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_observes_recorded_end() {
        let (tx, stream) = feed();
        let buffer = StreamBuffer::<u32>::start_observing(stream);
        drop(tx);
        tokio::task::yield_now().await;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        buffer.subscribe_end(move |end| {
            assert!(!end.is_failure());
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_callback_does_not_fire() {
        let (tx, stream) = feed();
        let buffer = StreamBuffer::<u32>::start_observing(stream);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let id = buffer.subscribe_end(move |_| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });
        buffer.unsubscribe_end(id);

        drop(tx);
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_stops_reader() {
        let (tx, stream) = feed();
        let mut buffer = StreamBuffer::<u32>::start_observing(stream);

        buffer.dispose();
        buffer.dispose();
        tokio::task::yield_now().await;

        // Reader is gone: even with the sender still open, the consumer
        // sees a terminated queue rather than hanging.
        assert!(buffer.next().await.is_none());
        drop(tx);
    }
}
