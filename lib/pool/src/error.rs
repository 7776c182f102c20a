// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed error classification for the reservation layer.
//!
//! [`PoolError`] carries an [`ErrorKind`] so call sites can decide what to
//! do with a failed attempt (evict the provider, deprioritize the worker,
//! or swallow a cancellation) instead of string-matching messages. It is
//! serializable so outcomes can cross a wire unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorizes reservation-layer failures into a fixed set of kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The worker process is gone or unreachable (mid-stream or during
    /// reservation). Providers hit by this are evicted from their
    /// collection.
    Unavailable,
    /// The worker answered, but the first message on a reservation stream
    /// was not a core assignment.
    MalformedResponse,
    /// A connect or ping did not complete within its deadline.
    ConnectionTimeout,
    /// The operation was cancelled by shutdown or a scale-down decision.
    /// Not an error in the taxonomy; suppressed at every observing site.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unavailable => write!(f, "Unavailable"),
            ErrorKind::MalformedResponse => write!(f, "MalformedResponse"),
            ErrorKind::ConnectionTimeout => write!(f, "ConnectionTimeout"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The standardized typed error for the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolError {
    kind: ErrorKind,
    message: String,
}

impl PoolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedResponse, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionTimeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PoolError {}

/// Walk an `anyhow` chain and return the first [`PoolError`] kind in it.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|e| e.downcast_ref::<PoolError>())
        .map(|e| e.kind())
}

/// True if the chain classifies as a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    kind_of(err) == Some(ErrorKind::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time assertions that PoolError stays Send + Sync + 'static.
    const _: () = {
        fn assert_stderror<T: std::error::Error>() {}
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        fn assert_all() {
            assert_stderror::<PoolError>();
            assert_send_sync::<PoolError>();
        }
    };

    #[test]
    fn test_kind_of_walks_chain() {
        let err = anyhow::Error::new(PoolError::unavailable("worker gone"))
            .context("reservation attempt failed");
        assert_eq!(kind_of(&err), Some(ErrorKind::Unavailable));
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn test_cancelled_classification() {
        let err = anyhow::Error::new(PoolError::cancelled("scale-down"));
        assert!(is_cancelled(&err));
    }

    #[test]
    fn test_kind_of_plain_error() {
        let err = anyhow::anyhow!("no typed error here");
        assert_eq!(kind_of(&err), None);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let err = PoolError::malformed("first message was Pong");
        let json = serde_json::to_string(&err).unwrap();
        let back: PoolError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), ErrorKind::MalformedResponse);
        assert_eq!(back.message(), "first message was Pong");
    }
}
