// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `FORGE_LOG` environment variable (same syntax as
//! `RUST_LOG`), defaulting to `info`. Set `FORGE_LOG_JSONL=1` for
//! line-delimited JSON output.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "FORGE_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV toggling JSONL output
const JSONL_ENV: &str = "FORGE_LOG_JSONL";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        let jsonl = std::env::var(JSONL_ENV)
            .ok()
            .is_some_and(|v| v == "1" || v == "true");
        if jsonl {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
