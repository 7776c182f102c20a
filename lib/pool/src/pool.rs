// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The worker pool façade.
//!
//! Composes an optional local fulfiller (one worker, known at startup),
//! an optional remote fulfiller fed by network discovery, and exposes one
//! operation: reserve a core matching an allocation preference.

use crate::config::PoolConfig;
use crate::core::{Core, WorkerCoreProvider};
use crate::discovery::{Discovery, MdnsBrowser, ServiceBrowser};
use crate::error::PoolError;
use crate::fulfiller::Fulfiller;
use crate::protocol::{CoreAssignment, TaskOutput, TaskSpec, WorkerRequest, WorkerResponse};
use crate::subpool::{Subpool, SubpoolCounts};
use crate::worker::Worker;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A requester's constraint on where its core may live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPreference {
    LocalOnly,
    LocalOrRemote,
}

/// Consumer-facing handle over a reserved core.
///
/// Dropping the lease releases the core; [`CoreLease::release`] does the
/// same explicitly. Liveness is advisory — a core can die between a
/// check and use, and execution failure on a dead core is transient:
/// re-request rather than treating it as a scheduler bug.
pub struct CoreLease {
    core: Core,
}

impl CoreLease {
    pub fn assignment(&self) -> &CoreAssignment {
        self.core.assignment()
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    pub async fn run_task(&mut self, spec: TaskSpec) -> Result<TaskOutput> {
        self.core.run_task(spec).await
    }

    pub async fn send(&self, request: WorkerRequest) -> Result<()> {
        self.core.send(request).await
    }

    pub async fn next_output(&mut self) -> Option<Result<WorkerResponse>> {
        self.core.next_output().await
    }

    pub fn release(self) {
        self.core.dispose();
    }
}

impl std::fmt::Debug for CoreLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreLease")
            .field("assignment", self.core.assignment())
            .field("alive", &self.core.is_alive())
            .finish()
    }
}

/// Per-source counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub local: Option<SubpoolCounts>,
    pub remote: Option<SubpoolCounts>,
}

/// The pool: one local supply source, one discovered remote collection.
pub struct WorkerPool {
    local: Option<Arc<Fulfiller>>,
    remote: Option<Arc<Fulfiller>>,
    discovery_cancel: CancellationToken,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub async fn new(config: PoolConfig) -> Result<Arc<Self>> {
        use validator::Validate;
        config.tunables.validate()?;

        let settings = config.tunables.fulfiller_settings();

        let local = match &config.local_worker {
            Some(local_config) => {
                let fulfiller = Fulfiller::new("local", Subpool::new("local"), settings);
                let worker = Worker::new(
                    local_config.unique_id.clone(),
                    local_config.display_name.clone(),
                    local_config.client.clone(),
                    true,
                );
                fulfiller.register_provider(WorkerCoreProvider::new(worker));
                fulfiller.start();
                Some(fulfiller)
            }
            None => None,
        };

        let discovery_cancel = CancellationToken::new();
        let mut discovery_task = None;
        let remote = if config.enable_network_auto_discovery {
            let fulfiller = Fulfiller::new("remote", Subpool::new("remote"), settings);
            fulfiller.start();

            let discovery_settings = config.tunables.discovery_settings();
            let browser: Arc<dyn ServiceBrowser> = match config.browser {
                Some(browser) => browser,
                None => Arc::new(MdnsBrowser::new()?),
            };
            let client_factory = config
                .remote_client_factory
                .unwrap_or_else(|| Discovery::tcp_client_factory(&discovery_settings));
            let discovery = Discovery::new(
                browser,
                client_factory,
                config
                    .local_worker
                    .as_ref()
                    .map(|local| local.unique_id.clone()),
                discovery_settings,
            );
            discovery_task = Some(discovery.spawn(fulfiller.clone(), discovery_cancel.clone()));
            Some(fulfiller)
        } else {
            None
        };

        if local.is_none() && remote.is_none() {
            anyhow::bail!("pool configured with neither a local worker nor network discovery");
        }

        Ok(Arc::new(Self {
            local,
            remote,
            discovery_cancel,
            discovery_task: Mutex::new(discovery_task),
        }))
    }

    fn subpools_for(&self, preference: AllocationPreference) -> Vec<Arc<Subpool>> {
        let mut pools = Vec::new();
        if let Some(local) = &self.local {
            pools.push(local.subpool().clone());
        }
        if preference == AllocationPreference::LocalOrRemote {
            if let Some(remote) = &self.remote {
                pools.push(remote.subpool().clone());
            }
        }
        pools
    }

    /// Reserves one core matching the preference.
    ///
    /// Suspends until a core lands in a permitted ready queue or `cancel`
    /// fires. Hand-out across concurrent callers is first-ready,
    /// first-served — deliberately not FIFO-fair by requester.
    pub async fn reserve_core(
        &self,
        preference: AllocationPreference,
        cancel: CancellationToken,
    ) -> Result<CoreLease> {
        let pools = self.subpools_for(preference);
        if pools.is_empty() {
            return Err(PoolError::unavailable(format!(
                "no supply source permits {preference:?}"
            ))
            .into());
        }

        for pool in &pools {
            pool.add_request();
        }

        loop {
            for (index, pool) in pools.iter().enumerate() {
                if let Some(core) = pool.try_take() {
                    // The serving pool's demand unit retires when the
                    // handed-out core is disposed; the others' retire now.
                    for (other_index, other) in pools.iter().enumerate() {
                        if other_index != index {
                            other.cancel_request();
                        }
                    }
                    tracing::debug!(
                        source = pool.name(),
                        assignment_id = %core.assignment().assignment_id,
                        "core handed out"
                    );
                    return Ok(CoreLease { core });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    for pool in &pools {
                        pool.cancel_request();
                    }
                    return Err(PoolError::cancelled("core request cancelled").into());
                }
                _ = wait_any_ready(&pools) => {}
            }
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            local: self.local.as_ref().map(|f| f.subpool().counts()),
            remote: self.remote.as_ref().map(|f| f.subpool().counts()),
        }
    }

    /// Ids of currently admitted remote providers.
    pub fn remote_provider_ids(&self) -> Vec<String> {
        self.remote
            .as_ref()
            .map(|f| f.provider_ids())
            .unwrap_or_default()
    }

    /// Stops the local fulfiller, then the remote fulfiller (each
    /// awaited), then cancels discovery — in-flight reservation attempts
    /// are torn down before the network layer and discovery loop.
    pub async fn shutdown(&self) {
        if let Some(local) = &self.local {
            local.stop().await;
        }
        if let Some(remote) = &self.remote {
            remote.stop().await;
        }
        self.discovery_cancel.cancel();
        let task = self.discovery_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("worker pool shut down");
    }
}

/// Completes on the next ready-queue arrival in any permitted pool.
async fn wait_any_ready(pools: &[Arc<Subpool>]) {
    match pools {
        [only] => only.core_ready().await,
        [first, second] => {
            tokio::select! {
                _ = first.core_ready() => {}
                _ = second.core_ready() => {}
            }
        }
        // A preference maps to at most two supply sources.
        _ => futures::future::pending().await,
    }
}
