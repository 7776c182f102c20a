// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pool scenarios against real in-process TCP workers.

use anyhow::Result;
use async_trait::async_trait;
use forge_pool::discovery::{Advertisement, ServiceBrowser};
use forge_pool::{
    AllocationPreference, CancellationToken, LocalWorkerConfig, PoolConfig, PoolTunables,
    TaskExecutor, TaskOutput, TaskSpec, TcpWorkerClient, WorkerPool, WorkerServer,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, spec: TaskSpec) -> TaskOutput {
        TaskOutput {
            exit_code: 0,
            stdout: format!("{} {}", spec.executable, spec.arguments.join(" ")),
            stderr: String::new(),
        }
    }
}

struct FixedBrowser {
    ads: Vec<Advertisement>,
}

#[async_trait]
impl ServiceBrowser for FixedBrowser {
    async fn enumerate(&self) -> Result<Vec<Advertisement>> {
        Ok(self.ads.clone())
    }
}

async fn spawn_worker(capacity: u32) -> WorkerServer {
    WorkerServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        "test-machine",
        capacity,
        Arc::new(EchoExecutor),
    )
    .await
    .unwrap()
}

fn local_config(server: &WorkerServer, id: &str) -> LocalWorkerConfig {
    LocalWorkerConfig {
        client: Arc::new(TcpWorkerClient::new(
            server.local_addr(),
            Duration::from_secs(5),
        )),
        unique_id: id.to_string(),
        display_name: format!("{id}-display"),
    }
}

fn fast_tunables() -> PoolTunables {
    PoolTunables {
        discovery_poll_ms: 25,
        discovery_backoff_ms: 100,
        ..PoolTunables::default()
    }
}

#[tokio::test]
async fn test_three_concurrent_local_reserves_get_distinct_assignments() {
    let server = spawn_worker(3).await;
    let pool = WorkerPool::new(
        PoolConfig::builder()
            .local_worker(Some(local_config(&server, "local-1")))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            tokio::time::timeout(
                Duration::from_secs(10),
                pool.reserve_core(
                    AllocationPreference::LocalOrRemote,
                    CancellationToken::new(),
                ),
            )
            .await
            .expect("reservation timed out")
            .expect("reservation failed")
        }));
    }

    // Hold every lease until all three resolved, proving three distinct
    // concurrent reservations rather than reuse of one slot.
    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap());
    }

    let ids: HashSet<_> = leases
        .iter()
        .map(|lease| lease.assignment().assignment_id)
        .collect();
    assert_eq!(ids.len(), 3);

    drop(leases);
    pool.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_task_round_trip_over_reserved_core() {
    let server = spawn_worker(1).await;
    let pool = WorkerPool::new(
        PoolConfig::builder()
            .local_worker(Some(local_config(&server, "local-1")))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let mut lease = pool
        .reserve_core(AllocationPreference::LocalOnly, CancellationToken::new())
        .await
        .unwrap();
    assert!(lease.is_alive());
    assert_eq!(lease.assignment().machine_name, "test-machine");

    let output = lease
        .run_task(TaskSpec {
            executable: "clang".to_string(),
            arguments: vec!["-c".to_string(), "a.cpp".to_string()],
            working_dir: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "clang -c a.cpp");

    lease.release();
    pool.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_cancellation_unblocks_reserve_and_rolls_back_demand() {
    let server = spawn_worker(1).await;
    let pool = WorkerPool::new(
        PoolConfig::builder()
            .local_worker(Some(local_config(&server, "local-1")))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    // Hold the only core so the second request has to wait.
    let first = pool
        .reserve_core(AllocationPreference::LocalOnly, CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pool.reserve_core(AllocationPreference::LocalOnly, cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = waiter.await.unwrap();
    let err = result.expect_err("cancelled reservation must not resolve");
    assert!(forge_pool::error::is_cancelled(&err));

    first.release();
    // Both the cancelled and the released demand unit are retired. A
    // speculative core may still sit in the ready queue — reservations
    // beyond demand are kept for the next requester, never leaked.
    let counts = pool.snapshot().local.unwrap();
    assert_eq!(counts.requested, 0);
    assert_eq!(counts.reserved, counts.ready);

    pool.shutdown().await;
    let counts = pool.snapshot().local.unwrap();
    assert_eq!(counts.ready, 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_discovered_remote_worker_serves_cores() {
    let server = spawn_worker(2).await;
    let pool = WorkerPool::new(
        PoolConfig::builder()
            .enable_network_auto_discovery(true)
            .tunables(fast_tunables())
            .browser(Arc::new(FixedBrowser {
                ads: vec![Advertisement {
                    worker_id: "remote-1".to_string(),
                    display_name: "builder".to_string(),
                    addresses: vec![server.local_addr()],
                }],
            }) as Arc<dyn ServiceBrowser>)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let mut lease = tokio::time::timeout(
        Duration::from_secs(10),
        pool.reserve_core(
            AllocationPreference::LocalOrRemote,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("reservation timed out")
    .unwrap();

    assert_eq!(pool.remote_provider_ids(), vec!["remote-1".to_string()]);

    let output = lease
        .run_task(TaskSpec {
            executable: "cl".to_string(),
            arguments: vec!["/c".to_string()],
            working_dir: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);

    lease.release();
    pool.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_worker_death_mid_execution_flips_alive_and_evicts_provider() {
    let server = spawn_worker(1).await;
    let pool = WorkerPool::new(
        PoolConfig::builder()
            .enable_network_auto_discovery(true)
            .tunables(fast_tunables())
            .browser(Arc::new(FixedBrowser {
                ads: vec![Advertisement {
                    worker_id: "remote-1".to_string(),
                    display_name: "builder".to_string(),
                    addresses: vec![server.local_addr()],
                }],
            }) as Arc<dyn ServiceBrowser>)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let lease = tokio::time::timeout(
        Duration::from_secs(10),
        pool.reserve_core(
            AllocationPreference::LocalOrRemote,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("reservation timed out")
    .unwrap();
    assert!(lease.is_alive());

    // The worker process goes away mid-execution.
    server.shutdown().await;

    for _ in 0..200 {
        if !lease.is_alive() && pool.remote_provider_ids().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!lease.is_alive(), "liveness probe must observe the death");
    assert!(
        pool.remote_provider_ids().is_empty(),
        "dead worker's provider must be evicted"
    );

    lease.release();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_both_sources_and_queued_cores() {
    let local_server = spawn_worker(2).await;
    let remote_server = spawn_worker(2).await;
    let pool = WorkerPool::new(
        PoolConfig::builder()
            .local_worker(Some(local_config(&local_server, "local-1")))
            .enable_network_auto_discovery(true)
            .tunables(fast_tunables())
            .browser(Arc::new(FixedBrowser {
                ads: vec![Advertisement {
                    worker_id: "remote-1".to_string(),
                    display_name: "builder".to_string(),
                    addresses: vec![remote_server.local_addr()],
                }],
            }) as Arc<dyn ServiceBrowser>)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    // Create demand so speculative reservations queue up, then release
    // the lease and shut down with cores still in the ready queues.
    let lease = tokio::time::timeout(
        Duration::from_secs(10),
        pool.reserve_core(
            AllocationPreference::LocalOrRemote,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("reservation timed out")
    .unwrap();
    lease.release();

    tokio::time::timeout(Duration::from_secs(10), pool.shutdown())
        .await
        .expect("shutdown must complete");

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.local.unwrap().ready, 0);
    assert_eq!(snapshot.remote.unwrap().ready, 0);

    local_server.shutdown().await;
    remote_server.shutdown().await;
}
