// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reserve a core on an in-process worker and run one task over it.
//!
//! ```text
//! FORGE_LOG=debug cargo run --example local_dispatch
//! ```

use async_trait::async_trait;
use forge_pool::{
    AllocationPreference, CancellationToken, LocalWorkerConfig, PoolConfig, TaskExecutor,
    TaskOutput, TaskSpec, TcpWorkerClient, WorkerPool, WorkerServer,
};
use std::sync::Arc;
use std::time::Duration;

struct PrintfExecutor;

#[async_trait]
impl TaskExecutor for PrintfExecutor {
    async fn execute(&self, spec: TaskSpec) -> TaskOutput {
        TaskOutput {
            exit_code: 0,
            stdout: format!("ran `{} {}`", spec.executable, spec.arguments.join(" ")),
            stderr: String::new(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forge_pool::logging::init();

    let server = WorkerServer::bind(
        "127.0.0.1:0".parse()?,
        hostname(),
        4,
        Arc::new(PrintfExecutor),
    )
    .await?;

    let pool = WorkerPool::new(
        PoolConfig::builder()
            .local_worker(Some(LocalWorkerConfig {
                client: Arc::new(TcpWorkerClient::new(
                    server.local_addr(),
                    Duration::from_secs(5),
                )),
                unique_id: uuid::Uuid::new_v4().to_string(),
                display_name: hostname(),
            }))
            .build()?,
    )
    .await?;

    let mut lease = pool
        .reserve_core(AllocationPreference::LocalOnly, CancellationToken::new())
        .await?;
    println!(
        "reserved core {} on {} (assignment {})",
        lease.assignment().core_number,
        lease.assignment().machine_name,
        lease.assignment().assignment_id
    );

    let output = lease
        .run_task(TaskSpec {
            executable: "clang++".to_string(),
            arguments: vec!["-c".to_string(), "widget.cpp".to_string()],
            working_dir: ".".to_string(),
        })
        .await?;
    println!("worker says: {}", output.stdout);

    lease.release();
    pool.shutdown().await;
    server.shutdown().await;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
