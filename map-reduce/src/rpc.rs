//! Unix-socket plumbing for the master and worker services.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use log::{info, trace};
use tarpc::{client, context, tokio_serde::formats::Json};

use crate::{MasterRpcClient, Task, WorkerRpcClient};

/// Bounded retries with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    /// 40 attempts, 250 ms apart: about ten seconds for a master to come up.
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the
    /// last error in the latter case. `op` receives the attempt number.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.interval).await;
            }
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    trace!("attempt {} failed: {:#}", attempt, e);
                    if attempt % 10 == 0 && attempt + 1 < self.max_attempts {
                        info!("retrying after: {:#}", e);
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| anyhow!("retry policy allows no attempts")))
    }
}

/// A fresh socket path for a worker of this process.
pub fn worker_address(dir: &Path) -> PathBuf {
    dir.join(format!(
        "mr-worker-{}-{:08x}.sock",
        std::process::id(),
        rand::random::<u32>()
    ))
}

/// Context whose deadline is `timeout` from now.
pub fn context_with_timeout(timeout: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + timeout;
    ctx
}

pub async fn connect_master(address: &Path) -> io::Result<MasterRpcClient> {
    let transport = tarpc::serde_transport::unix::connect(address, Json::default).await?;
    Ok(MasterRpcClient::new(client::Config::default(), transport).spawn())
}

pub async fn connect_worker(address: &Path) -> io::Result<WorkerRpcClient> {
    let transport = tarpc::serde_transport::unix::connect(address, Json::default).await?;
    Ok(WorkerRpcClient::new(client::Config::default(), transport).spawn())
}

/// One registration attempt.
pub async fn register(master: &Path, worker: PathBuf, timeout: Duration) -> Result<()> {
    let client = connect_master(master).await?;
    client
        .register(context_with_timeout(timeout), worker)
        .await?;
    Ok(())
}

/// Sends a task and waits for the outcome. A connection failure, an expired
/// deadline and an error reported by the worker all come back as `Err`.
pub async fn call_task(worker: &Path, task: Task, timeout: Duration) -> Result<()> {
    let call = async {
        let client = connect_worker(worker).await?;
        client
            .do_task(context_with_timeout(timeout), task)
            .await?
            .map_err(|e| anyhow!("worker reported: {}", e))
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| anyhow!("no reply within {:?}", timeout))?
}

pub async fn call_shutdown(worker: &Path, timeout: Duration) -> Result<()> {
    let call = async {
        let client = connect_worker(worker).await?;
        client.shutdown(context_with_timeout(timeout)).await?;
        Ok::<(), anyhow::Error>(())
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| anyhow!("no reply within {:?}", timeout))?
}

/// Removes a leftover socket file so the path can be bound again.
pub(crate) fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub(crate) async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}
