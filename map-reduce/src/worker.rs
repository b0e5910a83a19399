use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, ensure, Context, Result};
use futures::{future, prelude::*};
use log::{error, info, warn};
use tarpc::{
    context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{rpc, store, Config, KeyValue, MapFn, ReduceFn, Task, WorkerRpc};

/// Lifecycle of a worker.
///
/// `Starting -> Registered <-> Active -> ShuttingDown -> Stopped`, where
/// `Active` means a task is running. A new worker is `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Registered,
    Active,
    ShuttingDown,
    Stopped,
}

struct Inner {
    job: String,
    map: MapFn,
    reduce: ReduceFn,
    config: Config,
    address: PathBuf,
    state: watch::Sender<Lifecycle>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Held while a task runs.
    running: tokio::sync::Mutex<()>,
}

/// Executes the map and reduce tasks a master sends it, one at a time.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

/// Returns the worker to `Registered` when a task ends, however it ends.
struct ActiveGuard<'a>(&'a Worker);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.transition(Lifecycle::Active, Lifecycle::Registered);
    }
}

impl Worker {
    pub fn new(job: impl Into<String>, map: MapFn, reduce: ReduceFn, config: Config) -> Self {
        let address = rpc::worker_address(&config.socket_dir);
        let (state, _) = watch::channel(Lifecycle::Stopped);
        Self {
            inner: Arc::new(Inner {
                job: job.into(),
                map,
                reduce,
                config,
                address,
                state,
                listener: Mutex::new(None),
                running: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn address(&self) -> &Path {
        &self.inner.address
    }

    pub fn job(&self) -> &str {
        &self.inner.job
    }

    pub fn state(&self) -> Lifecycle {
        *self.inner.state.borrow()
    }

    /// Whether the worker accepts tasks. True from `start` until `shutdown`.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            Lifecycle::Starting | Lifecycle::Registered | Lifecycle::Active
        )
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.inner.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// Opens the task listener, registers with the master and blocks until
    /// the worker is shut down. Gives up and shuts down if registration keeps
    /// failing.
    pub async fn start(&self) -> Result<()> {
        ensure!(
            self.transition(Lifecycle::Stopped, Lifecycle::Starting),
            "worker {:?} is already running",
            self.inner.address
        );
        let mut state = self.inner.state.subscribe();
        if let Err(e) = self.listen().await {
            self.shutdown();
            return Err(e);
        }

        tokio::select! {
            registered = self.register() => match registered {
                Ok(()) => {
                    info!("worker {:?} registered successfully", self.inner.address);
                    self.transition(Lifecycle::Starting, Lifecycle::Registered);
                }
                Err(e) => {
                    warn!("failed to register, shutting down: {:#}", e);
                    self.shutdown();
                }
            },
            // Shut down locally before the master ever answered.
            _ = state.wait_for(|s| *s == Lifecycle::Stopped) => {}
        }

        let _ = state.wait_for(|s| *s == Lifecycle::Stopped).await;
        Ok(())
    }

    async fn listen(&self) -> Result<()> {
        let address = &self.inner.address;
        fs::create_dir_all(&self.inner.config.socket_dir)
            .with_context(|| format!("cannot create {:?}", self.inner.config.socket_dir))?;
        rpc::remove_socket(address)?;
        let mut listener = tarpc::serde_transport::unix::listen(address, Json::default)
            .await
            .with_context(|| format!("cannot listen on {:?}", address))?;
        listener.config_mut().max_frame_length(usize::MAX);

        let server = WorkerServer(self.clone());
        let accept = listener
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            // Connections outlive the listener so a shutdown call still gets its reply.
            .for_each(move |channel| {
                tokio::spawn(channel.execute(server.clone().serve()).for_each(rpc::spawn));
                async {}
            });
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tokio::spawn(accept));
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        let config = &self.inner.config;
        let address = &self.inner.address;
        config
            .registration
            .retry(|_| rpc::register(&config.master_address, address.clone(), config.dispatch_timeout))
            .await
            .with_context(|| format!("master at {:?} unreachable", config.master_address))
    }

    /// Deactivates the worker and closes its listener. Calling it again has
    /// no effect.
    pub fn shutdown(&self) {
        let begun = self.inner.state.send_if_modified(|s| match s {
            Lifecycle::ShuttingDown | Lifecycle::Stopped => false,
            _ => {
                *s = Lifecycle::ShuttingDown;
                true
            }
        });
        if !begun {
            return;
        }
        info!("worker {:?} shutting down", self.inner.address);
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        if let Err(e) = rpc::remove_socket(&self.inner.address) {
            warn!("cannot remove {:?}: {}", self.inner.address, e);
        }
        self.inner.state.send_replace(Lifecycle::Stopped);
    }

    /// Runs a dispatched task on a blocking thread. Any failure is fatal to
    /// the worker: it shuts down and the master sees the call fail.
    async fn handle_task(&self, task: Task) -> Result<()> {
        let _running = self.inner.running.lock().await;
        ensure!(self.is_active(), "worker {:?} is not active", self.inner.address);
        self.transition(Lifecycle::Starting, Lifecycle::Active);
        self.transition(Lifecycle::Registered, Lifecycle::Active);
        let _active = ActiveGuard(self);

        let worker = self.clone();
        let t = task.clone();
        let outcome = tokio::task::spawn_blocking(move || worker.execute(&t))
            .await
            .map_err(|e| anyhow!("task aborted: {}", e))
            .and_then(|r| r);
        if let Err(e) = &outcome {
            error!("{:?} failed: {:#}", task, e);
            self.shutdown();
        }
        outcome
    }

    /// Runs either kind of task.
    pub fn execute(&self, task: &Task) -> Result<()> {
        match task {
            Task::Map {
                input_file,
                mapper,
                n_reduce,
            } => self.execute_map(input_file, *mapper, *n_reduce),
            Task::Reduce { reducer, n_map } => self.execute_reduce(*reducer, *n_map),
        }
    }

    /// Applies the map function to one input file and appends its output to
    /// the `n_reduce` partition files of `mapper`. Every partition file is
    /// created, even when it receives nothing.
    pub fn execute_map(&self, input_file: &Path, mapper: usize, n_reduce: usize) -> Result<()> {
        info!(
            "MAP[{}:{}]: processing {:?} for {} reducers",
            self.inner.job, mapper, input_file, n_reduce
        );
        ensure!(n_reduce > 0, "map task {} has no reducers", mapper);
        let dir = &self.inner.config.data_dir;
        fs::create_dir_all(dir).with_context(|| format!("cannot create {:?}", dir))?;
        let content = fs::read_to_string(input_file)
            .with_context(|| format!("cannot read input file {:?}", input_file))?;

        let kvs = (self.inner.map)(&input_file.to_string_lossy(), &content);
        for (reducer, bucket) in store::partition(kvs, n_reduce).iter().enumerate() {
            let path = store::partition_name(dir, &self.inner.job, mapper, reducer);
            store::append_partition(&path, bucket)?;
        }
        Ok(())
    }

    /// Groups the records every mapper produced for `reducer` and writes one
    /// reduced value per key, replacing earlier output.
    pub fn execute_reduce(&self, reducer: usize, n_map: usize) -> Result<()> {
        info!(
            "REDUCE[{}:{}]: reducing from {} mappers",
            self.inner.job, reducer, n_map
        );
        let dir = &self.inner.config.data_dir;
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for mapper in 0..n_map {
            let path = store::partition_name(dir, &self.inner.job, mapper, reducer);
            for kv in store::read_file(&path)? {
                groups.entry(kv.key).or_default().push(kv.value);
            }
        }

        let mut out: Vec<KeyValue> = groups
            .into_iter()
            .map(|(key, values)| {
                let value = (self.inner.reduce)(&key, &values);
                KeyValue { key, value }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        store::replace_file(
            &store::reduce_output_name(dir, &self.inner.job, reducer),
            &out,
        )
    }
}

/// RPC face of a worker.
#[derive(Clone)]
struct WorkerServer(Worker);

impl WorkerRpc for WorkerServer {
    async fn do_task(self, _: context::Context, task: Task) -> Result<(), String> {
        self.0.handle_task(task).await.map_err(|e| format!("{:#}", e))
    }

    async fn shutdown(self, _: context::Context) {
        self.0.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wc;
    use crate::rpc::RetryPolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    fn worker(dir: &Path) -> Worker {
        Worker::new("wc", wc::map, wc::reduce, Config::in_dir(dir))
    }

    #[test]
    fn test_map_then_reduce() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "a b a\nc a").unwrap();
        let w = worker(dir.path());

        w.execute(&Task::Map {
            input_file: input,
            mapper: 0,
            n_reduce: 3,
        })
        .unwrap();
        for r in 0..3 {
            assert!(store::partition_name(dir.path(), "wc", 0, r).exists());
        }

        let mut counts = HashMap::new();
        for r in 0..3 {
            w.execute(&Task::Reduce { reducer: r, n_map: 1 }).unwrap();
            for kv in store::read_file(&store::reduce_output_name(dir.path(), "wc", r)).unwrap() {
                assert_eq!(store::reducer_for(&kv.key, 3), r);
                counts.insert(kv.key, kv.value);
            }
        }
        assert_eq!(counts.len(), 3);
        assert_eq!(counts["a"], "3");
        assert_eq!(counts["b"], "1");
    }

    #[test]
    fn test_reduce_overwrites_previous_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "x").unwrap();
        let w = worker(dir.path());
        w.execute_map(&input, 0, 1).unwrap();
        w.execute_reduce(0, 1).unwrap();
        w.execute_reduce(0, 1).unwrap();
        let out = store::read_file(&store::reduce_output_name(dir.path(), "wc", 0)).unwrap();
        assert_eq!(out, vec![KeyValue::new("x", "1")]);
    }

    #[test]
    fn test_missing_files_are_errors() {
        let dir = TempDir::new().unwrap();
        let w = worker(dir.path());
        assert!(w.execute_map(&dir.path().join("absent"), 0, 2).is_err());
        // No mapper wrote for reducer 0.
        assert!(w.execute_reduce(0, 1).is_err());
    }

    #[test]
    fn test_new_worker_is_inactive() {
        let dir = TempDir::new().unwrap();
        let w = worker(dir.path());
        assert_eq!(w.state(), Lifecycle::Stopped);
        assert!(!w.is_active());
        assert!(w.address().starts_with(dir.path()));
        w.shutdown();
        assert_eq!(w.state(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_gives_up_without_master() {
        let dir = TempDir::new().unwrap();
        let config = Config::in_dir(dir.path())
            .with_registration(RetryPolicy::new(3, Duration::from_millis(10)));
        let w = Worker::new("wc", wc::map, wc::reduce, config);
        w.start().await.unwrap();
        assert_eq!(w.state(), Lifecycle::Stopped);
        assert!(!w.is_active());
        assert!(!w.address().exists());
        // Shutting down again is harmless.
        w.shutdown();
    }

    #[tokio::test]
    async fn test_inactive_worker_refuses_tasks() {
        let dir = TempDir::new().unwrap();
        let w = worker(dir.path());
        let res = w
            .handle_task(Task::Reduce { reducer: 0, n_map: 0 })
            .await;
        assert!(res.is_err());
    }
}
