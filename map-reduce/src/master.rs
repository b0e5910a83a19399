use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use futures::{future, prelude::*};
use log::{debug, info, trace, warn};
use tarpc::{
    context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::{rpc, store, Config, Job, MasterRpc, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Map,
    Reduce,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub phase: Phase,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    Idle,
    InProgress(PathBuf),
    Completed,
}

/// A scheduler state change, recorded in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Registered { worker: PathBuf },
    Dispatched { task: TaskId, worker: PathBuf },
    Completed { task: TaskId, worker: PathBuf },
    Failed { task: TaskId, worker: PathBuf },
    PhaseDone(Phase),
}

/// Snapshot of job progress and of the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    pub maps_done: usize,
    pub reduces_done: usize,
    pub workers: Vec<(PathBuf, WorkerState)>,
}

#[derive(Debug, Clone)]
struct Assignment {
    index: usize,
    task: Task,
    worker: PathBuf,
}

/// Everything the dispatch tasks share. Only ever touched under one lock.
#[derive(Debug)]
struct ServerContext {
    phase: Phase,
    tasks: Vec<(Task, TaskState)>,
    queue: VecDeque<usize>,

    workers: HashMap<PathBuf, WorkerState>,
    idle: VecDeque<PathBuf>,

    maps_done: usize,
    reduces_done: usize,
    history: Vec<Transition>,
}

impl ServerContext {
    fn new() -> Self {
        Self {
            phase: Phase::Map,
            tasks: Vec::new(),
            queue: VecDeque::new(),
            workers: HashMap::new(),
            idle: VecDeque::new(),
            maps_done: 0,
            reduces_done: 0,
            history: Vec::new(),
        }
    }

    fn register(&mut self, worker: PathBuf) {
        let state = self
            .workers
            .entry(worker.clone())
            .or_insert(WorkerState::Dead);
        match state {
            // Its running dispatch decides what happens next.
            WorkerState::Busy => debug!("busy worker {:?} registered again", worker),
            WorkerState::Idle => {}
            WorkerState::Dead => {
                *state = WorkerState::Idle;
                self.idle.push_back(worker.clone());
            }
        }
        self.history.push(Transition::Registered { worker });
    }

    fn begin_phase(&mut self, phase: Phase, tasks: Vec<Task>) {
        self.phase = phase;
        self.queue = (0..tasks.len()).collect();
        self.tasks = tasks.into_iter().map(|t| (t, TaskState::Idle)).collect();
    }

    fn phase_finished(&self) -> bool {
        self.tasks
            .iter()
            .all(|(_, state)| *state == TaskState::Completed)
    }

    fn finish_phase(&mut self) {
        self.history.push(Transition::PhaseDone(self.phase));
        self.phase = match self.phase {
            Phase::Map => Phase::Reduce,
            Phase::Reduce | Phase::Done => Phase::Done,
        };
        self.tasks.clear();
        self.queue.clear();
    }

    /// Pairs the next queued task with the longest-idle worker.
    fn next_assignment(&mut self) -> Option<Assignment> {
        let index = loop {
            let i = *self.queue.front()?;
            if self.tasks[i].1 == TaskState::Idle {
                break i;
            }
            self.queue.pop_front();
        };
        let worker = loop {
            let w = self.idle.pop_front()?;
            if self.workers.get(&w) == Some(&WorkerState::Idle) {
                break w;
            }
        };
        self.queue.pop_front();

        let (task, state) = &mut self.tasks[index];
        *state = TaskState::InProgress(worker.clone());
        self.workers.insert(worker.clone(), WorkerState::Busy);
        self.history.push(Transition::Dispatched {
            task: task.id(),
            worker: worker.clone(),
        });
        Some(Assignment {
            index,
            task: task.clone(),
            worker,
        })
    }

    /// Whether `a` is still the live assignment of its task.
    fn is_current(&self, a: &Assignment) -> bool {
        match self.tasks.get(a.index) {
            Some((task, TaskState::InProgress(w))) => *task == a.task && *w == a.worker,
            _ => false,
        }
    }

    fn complete(&mut self, a: &Assignment) {
        if !self.is_current(a) {
            warn!("ignoring stale result of {:?} from {:?}", a.task.id(), a.worker);
            return;
        }
        self.tasks[a.index].1 = TaskState::Completed;
        match self.phase {
            Phase::Map => self.maps_done += 1,
            Phase::Reduce => self.reduces_done += 1,
            Phase::Done => {}
        }
        if let Some(state) = self.workers.get_mut(&a.worker) {
            if *state == WorkerState::Busy {
                *state = WorkerState::Idle;
                self.idle.push_back(a.worker.clone());
            }
        }
        self.history.push(Transition::Completed {
            task: a.task.id(),
            worker: a.worker.clone(),
        });
    }

    fn fail(&mut self, a: &Assignment) {
        self.workers.insert(a.worker.clone(), WorkerState::Dead);
        if !self.is_current(a) {
            return;
        }
        self.tasks[a.index].1 = TaskState::Idle;
        self.queue.push_back(a.index);
        self.history.push(Transition::Failed {
            task: a.task.id(),
            worker: a.worker.clone(),
        });
    }

    fn status(&self) -> Status {
        let mut workers: Vec<_> = self
            .workers
            .iter()
            .map(|(w, s)| (w.clone(), *s))
            .collect();
        workers.sort_by(|a, b| a.0.cmp(&b.0));
        Status {
            phase: self.phase,
            maps_done: self.maps_done,
            reduces_done: self.reduces_done,
            workers,
        }
    }
}

#[derive(Debug, Clone)]
struct MasterServer {
    context: Arc<Mutex<ServerContext>>,
    /// Woken on every registration and dispatch outcome.
    wakeup: Arc<Notify>,
}

impl MasterServer {
    fn lock(&self) -> MutexGuard<'_, ServerContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MasterRpc for MasterServer {
    async fn register(self, _: context::Context, address: PathBuf) {
        info!("worker registered: {:?}", address);
        self.lock().register(address);
        self.wakeup.notify_one();
    }
}

async fn dispatch(server: MasterServer, a: Assignment, timeout: Duration) {
    debug!("dispatching {:?} to {:?}", a.task, a.worker);
    let outcome = rpc::call_task(&a.worker, a.task.clone(), timeout).await;
    {
        let mut c = server.lock();
        match outcome {
            Ok(()) => {
                trace!("{:?} done by {:?}", a.task.id(), a.worker);
                c.complete(&a);
            }
            Err(e) => {
                warn!(
                    "worker {:?} failed {:?}, reassigning: {:#}",
                    a.worker,
                    a.task.id(),
                    e
                );
                c.fail(&a);
            }
        }
    }
    server.wakeup.notify_one();
}

/// Runs both phases to completion, dispatching to whichever workers are idle.
async fn drive(server: MasterServer, job: Job, timeout: Duration, done: watch::Sender<bool>) {
    let phases = [
        (Phase::Map, job.map_tasks()),
        (Phase::Reduce, job.reduce_tasks()),
    ];
    for (phase, tasks) in phases {
        info!("{}: {:?} phase, {} tasks", job.name, phase, tasks.len());
        server.lock().begin_phase(phase, tasks);
        loop {
            let assignment = {
                let mut c = server.lock();
                if c.phase_finished() {
                    c.finish_phase();
                    break;
                }
                c.next_assignment()
            };
            match assignment {
                Some(a) => {
                    tokio::spawn(dispatch(server.clone(), a, timeout));
                }
                None => server.wakeup.notified().await,
            }
        }
    }
    info!("{}: all tasks completed", job.name);
    done.send_replace(true);
}

/// Schedules one job over the workers that register with it.
pub struct Master {
    job: Job,
    config: Config,
    server: MasterServer,
    done_tx: Mutex<Option<watch::Sender<bool>>>,
    done: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Master {
    pub fn new(job: Job, config: Config) -> Result<Self> {
        ensure!(job.n_reduce > 0, "job {} needs at least one reducer", job.name);
        let (done_tx, done) = watch::channel(false);
        Ok(Self {
            job,
            config,
            server: MasterServer {
                context: Arc::new(Mutex::new(ServerContext::new())),
                wakeup: Arc::new(Notify::new()),
            },
            done_tx: Mutex::new(Some(done_tx)),
            done,
            task: Mutex::new(None),
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts listening for registrations and dispatching tasks in the
    /// background. Returns once the socket is bound.
    pub async fn start(&self) -> Result<()> {
        let done_tx = self
            .done_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("master of {} already started", self.job.name))?;

        fs::create_dir_all(&self.config.data_dir)
            .with_context(|| format!("cannot create {:?}", self.config.data_dir))?;
        let address = &self.config.master_address;
        rpc::remove_socket(address)?;
        let mut listener = tarpc::serde_transport::unix::listen(address, Json::default)
            .await
            .with_context(|| format!("cannot listen on {:?}", address))?;
        listener.config_mut().max_frame_length(usize::MAX);
        info!("master of {} listening on {:?}", self.job.name, address);

        let server = self.server.clone();
        let accept = listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .map(move |channel| channel.execute(server.clone().serve()).for_each(rpc::spawn))
            .buffer_unordered(64)
            .for_each(|_| async {});
        let driver = drive(
            self.server.clone(),
            self.job.clone(),
            self.config.dispatch_timeout,
            done_tx,
        );

        // Registrations are still accepted after the job is done, until `close`.
        let handle = tokio::spawn(async move {
            tokio::join!(driver, accept);
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Blocks until every reduce task has completed.
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.done.clone();
        done.wait_for(|d| *d)
            .await
            .map_err(|_| anyhow!("master of {} stopped before finishing", self.job.name))?;
        Ok(())
    }

    /// `start` followed by `wait`.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Merges all reducer outputs into one file sorted by key.
    ///
    /// Fails if the reduce phase has not completed.
    pub fn merge(&self) -> Result<PathBuf> {
        ensure!(
            self.server.lock().phase == Phase::Done,
            "merge of {} requested before every reduce task completed",
            self.job.name
        );
        let path = store::merge(&self.config.data_dir, &self.job.name, self.job.n_reduce)?;
        info!("{}: merged result in {:?}", self.job.name, path);
        Ok(path)
    }

    /// Asks every worker not known to be dead to shut down.
    pub async fn shutdown_workers(&self) {
        let workers: Vec<PathBuf> = self
            .server
            .lock()
            .workers
            .iter()
            .filter(|(_, s)| **s != WorkerState::Dead)
            .map(|(w, _)| w.clone())
            .collect();
        let timeout = self.config.dispatch_timeout;
        let calls = workers.iter().map(|w| async move {
            if let Err(e) = rpc::call_shutdown(w, timeout).await {
                warn!("cannot shut down {:?}: {:#}", w, e);
            }
        });
        future::join_all(calls).await;
    }

    pub fn status(&self) -> Status {
        self.server.lock().status()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.server.lock().history.clone()
    }

    /// Stops accepting registrations and dispatching. Pending `wait` calls
    /// fail if the job had not finished.
    pub fn close(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = rpc::remove_socket(&self.config.master_address) {
                warn!("cannot remove {:?}: {}", self.config.master_address, e);
            }
        }
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.close();
    }
}
