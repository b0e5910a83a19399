//! A fault-tolerant MapReduce framework.
//!
//! A [`Master`] splits a job into map and reduce tasks and hands them out over
//! Unix-socket RPC to [`Worker`]s that register with it. Workers exchange
//! intermediate data through files named by the [`store`] convention.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod app;
pub mod config;
mod master;
pub mod rpc;
pub mod sequential;
pub mod store;
mod worker;

pub use config::Config;
pub use master::{Master, Phase, Status, TaskId, Transition, WorkerState};
pub use worker::{Lifecycle, Worker};

/// Service exposed by the master. Workers call it once they are listening.
#[tarpc::service]
pub trait MasterRpc {
    async fn register(address: PathBuf);
}

/// Service exposed by every worker.
#[tarpc::service]
pub trait WorkerRpc {
    /// Runs a task to completion. An `Err` carries the reason the worker gave up.
    async fn do_task(task: Task) -> Result<(), String>;
    async fn shutdown();
}

/// The atomic unit exchanged between map output and reduce input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// User map function: `(filename, content) -> pairs`.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;

/// User reduce function: `(key, values) -> value`.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// A unit of work, self-contained so a worker can run it without other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Map {
        input_file: PathBuf,
        mapper: usize,
        n_reduce: usize,
    },
    Reduce {
        reducer: usize,
        n_map: usize,
    },
}

impl Task {
    pub fn phase(&self) -> Phase {
        match self {
            Task::Map { .. } => Phase::Map,
            Task::Reduce { .. } => Phase::Reduce,
        }
    }

    /// Mapper or reducer index, depending on the variant.
    pub fn index(&self) -> usize {
        match self {
            Task::Map { mapper, .. } => *mapper,
            Task::Reduce { reducer, .. } => *reducer,
        }
    }

    pub fn id(&self) -> TaskId {
        TaskId {
            phase: self.phase(),
            index: self.index(),
        }
    }
}

/// Definition of one MapReduce run.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    /// One map task is created per input file.
    pub inputs: Vec<PathBuf>,
    pub n_reduce: usize,
}

impl Job {
    pub fn new(name: impl Into<String>, inputs: Vec<PathBuf>, n_reduce: usize) -> Self {
        Self {
            name: name.into(),
            inputs,
            n_reduce,
        }
    }

    pub fn n_map(&self) -> usize {
        self.inputs.len()
    }

    pub fn map_tasks(&self) -> Vec<Task> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(mapper, input_file)| Task::Map {
                input_file: input_file.clone(),
                mapper,
                n_reduce: self.n_reduce,
            })
            .collect()
    }

    pub fn reduce_tasks(&self) -> Vec<Task> {
        (0..self.n_reduce)
            .map(|reducer| Task::Reduce {
                reducer,
                n_map: self.n_map(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_enumerates_tasks() {
        let job = Job::new("wc", vec!["a.txt".into(), "b.txt".into()], 3);
        let maps = job.map_tasks();
        assert_eq!(maps.len(), 2);
        assert_eq!(
            maps[1],
            Task::Map {
                input_file: "b.txt".into(),
                mapper: 1,
                n_reduce: 3
            }
        );
        let reduces = job.reduce_tasks();
        assert_eq!(reduces.len(), 3);
        assert!(reduces
            .iter()
            .all(|t| matches!(t, Task::Reduce { n_map: 2, .. })));
        assert_eq!(reduces[2].id(), TaskId { phase: Phase::Reduce, index: 2 });
    }
}
