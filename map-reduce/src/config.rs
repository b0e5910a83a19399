//! Runtime settings shared by master and workers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rpc::RetryPolicy;

/// Where files and sockets live, and how long to wait on peers.
///
/// Master and workers of one job must agree on `data_dir` and
/// `master_address`; the rest may differ per process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Partition files and job outputs.
    pub data_dir: PathBuf,
    /// Directory in which workers create their sockets.
    pub socket_dir: PathBuf,
    pub master_address: PathBuf,
    /// Upper bound on a single task dispatch, after which the worker is
    /// declared dead.
    pub dispatch_timeout: Duration,
    pub registration: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            data_dir: tmp.clone(),
            master_address: tmp.join("mr-master.sock"),
            socket_dir: tmp,
            dispatch_timeout: Duration::from_secs(30),
            registration: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Puts data, sockets and the master socket under one directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            data_dir: dir.to_owned(),
            socket_dir: dir.to_owned(),
            master_address: dir.join("mr-master.sock"),
            ..Self::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_master_address(mut self, address: impl Into<PathBuf>) -> Self {
        self.master_address = address.into();
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_registration(mut self, policy: RetryPolicy) -> Self {
        self.registration = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir() {
        let c = Config::in_dir("/srv/mr").with_dispatch_timeout(Duration::from_millis(500));
        assert_eq!(c.data_dir, PathBuf::from("/srv/mr"));
        assert_eq!(c.master_address, PathBuf::from("/srv/mr/mr-master.sock"));
        assert_eq!(c.dispatch_timeout, Duration::from_millis(500));
        assert_eq!(c.registration.max_attempts, 40);
    }
}
