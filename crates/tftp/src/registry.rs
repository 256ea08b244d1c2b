//! Worker registry
//!
//! Transfers and error replies run as independent tokio tasks. The registry
//! records each one while it is alive so that stuck transfers can be listed
//! instead of silently holding a port and a file handle.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::protocol::TftpErrorCode;

pub type WorkerId = u64;

/// What a worker is doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    /// Serving a file to a client
    Transfer { filename: String },
    /// Sending a single ERROR packet
    ErrorReply { code: TftpErrorCode },
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer { filename } => write!(f, "transfer of '{}'", filename),
            Self::ErrorReply { code } => write!(f, "error reply {}", code.as_u16()),
        }
    }
}

/// Snapshot of a live worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub peer: SocketAddr,
    pub local_port: u16,
    pub started: Instant,
}

impl WorkerInfo {
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: WorkerId,
    workers: HashMap<WorkerId, WorkerInfo>,
}

/// Shared, cloneable registry of running workers
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

/// Removes its worker from the registry when dropped, including on panic
struct Registration {
    registry: WorkerRegistry,
    id: WorkerId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().workers.remove(&self.id);
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, kind: WorkerKind, peer: SocketAddr, local_port: u16) -> Registration {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.workers.insert(
            id,
            WorkerInfo {
                id,
                kind,
                peer,
                local_port,
                started: Instant::now(),
            },
        );

        Registration {
            registry: self.clone(),
            id,
        }
    }

    /// Spawn `task` on the tokio runtime and track it until it finishes
    ///
    /// Failures are logged here; they never propagate to the caller.
    pub fn spawn<F>(&self, kind: WorkerKind, peer: SocketAddr, local_port: u16, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let registration = self.register(kind.clone(), peer, local_port);

        tokio::spawn(async move {
            let _registration = registration;
            match task.await {
                Ok(()) => tracing::debug!("{} for {} on port {} finished", kind, peer, local_port),
                Err(e) => tracing::warn!("{} for {} on port {} failed: {:#}", kind, peer, local_port, e),
            }
        })
    }

    /// All live workers, oldest first
    pub fn active(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<_> = self.lock().workers.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    /// Live workers that have been running for longer than `older_than`
    pub fn stalled(&self, older_than: Duration) -> Vec<WorkerInfo> {
        self.active().into_iter().filter(|w| w.age() > older_than).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
