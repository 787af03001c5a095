//! Process-wide shared state, owned explicitly and passed by `Arc`.
//!
//! Holds the integration lock (every ref-mutating git sequence), the port
//! pool, the registry of running agent processes and the shutdown flag.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::io::config::RelayConfig;
use crate::io::supervisor::AgentHandle;

#[derive(Debug)]
pub struct Coordinator {
    integration: Mutex<()>,
    ports: PortPool,
    processes: Mutex<HashMap<String, Arc<AgentHandle>>>,
    shutdown: AtomicBool,
}

impl Coordinator {
    pub fn new(config: &RelayConfig) -> Self {
        let ports = if config.ports.enabled {
            PortPool::new(config.ports.start, config.ports.end)
        } else {
            PortPool::empty()
        };
        Self {
            integration: Mutex::new(()),
            ports,
            processes: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Serialize a repository-ref-mutating sequence against all others.
    pub fn integration_lock(&self) -> MutexGuard<'_, ()> {
        self.integration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn register(&self, handle: Arc<AgentHandle>) {
        let mut table = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        if table
            .insert(handle.task_id().to_string(), Arc::clone(&handle))
            .is_some()
        {
            warn!(task_id = handle.task_id(), "replaced a registered process handle");
        }
    }

    pub fn unregister(&self, task_id: &str) -> Option<Arc<AgentHandle>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
    }

    /// Snapshot of running handles; the table lock is not held while signalling.
    pub fn active_processes(&self) -> Vec<Arc<AgentHandle>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Fixed range of ports handed out lowest-first.
#[derive(Debug)]
pub struct PortPool {
    free: Arc<Mutex<BTreeSet<u16>>>,
    capacity: usize,
}

/// A leased port; returned to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    free: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        let free: BTreeSet<u16> = (start..=end).collect();
        let capacity = free.len();
        Self {
            free: Arc::new(Mutex::new(free)),
            capacity,
        }
    }

    pub fn empty() -> Self {
        Self {
            free: Arc::new(Mutex::new(BTreeSet::new())),
            capacity: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Lease the lowest free port, or `None` when the pool is exhausted.
    pub fn lease(&self) -> Option<PortLease> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let port = free.pop_first()?;
        debug!(port, remaining = free.len(), "port leased");
        Some(PortLease {
            port,
            free: Arc::clone(&self.free),
        })
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.insert(self.port);
        debug!(port = self.port, "port released");
    }
}
