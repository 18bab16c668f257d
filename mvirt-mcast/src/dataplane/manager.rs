//! Data plane lifecycle
//!
//! Builds one worker per queue assignment, starts them on their own threads
//! and stops them again.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::buffer::BufferPool;
use super::drain::CycleClock;
use super::port::PortTable;
use super::replicate::{ReplicationPolicy, Replicator};
use super::stats::{WorkerStats, WorkerStatsSnapshot};
use super::worker::{
    RxBinding, Worker, WorkerConfig, WorkerError, WorkerExit, WorkerHandle, spawn_worker,
};
use super::{MAX_TX_QUEUE_PER_PORT, PortId, QueueId};

/// Data plane startup errors
#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("{0} workers requested, at most {MAX_TX_QUEUE_PER_PORT} supported")]
    TooManyWorkers(usize),

    #[error("Port {0} is not enabled")]
    UnknownPort(PortId),

    #[error("Port {port} has no receive queue {queue}")]
    NoSuchQueue { port: PortId, queue: QueueId },

    #[error("Port {port} has {have} transmit queues, {need} workers need one each")]
    NotEnoughTxQueues { port: PortId, have: u16, need: usize },

    #[error("Receive queue {queue} of port {port} is assigned to more than one worker")]
    DuplicateBinding { port: PortId, queue: QueueId },

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// What the data plane is started with
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Receive queues of each worker; the index is the worker id
    pub assignments: Vec<Vec<RxBinding>>,
    /// CPU of each worker; workers without an entry aren't pinned
    pub cpus: Vec<usize>,
    pub burst: usize,
    pub drain_us: u64,
}

/// Running workers
pub struct DataPlane {
    workers: Vec<WorkerHandle>,
    /// Counters of every worker started, kept after the workers are joined
    stats: Vec<Arc<WorkerStats>>,
}

impl DataPlane {
    /// Validate `launch` against `ports` and start every worker
    ///
    /// Worker `i` transmits on queue `i` of every port.
    pub fn start(
        launch: LaunchConfig,
        ports: Arc<PortTable>,
        header_pool: Arc<BufferPool>,
        policy: Arc<dyn ReplicationPolicy>,
        clock: Arc<dyn CycleClock>,
    ) -> Result<Self, DataPlaneError> {
        check_launch(&launch, &ports)?;

        let mut workers = Vec::with_capacity(launch.assignments.len());
        for (id, rx) in launch.assignments.into_iter().enumerate() {
            let worker = Worker::new(
                WorkerConfig {
                    id,
                    rx,
                    tx_queue: id as QueueId,
                    burst: launch.burst,
                    drain_us: launch.drain_us,
                },
                Arc::clone(&ports),
                Replicator::new(Arc::clone(&header_pool), Arc::clone(&policy)),
                Arc::clone(&clock),
            );
            let cpu = launch.cpus.get(id).copied();
            // Workers already started are stopped when `workers` drops
            workers.push(spawn_worker(worker, cpu)?);
        }

        info!(workers = workers.len(), "Data plane started");
        let stats = workers.iter().map(|w| Arc::clone(w.stats())).collect();
        Ok(Self { workers, stats })
    }

    pub fn worker_count(&self) -> usize {
        self.stats.len()
    }

    pub fn is_running(&self) -> bool {
        self.workers.iter().any(WorkerHandle::is_running)
    }

    /// Counters of each worker
    pub fn stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    /// Counters summed over all workers
    pub fn total_stats(&self) -> WorkerStatsSnapshot {
        self.stats.iter().map(|s| s.snapshot()).sum()
    }

    /// Signal all workers to stop
    pub fn stop_all(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Stop all workers and wait for them
    ///
    /// Counters stay readable afterwards.
    pub fn join(&mut self) -> Result<Vec<WorkerExit>, DataPlaneError> {
        self.stop_all();
        let mut exits = Vec::with_capacity(self.workers.len());
        let mut failure = None;
        for worker in std::mem::take(&mut self.workers) {
            let id = worker.id();
            match worker.join() {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    warn!(worker_id = id, error = %e, "Worker failed");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(exits),
        }
    }
}

fn check_launch(launch: &LaunchConfig, ports: &PortTable) -> Result<(), DataPlaneError> {
    let n_workers = launch.assignments.len();
    if n_workers > MAX_TX_QUEUE_PER_PORT {
        return Err(DataPlaneError::TooManyWorkers(n_workers));
    }

    for dev in ports.iter() {
        if (dev.tx_queue_count() as usize) < n_workers {
            return Err(DataPlaneError::NotEnoughTxQueues {
                port: dev.id(),
                have: dev.tx_queue_count(),
                need: n_workers,
            });
        }
    }

    let mut seen = HashSet::new();
    for binding in launch.assignments.iter().flatten() {
        let dev = ports
            .get(binding.port)
            .ok_or(DataPlaneError::UnknownPort(binding.port))?;
        if binding.queue >= dev.rx_queue_count() {
            return Err(DataPlaneError::NoSuchQueue {
                port: binding.port,
                queue: binding.queue,
            });
        }
        if !seen.insert((binding.port, binding.queue)) {
            return Err(DataPlaneError::DuplicateBinding {
                port: binding.port,
                queue: binding.queue,
            });
        }
    }

    Ok(())
}
