//! Per-core forwarding workers
//!
//! Each worker is a busy-polling thread that owns:
//! - a fixed set of receive (port, queue) bindings, shared with nobody
//! - one output batch per destination port, all on its own transmit queue
//! - its drain timer and counters
//!
//! Nothing in the loop blocks. Buffer pools are the only state touched by
//! more than one worker.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::batch::TxBatches;
use super::buffer::{PoolBuffer, prefetch};
use super::drain::{CycleClock, DrainTimer, drain_cycles};
use super::port::PortTable;
use super::replicate::{ReplicateError, Replicator};
use super::stats::WorkerStats;
use super::{MAX_PKT_BURST, PREFETCH_OFFSET, PortId, QueueId};

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Worker thread panicked")]
    Panicked,
}

/// A receive queue polled by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RxBinding {
    pub port: PortId,
    pub queue: QueueId,
}

/// Why a worker returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested; pending batches were flushed
    Stopped,
    /// The worker had no receive queues
    NothingToDo,
}

/// Configuration for a worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: usize,
    /// Receive queues, polled in order
    pub rx: Vec<RxBinding>,
    /// Transmit queue used on every port
    pub tx_queue: QueueId,
    /// Frames per receive burst and per output batch
    pub burst: usize,
    /// Timeout drain interval in microseconds
    pub drain_us: u64,
}

pub struct Worker {
    id: usize,
    rx: Vec<RxBinding>,
    ports: Arc<PortTable>,
    replicator: Replicator,
    tx: TxBatches,
    clock: Arc<dyn CycleClock>,
    drain: DrainTimer,
    burst: usize,
    stats: Arc<WorkerStats>,
    shutdown: Arc<AtomicBool>,
    /// Receive scratch, reused across bursts
    rx_pkts: Vec<PoolBuffer>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        ports: Arc<PortTable>,
        replicator: Replicator,
        clock: Arc<dyn CycleClock>,
    ) -> Self {
        let burst = config.burst.clamp(1, MAX_PKT_BURST);
        let stats = Arc::new(WorkerStats::new());
        let tx = TxBatches::new(&ports, config.tx_queue, burst, Arc::clone(&stats));
        let drain = DrainTimer::new(drain_cycles(clock.hz(), config.drain_us), clock.now());

        Self {
            id: config.id,
            rx: config.rx,
            ports,
            replicator,
            tx,
            clock,
            drain,
            burst,
            stats,
            shutdown: Arc::new(AtomicBool::new(false)),
            rx_pkts: Vec::with_capacity(MAX_PKT_BURST),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Flag that ends [`run`](Self::run) when set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Frames waiting in output batches
    pub fn pending(&self) -> usize {
        self.tx.pending()
    }

    /// One pass over all receive queues followed by the drain check
    ///
    /// Returns the number of frames received.
    pub fn poll_once(&mut self) -> usize {
        let mut received = 0;

        for i in 0..self.rx.len() {
            let RxBinding { port, queue } = self.rx[i];
            let Some(dev) = self.ports.get(port) else {
                continue;
            };
            let n = dev.rx_burst(queue, &mut self.rx_pkts, self.burst);
            if n == 0 {
                continue;
            }
            received += n;
            self.forward_burst();
        }

        self.drain_if_due();
        received
    }

    /// Replicate everything in the receive scratch
    fn forward_burst(&mut self) {
        let mut pkts = std::mem::take(&mut self.rx_pkts);
        let n = pkts.len();

        let bytes: usize = pkts.iter().map(PoolBuffer::len).sum();
        self.stats.record_rx(n as u64, bytes as u64);

        let mut ptrs = [std::ptr::null::<u8>(); MAX_PKT_BURST];
        for (slot, pkt) in ptrs.iter_mut().zip(pkts.iter()) {
            *slot = pkt.data_ptr();
        }
        let prefetchable = n.min(MAX_PKT_BURST);

        for &ptr in ptrs.iter().take(PREFETCH_OFFSET.min(prefetchable)) {
            prefetch(ptr);
        }

        for (j, pkt) in pkts.drain(..).enumerate() {
            if j + PREFETCH_OFFSET < prefetchable {
                prefetch(ptrs[j + PREFETCH_OFFSET]);
            }
            self.replicate_one(pkt);
        }

        self.rx_pkts = pkts;
    }

    #[inline]
    fn replicate_one(&mut self, pkt: PoolBuffer) {
        match self.replicator.replicate(pkt, &mut self.tx) {
            Ok(copies) => self.stats.record_replicas(copies as u64),
            Err(ReplicateError::Exhausted { needed }) => {
                trace!(worker_id = self.id, needed, "Header pool exhausted, frame dropped");
                self.stats.record_alloc_failure();
            }
            Err(ReplicateError::Runt(len)) => {
                trace!(worker_id = self.id, len, "Runt frame dropped");
                self.stats.record_runt();
            }
            Err(ReplicateError::Headroom(e)) => {
                debug!(worker_id = self.id, error = %e, "Replica dropped");
                self.stats.record_headroom_error();
            }
        }
    }

    /// Flush every non-empty batch if the drain interval has passed
    ///
    /// Returns whether the interval had passed.
    pub fn drain_if_due(&mut self) -> bool {
        if !self.drain.poll(self.clock.now()) {
            return false;
        }
        let flushed = self.tx.flush_all();
        if flushed > 0 {
            self.stats.record_timeout_flushes(flushed as u64);
        }
        true
    }

    /// Poll until the shutdown flag is set
    pub fn run(mut self) -> WorkerExit {
        if self.rx.is_empty() {
            info!(worker_id = self.id, "Worker has nothing to do");
            return WorkerExit::NothingToDo;
        }

        for binding in &self.rx {
            info!(
                worker_id = self.id,
                port = binding.port,
                queue = binding.queue,
                "Polling receive queue"
            );
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once();
        }

        let flushed = self.tx.flush_all();
        info!(worker_id = self.id, flushed, "Worker stopped");
        WorkerExit::Stopped
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    id: usize,
    thread: Option<JoinHandle<WorkerExit>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<WorkerExit, WorkerError> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| WorkerError::Panicked),
            None => Ok(WorkerExit::Stopped),
        }
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pin the calling thread to `cpu`
pub fn pin_to_cpu(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Run `worker` on its own thread, optionally pinned to `cpu`
pub fn spawn_worker(worker: Worker, cpu: Option<usize>) -> Result<WorkerHandle, WorkerError> {
    let id = worker.id();
    let shutdown = worker.shutdown_flag();
    let stats = Arc::clone(worker.stats());

    let thread = thread::Builder::new()
        .name(format!("mcast-w{id}"))
        .spawn(move || {
            if let Some(cpu) = cpu {
                match pin_to_cpu(cpu) {
                    Ok(()) => debug!(worker_id = id, cpu, "Pinned worker"),
                    Err(e) => warn!(worker_id = id, cpu, error = %e, "Failed to pin worker"),
                }
            }
            worker.run()
        })
        .map_err(WorkerError::Spawn)?;

    Ok(WorkerHandle {
        id,
        thread: Some(thread),
        shutdown,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::drain::{ManualClock, MonotonicClock};
    use crate::dataplane::replicate::StaticPolicy;
    use crate::dataplane::{BufferPool, L2Rewrite, PortMask, RingPort};
    use crate::test_util::{header_pool, packet_pool, ring_ports, test_frame};
    use std::time::{Duration, Instant};

    /// Forward to port 0, mirror to port 2
    fn policy() -> Arc<StaticPolicy> {
        Arc::new(StaticPolicy {
            forward_port: 0,
            mirror_ports: PortMask::single(2),
            rewrite: L2Rewrite::default(),
        })
    }

    fn worker(
        ports: &Arc<PortTable>,
        rx: Vec<RxBinding>,
        hdrs: &Arc<BufferPool>,
        clock: Arc<dyn CycleClock>,
    ) -> Worker {
        Worker::new(
            WorkerConfig {
                id: 0,
                rx,
                tx_queue: 0,
                burst: MAX_PKT_BURST,
                drain_us: 100,
            },
            Arc::clone(ports),
            Replicator::new(Arc::clone(hdrs), policy()),
            clock,
        )
    }

    fn setup() -> (Arc<PortTable>, Vec<Arc<RingPort>>, Arc<BufferPool>, Arc<BufferPool>) {
        let (table, ports) = ring_ports(&[0, 1, 2], 1, 256);
        (table, ports, packet_pool(256), header_pool(256))
    }

    #[test]
    fn test_poll_replicates_and_drains_on_timeout() {
        let (table, ports, pkts, hdrs) = setup();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            Arc::clone(&clock) as Arc<dyn CycleClock>,
        );

        for _ in 0..3 {
            ports[1].inject(0, test_frame(&pkts, 1, 100)).unwrap();
        }

        assert_eq!(w.poll_once(), 3);
        // Below the drain interval nothing leaves the batches
        assert_eq!(w.pending(), 6);
        assert_eq!(ports[0].tx_len(0), 0);

        clock.set(99);
        w.poll_once();
        assert_eq!(w.pending(), 6);

        clock.set(100);
        w.poll_once();
        assert_eq!(w.pending(), 0);
        assert_eq!(ports[0].tx_len(0), 3);
        assert_eq!(ports[2].tx_len(0), 3);
        assert_eq!(ports[1].tx_len(0), 0);

        let snap = w.stats().snapshot();
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.rx_bytes, 300);
        assert_eq!(snap.replicas, 3);
        assert_eq!(snap.tx_packets, 6);
        assert_eq!(snap.timeout_flushes, 2);
    }

    #[test]
    fn test_drain_restarts_without_pending() {
        let (table, ports, pkts, hdrs) = setup();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            Arc::clone(&clock) as Arc<dyn CycleClock>,
        );

        // Drain fires at 100 with nothing pending and restarts the interval
        clock.set(100);
        assert!(w.drain_if_due());

        ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        clock.set(150);
        w.poll_once();
        assert_eq!(w.pending(), 2);

        clock.set(200);
        w.poll_once();
        assert_eq!(w.pending(), 0);
    }

    #[test]
    fn test_full_burst_flushes_without_drain() {
        let (table, ports, pkts, hdrs) = setup();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            clock as Arc<dyn CycleClock>,
        );

        for _ in 0..MAX_PKT_BURST {
            ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        }
        assert_eq!(w.poll_once(), MAX_PKT_BURST);

        assert_eq!(ports[0].tx_len(0), MAX_PKT_BURST);
        assert_eq!(ports[2].tx_len(0), MAX_PKT_BURST);
        assert_eq!(w.stats().snapshot().full_flushes, 2);
    }

    #[test]
    fn test_exhaustion_drops_and_recovers() {
        let (table, ports, pkts, _) = setup();
        let hdrs = header_pool(1);
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            Arc::clone(&clock) as Arc<dyn CycleClock>,
        );

        ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        w.poll_once();

        // Second frame found the header pool empty and was dropped whole
        assert_eq!(w.pending(), 2);
        assert_eq!(w.stats().snapshot().alloc_failures, 1);

        clock.set(100);
        w.poll_once();
        drop(ports[2].take_tx(0));
        assert_eq!(hdrs.available(), 1);

        ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        w.poll_once();
        assert_eq!(w.pending(), 2);
        assert_eq!(w.stats().snapshot().alloc_failures, 1);
    }

    #[test]
    fn test_runt_counted() {
        let (table, ports, pkts, hdrs) = setup();
        let mut w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            Arc::new(ManualClock::new(1_000_000)),
        );

        let mut runt = pkts.alloc().unwrap();
        runt.append(&[0u8; 8]).unwrap();
        ports[1].inject(0, runt).unwrap();
        w.poll_once();

        assert_eq!(w.stats().snapshot().runt, 1);
        assert_eq!(w.pending(), 0);
        assert_eq!(pkts.in_use(), 0);
    }

    #[test]
    fn test_nothing_to_do() {
        let (table, _ports, _pkts, hdrs) = setup();
        let w = worker(&table, Vec::new(), &hdrs, Arc::new(ManualClock::new(1)));
        assert_eq!(w.run(), WorkerExit::NothingToDo);
    }

    #[test]
    fn test_shutdown_flushes_pending() {
        let (table, ports, pkts, hdrs) = setup();
        let mut w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            Arc::new(ManualClock::new(1_000_000)),
        );

        ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        w.poll_once();
        assert_eq!(w.pending(), 2);

        w.shutdown_flag().store(true, Ordering::SeqCst);
        assert_eq!(w.run(), WorkerExit::Stopped);
        assert_eq!(ports[0].tx_len(0), 1);
        assert_eq!(ports[2].tx_len(0), 1);
    }

    #[test]
    fn test_spawned_worker_forwards_and_stops() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (table, ports, pkts, hdrs) = setup();
        let w = worker(
            &table,
            vec![RxBinding { port: 1, queue: 0 }],
            &hdrs,
            Arc::new(MonotonicClock::new()),
        );
        let handle = spawn_worker(w, None).unwrap();
        assert_eq!(handle.id(), 0);

        for _ in 0..10 {
            ports[1].inject(0, test_frame(&pkts, 1, 64)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while ports[0].tx_len(0) < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ports[0].tx_len(0), 10);
        assert_eq!(ports[2].tx_len(0), 10);
        assert!(handle.is_running());

        let stats = Arc::clone(handle.stats());
        handle.stop();
        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
        assert_eq!(stats.snapshot().rx_packets, 10);
    }
}
