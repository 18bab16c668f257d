//! Per-port output batching
//!
//! Outgoing frames are collected per destination port and handed to the port
//! in bursts. A batch is flushed as soon as it is full, or by the timeout
//! drain. Whatever the port doesn't accept is released; there is no retry.

use std::sync::Arc;

use tracing::trace;

use super::buffer::PoolBuffer;
use super::port::{PortHandle, PortTable};
use super::stats::WorkerStats;
use super::{MAX_PORTS, PortId, QueueId};

/// Destination for outgoing frames
pub trait PacketSink {
    /// Take ownership of `pkt` for transmission on `port`
    fn enqueue(&mut self, port: PortId, pkt: PoolBuffer);
}

/// Result of flushing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Frames accepted by the port
    pub sent: usize,
    /// Bytes accepted by the port
    pub sent_bytes: usize,
    /// Frames released because the port didn't accept them
    pub dropped: usize,
}

/// Frames waiting for one (port, queue)
pub struct OutputBatch {
    port: PortId,
    queue: QueueId,
    pkts: Vec<PoolBuffer>,
    capacity: usize,
}

impl OutputBatch {
    pub fn new(port: PortId, queue: QueueId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            port,
            queue,
            pkts: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.pkts.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame; returns true if the batch is now full
    ///
    /// A full batch must be flushed before the next push.
    #[inline]
    pub fn push(&mut self, pkt: PoolBuffer) -> bool {
        debug_assert!(!self.is_full());
        self.pkts.push(pkt);
        self.is_full()
    }

    /// Transmit the whole batch on `dev`
    ///
    /// Frames the port doesn't accept are released. The batch is empty
    /// afterwards.
    pub fn flush(&mut self, dev: &dyn PortHandle) -> FlushOutcome {
        if self.pkts.is_empty() {
            return FlushOutcome::default();
        }

        let total = self.pkts.len();
        let total_bytes: usize = self.pkts.iter().map(PoolBuffer::len).sum();

        let sent = dev.tx_burst(self.queue, &mut self.pkts).min(total);

        let dropped = self.pkts.len();
        let dropped_bytes: usize = self.pkts.iter().map(PoolBuffer::len).sum();
        self.pkts.clear();

        if dropped > 0 {
            trace!(port = self.port, queue = self.queue, sent, dropped, "Partial transmit");
        }

        FlushOutcome {
            sent,
            sent_bytes: total_bytes - dropped_bytes,
            dropped,
        }
    }
}

struct PortSlot {
    batch: OutputBatch,
    dev: Arc<dyn PortHandle>,
}

/// One worker's output batches, indexed by destination port
pub struct TxBatches {
    slots: Vec<Option<PortSlot>>,
    stats: Arc<WorkerStats>,
}

impl TxBatches {
    /// Batches of `capacity` frames for every port in `ports`, all on `queue`
    pub fn new(
        ports: &PortTable,
        queue: QueueId,
        capacity: usize,
        stats: Arc<WorkerStats>,
    ) -> Self {
        let mut slots: Vec<Option<PortSlot>> = (0..MAX_PORTS).map(|_| None).collect();
        for dev in ports.iter() {
            slots[dev.id() as usize] = Some(PortSlot {
                batch: OutputBatch::new(dev.id(), queue, capacity),
                dev: Arc::clone(dev),
            });
        }
        Self { slots, stats }
    }

    /// Queue `pkt` on `port`, flushing the batch when it fills up
    #[inline]
    pub fn append(&mut self, port: PortId, pkt: PoolBuffer) {
        let Some(slot) = self.slots.get_mut(port as usize).and_then(Option::as_mut) else {
            trace!(port, "No output batch for port, dropping frame");
            self.stats.record_no_port();
            return;
        };
        if slot.batch.push(pkt) {
            self.stats.record_full_flush();
            flush_slot(slot, &self.stats);
        }
    }

    /// Flush every non-empty batch; returns how many were flushed
    pub fn flush_all(&mut self) -> usize {
        let mut flushed = 0;
        for slot in self.slots.iter_mut().flatten() {
            if !slot.batch.is_empty() {
                flush_slot(slot, &self.stats);
                flushed += 1;
            }
        }
        flushed
    }

    /// Frames waiting across all batches
    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().map(|s| s.batch.len()).sum()
    }

    pub fn batch(&self, port: PortId) -> Option<&OutputBatch> {
        self.slots
            .get(port as usize)
            .and_then(Option::as_ref)
            .map(|s| &s.batch)
    }
}

impl PacketSink for TxBatches {
    #[inline]
    fn enqueue(&mut self, port: PortId, pkt: PoolBuffer) {
        self.append(port, pkt);
    }
}

fn flush_slot(slot: &mut PortSlot, stats: &WorkerStats) {
    let outcome = slot.batch.flush(slot.dev.as_ref());
    stats.record_tx(outcome.sent as u64, outcome.sent_bytes as u64);
    if outcome.dropped > 0 {
        stats.record_tx_dropped(outcome.dropped as u64);
    }
}
