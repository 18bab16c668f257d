//! In-memory port backed by lock-free rings
//!
//! Every receive and transmit queue is a bounded [`ArrayQueue`]. Frames are
//! fed with [`RingPort::inject`] and collected with [`RingPort::take_tx`].
//! A full transmit ring accepts only part of a burst, like a NIC whose
//! descriptor ring is full.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;
use smoltcp::wire::EthernetAddress;

use super::buffer::PoolBuffer;
use super::port::{LinkStatus, PortHandle};
use super::{PortId, QueueId};

pub struct RingPort {
    id: PortId,
    name: String,
    mac: EthernetAddress,
    rx: Vec<ArrayQueue<PoolBuffer>>,
    tx: Vec<ArrayQueue<PoolBuffer>>,
    link_up: AtomicBool,
}

impl RingPort {
    /// Create a port with `ring_size` slots per queue
    ///
    /// The MAC address is locally administered and derived from the id.
    pub fn new(
        id: PortId,
        name: impl Into<String>,
        rx_queues: u16,
        tx_queues: u16,
        ring_size: usize,
    ) -> Self {
        let [hi, lo] = id.to_be_bytes();
        Self {
            id,
            name: name.into(),
            mac: EthernetAddress([0x02, 0x00, 0x00, 0x00, hi, lo]),
            rx: (0..rx_queues.max(1))
                .map(|_| ArrayQueue::new(ring_size.max(1)))
                .collect(),
            tx: (0..tx_queues.max(1))
                .map(|_| ArrayQueue::new(ring_size.max(1)))
                .collect(),
            link_up: AtomicBool::new(true),
        }
    }

    /// Queue a frame for reception on `queue`
    ///
    /// Hands the frame back if the queue is missing or full.
    pub fn inject(&self, queue: QueueId, pkt: PoolBuffer) -> Result<(), PoolBuffer> {
        match self.rx.get(queue as usize) {
            Some(ring) => ring.push(pkt),
            None => Err(pkt),
        }
    }

    /// Remove everything transmitted on `queue`, oldest first
    pub fn take_tx(&self, queue: QueueId) -> Vec<PoolBuffer> {
        let Some(ring) = self.tx.get(queue as usize) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(ring.len());
        while let Some(pkt) = ring.pop() {
            out.push(pkt);
        }
        out
    }

    /// Remove everything transmitted on any queue
    pub fn take_all_tx(&self) -> Vec<PoolBuffer> {
        (0..self.tx.len() as QueueId)
            .flat_map(|q| self.take_tx(q))
            .collect()
    }

    /// Frames waiting on a transmit queue
    pub fn tx_len(&self, queue: QueueId) -> usize {
        self.tx.get(queue as usize).map_or(0, ArrayQueue::len)
    }

    /// Frames waiting on a receive queue
    pub fn rx_pending(&self, queue: QueueId) -> usize {
        self.rx.get(queue as usize).map_or(0, ArrayQueue::len)
    }

    pub fn set_link(&self, up: bool) {
        self.link_up.store(up, Ordering::Relaxed);
    }
}

impl PortHandle for RingPort {
    fn id(&self) -> PortId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mac_addr(&self) -> EthernetAddress {
        self.mac
    }

    fn rx_queue_count(&self) -> u16 {
        self.rx.len() as u16
    }

    fn tx_queue_count(&self) -> u16 {
        self.tx.len() as u16
    }

    fn rx_burst(&self, queue: QueueId, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let Some(ring) = self.rx.get(queue as usize) else {
            return 0;
        };
        let mut received = 0;
        while received < max {
            let Some(mut pkt) = ring.pop() else {
                break;
            };
            pkt.meta_mut().port = self.id;
            pkts.push(pkt);
            received += 1;
        }
        received
    }

    fn tx_burst(&self, queue: QueueId, pkts: &mut Vec<PoolBuffer>) -> usize {
        let Some(ring) = self.tx.get(queue as usize) else {
            return 0;
        };
        // One producer per transmit queue; consumers only shrink the ring, so
        // the free space computed here can't be taken away.
        let accepted = (ring.capacity() - ring.len()).min(pkts.len());
        for pkt in pkts.drain(..accepted) {
            let _ = ring.force_push(pkt);
        }
        accepted
    }

    fn link_status(&self) -> LinkStatus {
        if self.link_up.load(Ordering::Relaxed) {
            LinkStatus::Up {
                speed_mbps: 10_000,
                full_duplex: true,
            }
        } else {
            LinkStatus::Down
        }
    }
}
