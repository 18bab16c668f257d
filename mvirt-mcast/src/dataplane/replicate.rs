//! Frame replication
//!
//! Every received frame is copied once per mirror port into a buffer from the
//! header pool. The copies and the original get their Ethernet header
//! rewritten, then the copies go to the mirror ports in ascending order and
//! the original goes to its forward port.
//!
//! A frame is either replicated completely or dropped completely: all header
//! buffers are allocated and filled before anything is handed to the sink.

use std::sync::Arc;

use smoltcp::wire::ETHERNET_HEADER_LEN;
use thiserror::Error;

use super::batch::PacketSink;
use super::buffer::{BufferError, BufferPool, PoolBuffer};
use super::ether::{L2Rewrite, rewrite_l2};
use super::port::PortMask;
use super::{MAX_PORTS, PortId};

/// Why a frame was dropped instead of replicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplicateError {
    #[error("frame of {0} bytes is shorter than an Ethernet header")]
    Runt(usize),

    #[error("header pool exhausted ({needed} buffers needed)")]
    Exhausted { needed: usize },

    #[error("replica does not fit into header buffer: {0}")]
    Headroom(BufferError),
}

/// Chooses where a frame goes and how its header is rewritten
pub trait ReplicationPolicy: Send + Sync {
    /// Port the original frame is forwarded to
    fn forward_port(&self, pkt: &PoolBuffer) -> PortId;

    /// Ports that receive a copy
    fn mirror_ports(&self, pkt: &PoolBuffer) -> PortMask;

    /// Addresses written into frames leaving on `port`
    fn rewrite(&self, port: PortId) -> L2Rewrite;
}

/// Same destinations and addresses for every frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPolicy {
    pub forward_port: PortId,
    pub mirror_ports: PortMask,
    pub rewrite: L2Rewrite,
}

impl StaticPolicy {
    /// Forward to port 0, mirror to port 3, both addresses set to
    /// [`REFERENCE_MAC`](super::ether::REFERENCE_MAC)
    pub fn reference() -> Self {
        Self {
            forward_port: 0,
            mirror_ports: PortMask::single(3),
            rewrite: L2Rewrite::default(),
        }
    }
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self::reference()
    }
}

impl ReplicationPolicy for StaticPolicy {
    #[inline]
    fn forward_port(&self, _pkt: &PoolBuffer) -> PortId {
        self.forward_port
    }

    #[inline]
    fn mirror_ports(&self, _pkt: &PoolBuffer) -> PortMask {
        self.mirror_ports
    }

    #[inline]
    fn rewrite(&self, _port: PortId) -> L2Rewrite {
        self.rewrite
    }
}

pub struct Replicator {
    header_pool: Arc<BufferPool>,
    policy: Arc<dyn ReplicationPolicy>,
    /// Header buffers of the frame in progress
    headers: Vec<PoolBuffer>,
}

impl Replicator {
    pub fn new(header_pool: Arc<BufferPool>, policy: Arc<dyn ReplicationPolicy>) -> Self {
        Self {
            header_pool,
            policy,
            headers: Vec::with_capacity(MAX_PORTS),
        }
    }

    /// Replicate `pkt` into `sink`
    ///
    /// Returns the number of copies made (the original excluded). On error
    /// nothing was enqueued and every buffer, `pkt` included, is released.
    pub fn replicate<S: PacketSink + ?Sized>(
        &mut self,
        mut pkt: PoolBuffer,
        sink: &mut S,
    ) -> Result<usize, ReplicateError> {
        if pkt.len() < ETHERNET_HEADER_LEN {
            return Err(ReplicateError::Runt(pkt.len()));
        }

        let mirrors = self.policy.mirror_ports(&pkt);
        let copies = mirrors.count();

        self.header_pool
            .alloc_bulk(copies, &mut self.headers)
            .map_err(|_| ReplicateError::Exhausted { needed: copies })?;

        let forward = self.policy.forward_port(&pkt);
        if let Err(e) = self.prepare(&mut pkt, mirrors, forward) {
            self.headers.clear();
            return Err(e);
        }

        for (port, header) in mirrors.iter().zip(self.headers.drain(..)) {
            sink.enqueue(port, header);
        }
        sink.enqueue(forward, pkt);

        Ok(copies)
    }

    /// Fill the allocated header buffers and rewrite every outgoing frame
    fn prepare(
        &mut self,
        pkt: &mut PoolBuffer,
        mirrors: PortMask,
        forward: PortId,
    ) -> Result<(), ReplicateError> {
        for (port, header) in mirrors.iter().zip(self.headers.iter_mut()) {
            header.copy_from(pkt).map_err(ReplicateError::Headroom)?;
            rewrite_l2(header, &self.policy.rewrite(port))
                .map_err(|_| ReplicateError::Runt(header.len()))?;
        }
        rewrite_l2(pkt, &self.policy.rewrite(forward))
            .map_err(|_| ReplicateError::Runt(pkt.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::ether::REFERENCE_MAC;
    use crate::dataplane::PoolConfig;
    use crate::test_util::{header_pool, packet_pool, test_frame};
    use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};

    /// Sink that records everything in enqueue order
    #[derive(Default)]
    struct VecSink(Vec<(PortId, PoolBuffer)>);

    impl PacketSink for VecSink {
        fn enqueue(&mut self, port: PortId, pkt: PoolBuffer) {
            self.0.push((port, pkt));
        }
    }

    fn policy(forward: PortId, mirrors: u32) -> Arc<dyn ReplicationPolicy> {
        Arc::new(StaticPolicy {
            forward_port: forward,
            mirror_ports: PortMask::new(mirrors),
            rewrite: L2Rewrite::default(),
        })
    }

    fn assert_rewritten(buf: &PoolBuffer, rewrite: &L2Rewrite) {
        let frame = EthernetFrame::new_checked(buf.data()).unwrap();
        assert_eq!(frame.dst_addr(), rewrite.dst);
        assert_eq!(frame.src_addr(), rewrite.src);
        assert_eq!(frame.ethertype(), EthernetProtocol::Ipv4);
    }

    #[test]
    fn test_reference_policy() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(4);
        let mut replicator = Replicator::new(Arc::clone(&hdrs), Arc::new(StaticPolicy::reference()));
        let mut sink = VecSink::default();

        let copies = replicator
            .replicate(test_frame(&pkts, 1, 128), &mut sink)
            .unwrap();

        assert_eq!(copies, 1);
        let ports: Vec<PortId> = sink.0.iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![3, 0]);
        for (_, buf) in &sink.0 {
            assert_rewritten(buf, &L2Rewrite::symmetric(REFERENCE_MAC));
        }
        assert_eq!(hdrs.in_use(), 1);
        assert_eq!(pkts.in_use(), 1);
    }

    #[test]
    fn test_mirror_copy_is_independent() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(4);
        let mut replicator = Replicator::new(Arc::clone(&hdrs), policy(0, 0b100));
        let mut sink = VecSink::default();

        let original = test_frame(&pkts, 1, 100);
        let expected_tail = original.data()[ETHERNET_HEADER_LEN..].to_vec();
        replicator.replicate(original, &mut sink).unwrap();

        assert_eq!(sink.0.len(), 2);
        let (forward_port, mut forwarded) = sink.0.pop().unwrap();
        let (mirror_port, replica) = sink.0.pop().unwrap();
        assert_eq!(forward_port, 0);
        assert_eq!(mirror_port, 2);
        assert_eq!(forwarded.len(), 100);
        assert_eq!(replica.len(), 100);
        assert_eq!(replica.data(), forwarded.data());
        assert_eq!(&replica.data()[ETHERNET_HEADER_LEN..], &expected_tail[..]);
        assert!(Arc::ptr_eq(replica.pool(), &hdrs));

        // Changing the original leaves the replica alone
        forwarded.data_mut()[50] ^= 0xff;
        assert_ne!(replica.data(), forwarded.data());
        assert_eq!(&replica.data()[ETHERNET_HEADER_LEN..], &expected_tail[..]);
    }

    #[test]
    fn test_metadata_copied() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(4);
        let mut replicator = Replicator::new(hdrs, policy(0, 0b10));
        let mut sink = VecSink::default();

        let mut original = test_frame(&pkts, 5, 80);
        {
            let meta = original.meta_mut();
            meta.vlan_tci = 100;
            meta.vlan_tci_outer = 200;
            meta.ol_flags = 0xdead;
            meta.tx_offload = 0xbeef;
            meta.hash = 0x1234_5678;
            meta.flags = 7;
        }
        let meta = *original.meta();
        replicator.replicate(original, &mut sink).unwrap();

        assert_eq!(sink.0[0].1.meta(), &meta);
        assert_eq!(sink.0[1].1.meta(), &meta);
    }

    #[test]
    fn test_mirrors_in_ascending_order() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(8);
        let mut replicator = Replicator::new(Arc::clone(&hdrs), policy(1, 0b1010_1000));
        let mut sink = VecSink::default();

        let copies = replicator
            .replicate(test_frame(&pkts, 0, 64), &mut sink)
            .unwrap();

        assert_eq!(copies, 3);
        let ports: Vec<PortId> = sink.0.iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![3, 5, 7, 1]);
        assert_eq!(hdrs.in_use(), 3);
    }

    #[test]
    fn test_per_port_rewrite() {
        struct PerPort;
        impl ReplicationPolicy for PerPort {
            fn forward_port(&self, _pkt: &PoolBuffer) -> PortId {
                0
            }
            fn mirror_ports(&self, _pkt: &PoolBuffer) -> PortMask {
                PortMask::new(0b110)
            }
            fn rewrite(&self, port: PortId) -> L2Rewrite {
                L2Rewrite {
                    dst: EthernetAddress([0x02, 0, 0, 0, 0, port as u8]),
                    src: REFERENCE_MAC,
                }
            }
        }

        let pkts = packet_pool(4);
        let mut replicator = Replicator::new(header_pool(4), Arc::new(PerPort));
        let mut sink = VecSink::default();
        replicator
            .replicate(test_frame(&pkts, 3, 64), &mut sink)
            .unwrap();

        for (port, buf) in &sink.0 {
            assert_rewritten(buf, &PerPort.rewrite(*port));
        }
    }

    #[test]
    fn test_no_mirrors_forwards_original() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(4);
        let mut replicator = Replicator::new(Arc::clone(&hdrs), policy(2, 0));
        let mut sink = VecSink::default();

        assert_eq!(
            replicator.replicate(test_frame(&pkts, 0, 64), &mut sink).unwrap(),
            0
        );
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].0, 2);
        assert_eq!(hdrs.in_use(), 0);
    }

    #[test]
    fn test_exhaustion_drops_whole_frame() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(1);
        let mut replicator = Replicator::new(Arc::clone(&hdrs), policy(0, 0b1100));
        let mut sink = VecSink::default();

        let err = replicator
            .replicate(test_frame(&pkts, 1, 64), &mut sink)
            .unwrap_err();
        assert_eq!(err, ReplicateError::Exhausted { needed: 2 });
        assert!(sink.0.is_empty());
        assert_eq!(hdrs.available(), 1);
        assert_eq!(pkts.in_use(), 0);

        // The next frame is unaffected once buffers are available again
        let mut replicator = Replicator::new(Arc::clone(&hdrs), policy(0, 0b1000));
        assert_eq!(
            replicator.replicate(test_frame(&pkts, 1, 64), &mut sink).unwrap(),
            1
        );
        assert_eq!(sink.0.len(), 2);
    }

    #[test]
    fn test_runt_dropped_before_allocation() {
        let pkts = packet_pool(4);
        let hdrs = header_pool(4);
        let mut replicator = Replicator::new(Arc::clone(&hdrs), policy(0, 0b1000));
        let mut sink = VecSink::default();

        let mut runt = pkts.alloc().unwrap();
        runt.append(&[0xaa; 13]).unwrap();

        assert_eq!(
            replicator.replicate(runt, &mut sink).unwrap_err(),
            ReplicateError::Runt(13)
        );
        assert!(sink.0.is_empty());
        assert_eq!(hdrs.in_use(), 0);
        assert_eq!(pkts.in_use(), 0);
    }

    #[test]
    fn test_insufficient_headroom_is_an_error() {
        let pkts = packet_pool(4);
        let small = Arc::new(BufferPool::new(PoolConfig::header("small-hdr", 4, 64)).unwrap());
        let mut replicator = Replicator::new(Arc::clone(&small), policy(0, 0b1010));
        let mut sink = VecSink::default();

        let err = replicator
            .replicate(test_frame(&pkts, 1, 100), &mut sink)
            .unwrap_err();
        assert_eq!(
            err,
            ReplicateError::Headroom(BufferError::InsufficientHeadroom {
                needed: 100,
                available: 64
            })
        );
        assert!(sink.0.is_empty());
        assert_eq!(small.in_use(), 0);
        assert_eq!(pkts.in_use(), 0);

        // Nothing of the failed frame is left behind for the next one
        assert_eq!(
            replicator.replicate(test_frame(&pkts, 1, 60), &mut sink).unwrap(),
            2
        );
        let ports: Vec<PortId> = sink.0.iter().map(|(port, _)| *port).collect();
        assert_eq!(ports, vec![1, 3, 0]);
        for (_, buf) in &sink.0 {
            assert_eq!(buf.len(), 60);
            assert_rewritten(buf, &L2Rewrite::default());
        }
        assert_eq!(small.in_use(), 2);
    }
}
