//! Test utilities for driving the data plane without real devices
//!
//! Small buffer pools, frame builders and ring-port tables shared by the
//! unit tests and the integration tests.

pub mod packets;

pub use packets::{
    CLIENT_MAC, ETHERNET_HDR_SIZE, MULTICAST_MAC, build_udp_frame, frame_of_len, test_frame,
};

use std::sync::Arc;

use crate::dataplane::buffer::DEFAULT_DATA_ROOM;
use crate::dataplane::{BufferPool, PortHandle, PortId, PortTable, PoolConfig, RingPort};

/// Receive pool with `count` default-sized buffers
pub fn packet_pool(count: usize) -> Arc<BufferPool> {
    Arc::new(
        BufferPool::new(PoolConfig::packet("test-pkt", count, DEFAULT_DATA_ROOM))
            .expect("Failed to create packet pool"),
    )
}

/// Header pool able to hold any frame of the packet pool
pub fn header_pool(count: usize) -> Arc<BufferPool> {
    Arc::new(
        BufferPool::new(PoolConfig::header("test-hdr", count, DEFAULT_DATA_ROOM))
            .expect("Failed to create header pool"),
    )
}

/// Ring ports with the given ids, all registered in one table
///
/// Each port gets `queues` receive and transmit queues of `ring_size` slots.
pub fn ring_ports(
    ids: &[PortId],
    queues: u16,
    ring_size: usize,
) -> (Arc<PortTable>, Vec<Arc<RingPort>>) {
    let mut table = PortTable::new();
    let mut ports = Vec::with_capacity(ids.len());
    for &id in ids {
        let port = Arc::new(RingPort::new(id, format!("ring{id}"), queues, queues, ring_size));
        table
            .insert(Arc::clone(&port) as Arc<dyn PortHandle>)
            .expect("Failed to register ring port");
        ports.push(port);
    }
    (Arc::new(table), ports)
}
