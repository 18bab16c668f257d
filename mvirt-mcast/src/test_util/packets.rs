//! Frame builders for tests
//!
//! Uses smoltcp for frame construction, matching the rewrite path.

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::dataplane::{BufferPool, PoolBuffer, PortId};

// ============================================================================
// Constants
// ============================================================================

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// Sender MAC used by test frames
pub const CLIENT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// IPv4 multicast MAC for 239.1.1.1
pub const MULTICAST_MAC: [u8; 6] = [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01];

// ============================================================================
// Builders
// ============================================================================

/// Build an Ethernet/IPv4/UDP multicast frame carrying `payload`
pub fn build_udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let ip_len = IP_HDR_SIZE + udp_len;
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + ip_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(CLIENT_MAC),
        dst_addr: EthernetAddress(MULTICAST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::new(10, 0, 0, 1),
        dst_addr: Ipv4Address::new(239, 1, 1, 1),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 16,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(
        &mut ip_packet,
        &smoltcp::phy::ChecksumCapabilities::default(),
    );

    let udp_repr = UdpRepr { src_port, dst_port };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &smoltcp::phy::ChecksumCapabilities::default(),
    );

    packet
}

/// Build a UDP frame of exactly `len` bytes
///
/// The payload is a counting pattern starting at `seed`, so frames of the
/// same length but different seeds differ. Requires `len` to hold the
/// Ethernet, IP and UDP headers.
pub fn frame_of_len(len: usize, seed: u8) -> Vec<u8> {
    let headers = ETHERNET_HDR_SIZE + IP_HDR_SIZE + UDP_HDR_SIZE;
    assert!(len >= headers, "frame of {len} bytes cannot hold UDP headers");
    let payload: Vec<u8> = (0..len - headers)
        .map(|i| seed.wrapping_add(i as u8))
        .collect();
    build_udp_frame(5000, 5001, &payload)
}

/// Allocate a buffer from `pool` holding a `len`-byte frame received on `port`
pub fn test_frame(pool: &std::sync::Arc<BufferPool>, port: PortId, len: usize) -> PoolBuffer {
    let mut buf = pool.alloc().expect("Test pool exhausted");
    buf.append(&frame_of_len(len, port as u8))
        .expect("Frame exceeds buffer size");
    buf.meta_mut().port = port;
    buf
}
