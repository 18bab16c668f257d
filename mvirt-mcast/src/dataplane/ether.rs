//! Ethernet header rewriting using smoltcp

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};

use super::buffer::PoolBuffer;

/// Address written into both MAC fields unless configured otherwise
pub const REFERENCE_MAC: EthernetAddress =
    EthernetAddress([0xa0, 0x36, 0x9f, 0x20, 0x38, 0x4a]);

/// Ethernet addresses written into an outgoing frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2Rewrite {
    pub dst: EthernetAddress,
    pub src: EthernetAddress,
}

impl L2Rewrite {
    /// Same address for destination and source
    pub fn symmetric(mac: EthernetAddress) -> Self {
        Self { dst: mac, src: mac }
    }
}

impl Default for L2Rewrite {
    fn default() -> Self {
        Self::symmetric(REFERENCE_MAC)
    }
}

/// Rewrite the Ethernet header of `buf` in place
///
/// Sets destination and source addresses and the Ethertype (IPv4). Fails only
/// for frames shorter than an Ethernet header.
#[inline]
pub fn rewrite_l2(buf: &mut PoolBuffer, rewrite: &L2Rewrite) -> smoltcp::wire::Result<()> {
    let mut frame = EthernetFrame::new_checked(buf.data_mut())?;
    frame.set_dst_addr(rewrite.dst);
    frame.set_src_addr(rewrite.src);
    frame.set_ethertype(EthernetProtocol::Ipv4);
    Ok(())
}

/// Parse MAC address from string (e.g., "52:54:00:12:34:56")
pub fn parse_mac(s: &str) -> Option<EthernetAddress> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(EthernetAddress(mac))
}

/// Format a MAC address as colon-separated hex
pub fn format_mac(mac: EthernetAddress) -> String {
    let b = mac.0;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}
