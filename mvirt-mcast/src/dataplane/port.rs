//! Port abstraction for pluggable packet I/O
//!
//! A port is one network interface with a set of receive and transmit queues.
//! Workers talk to ports only through [`PortHandle`]: burst-oriented,
//! non-blocking, and allowed to accept fewer frames than offered.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smoltcp::wire::EthernetAddress;
use thiserror::Error;
use tracing::{info, warn};

use super::buffer::PoolBuffer;
use super::{MAX_PORTS, PortId, QueueId};

/// Port errors (setup time only; the I/O paths never fail loudly)
#[derive(Debug, Error)]
pub enum PortError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid interface name: {0}")]
    InvalidName(String),

    #[error("Port {0} is out of range (max {MAX_PORTS} ports)")]
    OutOfRange(PortId),

    #[error("Port {0} is already registered")]
    Duplicate(PortId),
}

/// Link state of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up { speed_mbps: u32, full_duplex: bool },
    Down,
}

impl LinkStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkStatus::Up { .. })
    }
}

/// Abstraction over a network interface's queues
///
/// Methods take `&self`: one handle is shared by all workers, and each worker
/// uses its own transmit queue and its exclusively assigned receive queues.
pub trait PortHandle: Send + Sync {
    /// Port identifier (index into the [`PortTable`])
    fn id(&self) -> PortId;

    /// Interface name (for logs)
    fn name(&self) -> &str;

    /// Hardware address of the interface
    fn mac_addr(&self) -> EthernetAddress;

    fn rx_queue_count(&self) -> u16;

    fn tx_queue_count(&self) -> u16;

    /// Receive up to `max` frames (non-blocking)
    ///
    /// Received buffers are appended to `pkts`. Returns how many were appended,
    /// possibly zero.
    fn rx_burst(&self, queue: QueueId, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize;

    /// Transmit the frames in `pkts` (non-blocking)
    ///
    /// Accepted frames are removed from the front of `pkts` and now belong to
    /// the port. Returns how many were accepted; the rest stays in `pkts`.
    fn tx_burst(&self, queue: QueueId, pkts: &mut Vec<PoolBuffer>) -> usize;

    /// Receive attempts that found the packet pool empty
    fn rx_nombuf(&self) -> u64 {
        0
    }

    /// Received frames dropped for not fitting into a buffer
    fn rx_truncated(&self) -> u64 {
        0
    }

    /// Current link state
    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up {
            speed_mbps: 0,
            full_duplex: true,
        }
    }
}

/// Bitmask of port identifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortMask(u32);

impl PortMask {
    pub const EMPTY: PortMask = PortMask(0);

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Mask with only `port` set
    pub fn single(port: PortId) -> Self {
        let mut mask = Self::EMPTY;
        mask.insert(port);
        mask
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Number of ports in the mask
    #[inline]
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, port: PortId) -> bool {
        port < 32 && self.0 & (1 << port) != 0
    }

    /// Add `port`; ids that don't fit in the mask are ignored
    pub fn insert(&mut self, port: PortId) {
        if port < 32 {
            self.0 |= 1 << port;
        }
    }

    /// Ports in ascending order
    pub fn iter(self) -> PortMaskIter {
        PortMaskIter(self.0)
    }

    /// Parse a hexadecimal mask, with or without `0x`
    pub fn parse_hex(s: &str) -> Option<Self> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() {
            return None;
        }
        u32::from_str_radix(digits, 16).ok().map(Self)
    }
}

impl FromIterator<PortId> for PortMask {
    fn from_iter<I: IntoIterator<Item = PortId>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for port in iter {
            mask.insert(port);
        }
        mask
    }
}

impl fmt::Display for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Iterator over the ports of a [`PortMask`]
pub struct PortMaskIter(u32);

impl Iterator for PortMaskIter {
    type Item = PortId;

    fn next(&mut self) -> Option<PortId> {
        if self.0 == 0 {
            return None;
        }
        let port = self.0.trailing_zeros() as PortId;
        self.0 &= self.0 - 1;
        Some(port)
    }
}

/// Fixed arena of ports indexed by [`PortId`]
///
/// Built once at startup and shared read-only by all workers.
pub struct PortTable {
    ports: [Option<Arc<dyn PortHandle>>; MAX_PORTS],
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            ports: std::array::from_fn(|_| None),
        }
    }

    /// Register a port under its own id
    pub fn insert(&mut self, port: Arc<dyn PortHandle>) -> Result<(), PortError> {
        let id = port.id();
        let slot = self
            .ports
            .get_mut(id as usize)
            .ok_or(PortError::OutOfRange(id))?;
        if slot.is_some() {
            return Err(PortError::Duplicate(id));
        }
        *slot = Some(port);
        Ok(())
    }

    #[inline]
    pub fn get(&self, id: PortId) -> Option<&Arc<dyn PortHandle>> {
        self.ports.get(id as usize).and_then(Option::as_ref)
    }

    pub fn contains(&self, id: PortId) -> bool {
        self.get(id).is_some()
    }

    /// Registered ports in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PortHandle>> {
        self.ports.iter().flatten()
    }

    /// Mask of registered port ids
    pub fn mask(&self) -> PortMask {
        self.iter().map(|p| p.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// [`PortHandle::rx_nombuf`] summed over all ports
    pub fn rx_nombuf(&self) -> u64 {
        self.iter().map(|p| p.rx_nombuf()).sum()
    }

    /// [`PortHandle::rx_truncated`] summed over all ports
    pub fn rx_truncated(&self) -> u64 {
        self.iter().map(|p| p.rx_truncated()).sum()
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for all ports to report link up
///
/// Checks every `check_interval` for at most `timeout`, then logs the state of
/// every port. Returns whether all links came up; startup proceeds either way.
pub fn wait_for_links(ports: &PortTable, check_interval: Duration, timeout: Duration) -> bool {
    let max_checks = (timeout.as_millis() / check_interval.as_millis().max(1)) as u64;

    info!(ports = ports.len(), timeout_ms = timeout.as_millis() as u64, "Checking link status");

    let mut all_up = false;
    for count in 0..=max_checks {
        all_up = ports.iter().all(|p| p.link_status().is_up());
        if all_up || count == max_checks {
            break;
        }
        thread::sleep(check_interval);
    }

    for port in ports.iter() {
        match port.link_status() {
            LinkStatus::Up {
                speed_mbps,
                full_duplex,
            } => info!(
                port = port.id(),
                name = %port.name(),
                speed_mbps,
                duplex = if full_duplex { "full" } else { "half" },
                "Link up"
            ),
            LinkStatus::Down => warn!(port = port.id(), name = %port.name(), "Link down"),
        }
    }

    all_up
}
