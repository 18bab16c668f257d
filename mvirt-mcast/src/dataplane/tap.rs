//! TAP device ports
//!
//! A TAP interface carries whole Ethernet frames between the kernel and this
//! process. It has a single kernel queue: every queue id of a [`TapPort`]
//! maps onto the same descriptor, and the kernel serialises concurrent reads
//! and writes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;
use smoltcp::wire::EthernetAddress;
use tracing::{info, trace};

use super::buffer::{BufferPool, PoolBuffer};
use super::port::{LinkStatus, PortError, PortHandle};
use super::{PortId, QueueId};

/// TUN device flags from linux/if_tun.h
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Queue count reported for a TAP port (all ids share one descriptor)
const TAP_QUEUES: u16 = 16;

/// ifreq structure for getting/setting interface flags
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReqFlags {
    fn new(name: &str, flags: libc::c_short) -> Self {
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        copy_name(&mut ifr.ifr_name, name);
        ifr
    }
}

/// ifreq structure for reading the hardware address
#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 8],
}

fn copy_name(dst: &mut [libc::c_char; libc::IFNAMSIZ], name: &str) {
    for (i, &b) in name.as_bytes().iter().take(libc::IFNAMSIZ - 1).enumerate() {
        dst[i] = b as libc::c_char;
    }
}

/// Check that `name` is usable as a Linux interface name
fn validate_name(name: &str) -> Result<(), PortError> {
    if name.is_empty()
        || name.len() >= libc::IFNAMSIZ
        || name.bytes().any(|b| b == b'/' || b == 0 || b.is_ascii_whitespace())
    {
        return Err(PortError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl SockGuard {
    fn new() -> io::Result<Self> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(sock))
    }
}

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// A Layer 2 TAP device
pub struct TapDevice {
    name: String,
    file: File,
}

impl TapDevice {
    /// Create (or attach to) the TAP device `name`
    ///
    /// The device is created with IFF_NO_PI, so reads and writes carry bare
    /// Ethernet frames.
    pub fn create(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TAP device name too long",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let ifr = IfReqFlags::new(name, IFF_TAP | IFF_NO_PI);
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Switch the descriptor to non-blocking mode
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) };
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(new_flags)).map_err(io::Error::from)?;
        Ok(())
    }

    /// Read one frame
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Write one frame
    pub fn send(&self, frame: &[u8]) -> io::Result<usize> {
        (&self.file).write(frame)
    }

    /// Set IFF_UP on the interface
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = SockGuard::new()?;

        let mut ifr = IfReqFlags::new(&self.name, 0);
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Whether the interface is up with a carrier (IFF_RUNNING)
    pub fn is_running(&self) -> io::Result<bool> {
        let sock = SockGuard::new()?;

        let mut ifr = IfReqFlags::new(&self.name, 0);
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(ifr.ifr_flags & libc::IFF_RUNNING as libc::c_short != 0)
    }

    /// Hardware address assigned by the kernel
    pub fn mac_addr(&self) -> io::Result<EthernetAddress> {
        let sock = SockGuard::new()?;

        let mut ifr = IfReqHwAddr {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_hwaddr: unsafe { std::mem::zeroed() },
            _pad: [0; 8],
        };
        copy_name(&mut ifr.ifr_name, &self.name);

        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFHWADDR as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut mac = [0u8; 6];
        for (dst, &src) in mac.iter_mut().zip(ifr.ifr_hwaddr.sa_data.iter()) {
            *dst = src as u8;
        }
        Ok(EthernetAddress(mac))
    }
}

/// Port on top of a [`TapDevice`]
///
/// Received frames are read into buffers of the packet pool.
pub struct TapPort {
    id: PortId,
    dev: TapDevice,
    pool: Arc<BufferPool>,
    mac: EthernetAddress,
    /// Receive attempts that found the packet pool empty
    rx_nombuf: AtomicU64,
    /// Frames dropped because they filled the whole receive buffer
    rx_truncated: AtomicU64,
}

impl TapPort {
    /// Open the TAP device `name` as port `id` and bring it up
    pub fn open(id: PortId, name: &str, pool: Arc<BufferPool>) -> Result<Self, PortError> {
        validate_name(name)?;

        let dev = TapDevice::create(name)?;
        dev.set_nonblocking()?;
        dev.bring_up()?;
        let mac = dev.mac_addr()?;

        info!(port = id, name = %name, mac = %mac, "Opened TAP port");

        Ok(Self {
            id,
            dev,
            pool,
            mac,
            rx_nombuf: AtomicU64::new(0),
            rx_truncated: AtomicU64::new(0),
        })
    }

}

/// Result of reading one frame into a buffer
#[derive(Debug)]
enum ReadOutcome {
    Frame,
    /// The read filled the whole buffer, so the kernel may have cut it short
    Truncated(usize),
    Empty,
    Failed(io::Error),
}

fn read_frame(
    buf: &mut PoolBuffer,
    read: impl FnOnce(&mut [u8]) -> io::Result<usize>,
) -> ReadOutcome {
    let area = buf.write_area();
    let room = area.len();
    match read(area) {
        Ok(0) => ReadOutcome::Empty,
        Ok(n) if n >= room => ReadOutcome::Truncated(n),
        Ok(n) => match buf.set_len(n) {
            Ok(()) => ReadOutcome::Frame,
            Err(_) => ReadOutcome::Truncated(n),
        },
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Empty,
        Err(e) => ReadOutcome::Failed(e),
    }
}

impl PortHandle for TapPort {
    fn id(&self) -> PortId {
        self.id
    }

    fn name(&self) -> &str {
        self.dev.name()
    }

    fn mac_addr(&self) -> EthernetAddress {
        self.mac
    }

    fn rx_queue_count(&self) -> u16 {
        TAP_QUEUES
    }

    fn tx_queue_count(&self) -> u16 {
        TAP_QUEUES
    }

    fn rx_burst(&self, _queue: QueueId, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let mut received = 0;
        for _ in 0..max {
            let Some(mut buf) = self.pool.alloc() else {
                self.rx_nombuf.fetch_add(1, Ordering::Relaxed);
                break;
            };
            match read_frame(&mut buf, |area| self.dev.recv(area)) {
                ReadOutcome::Frame => {
                    buf.meta_mut().port = self.id;
                    pkts.push(buf);
                    received += 1;
                }
                ReadOutcome::Truncated(len) => {
                    trace!(port = self.id, len, "Oversized frame dropped");
                    self.rx_truncated.fetch_add(1, Ordering::Relaxed);
                }
                ReadOutcome::Empty => break,
                ReadOutcome::Failed(e) => {
                    trace!(port = self.id, error = %e, "TAP read failed");
                    break;
                }
            }
        }
        received
    }

    fn tx_burst(&self, _queue: QueueId, pkts: &mut Vec<PoolBuffer>) -> usize {
        let mut sent = 0;
        for pkt in pkts.iter() {
            match self.dev.send(pkt.data()) {
                Ok(_) => sent += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!(port = self.id, error = %e, "TAP write failed");
                    break;
                }
            }
        }
        // The kernel copied the frames; their buffers go back to the pool
        pkts.drain(..sent);
        sent
    }

    fn rx_nombuf(&self) -> u64 {
        self.rx_nombuf.load(Ordering::Relaxed)
    }

    fn rx_truncated(&self) -> u64 {
        self.rx_truncated.load(Ordering::Relaxed)
    }

    fn link_status(&self) -> LinkStatus {
        match self.dev.is_running() {
            Ok(true) => LinkStatus::Up {
                speed_mbps: 10_000,
                full_duplex: true,
            },
            _ => LinkStatus::Down,
        }
    }
}
