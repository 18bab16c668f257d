//! Forwarding configuration
//!
//! Loaded from an optional JSON file, overridden by command-line flags and
//! validated before anything is started.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataplane::buffer::{DEFAULT_DATA_ROOM, NB_HDR_BUFFERS, NB_PKT_BUFFERS};
use crate::dataplane::{
    BURST_TX_DRAIN_US, L2Rewrite, LaunchConfig, MAX_PKT_BURST, MAX_PORTS,
    MAX_RX_QUEUE_PER_WORKER, MAX_TX_QUEUE_PER_PORT, PoolConfig, PortId, PortMask, REFERENCE_MAC,
    RxBinding, StaticPolicy, format_mac, parse_mac,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid portmask: {0:?}")]
    InvalidPortmask(String),

    #[error("portmask {0} names ports beyond the {MAX_PORTS} supported")]
    PortmaskTooWide(PortMask),

    #[error("invalid queue number: {0:?} (must be 1..{MAX_RX_QUEUE_PER_WORKER})")]
    InvalidQueues(String),

    #[error("invalid burst size {0} (must be 1..={MAX_PKT_BURST})")]
    InvalidBurst(usize),

    #[error("invalid worker count {0} (must be 1..={MAX_TX_QUEUE_PER_PORT})")]
    InvalidWorkers(usize),

    #[error("port {0} is enabled but has no interface name")]
    MissingInterface(PortId),

    #[error("{role} port {port} is not enabled in the portmask")]
    PortNotEnabled { role: &'static str, port: PortId },

    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),

    #[error(
        "header buffers hold {header_room} bytes, received frames can be {data_room} bytes"
    )]
    InsufficientHeadroom { header_room: usize, data_room: usize },

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("drain interval {0}us exceeds {MAX_DRAIN_US}us")]
    DrainTooLong(u64),

    #[error("not enough workers: {ports} ports at {per_worker} per worker need more than {workers}")]
    NotEnoughWorkers {
        ports: usize,
        workers: usize,
        per_worker: usize,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Longest accepted drain interval (1s)
pub const MAX_DRAIN_US: u64 = 1_000_000;

/// Parse a hexadecimal portmask; zero is rejected
pub fn parse_portmask(s: &str) -> Result<PortMask> {
    match PortMask::parse_hex(s) {
        Some(mask) if !mask.is_empty() => Ok(mask),
        _ => Err(ConfigError::InvalidPortmask(s.to_string())),
    }
}

/// Parse the number of receive queues per worker
pub fn parse_nqueue(s: &str) -> Result<usize> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 && n < MAX_RX_QUEUE_PER_WORKER => Ok(n),
        _ => Err(ConfigError::InvalidQueues(s.to_string())),
    }
}

/// Distribute the enabled ports over `n_workers` workers
///
/// Ports are taken in ascending order; each worker is filled with
/// `per_worker` ports before the next one gets any. Every port contributes
/// its queue 0. Workers left over get nothing.
pub fn assign_queues(
    enabled: PortMask,
    n_workers: usize,
    per_worker: usize,
) -> Result<Vec<Vec<RxBinding>>> {
    let mut assignments: Vec<Vec<RxBinding>> = vec![Vec::new(); n_workers];
    let mut worker = 0;

    for port in enabled.iter() {
        while worker < n_workers && assignments[worker].len() >= per_worker {
            worker += 1;
        }
        let Some(rx) = assignments.get_mut(worker) else {
            return Err(ConfigError::NotEnoughWorkers {
                ports: enabled.count(),
                workers: n_workers,
                per_worker,
            });
        };
        rx.push(RxBinding { port, queue: 0 });
    }

    Ok(assignments)
}

/// Serialize port masks as hex strings
mod hex_mask {
    use serde::{Deserialize, Deserializer, Serializer, de};

    use crate::dataplane::PortMask;

    pub fn serialize<S: Serializer>(mask: &PortMask, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&mask.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PortMask, D::Error> {
        let s = String::deserialize(d)?;
        PortMask::parse_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid port mask {s:?}")))
    }
}

/// Everything the forwarder is started with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardConfig {
    /// Enabled ports
    #[serde(with = "hex_mask")]
    pub portmask: PortMask,
    /// Receive queues (ports) per worker
    pub queues_per_worker: usize,
    /// TAP interface of each port, indexed by port id
    pub ports: Vec<String>,
    /// Number of workers; derived from the port count when unset
    pub workers: Option<usize>,
    /// CPU of each worker
    pub cpus: Vec<usize>,
    pub forward_port: PortId,
    #[serde(with = "hex_mask")]
    pub mirror_mask: PortMask,
    /// Destination MAC of outgoing frames
    pub rewrite_mac: String,
    /// Source MAC of outgoing frames; the destination MAC when unset
    pub src_mac: Option<String>,
    pub burst: usize,
    pub drain_us: u64,
    pub packet_buffers: usize,
    pub header_buffers: usize,
    /// Largest frame a receive buffer holds
    pub data_room: usize,
    /// Bytes a header buffer holds; `data_room` when unset
    pub header_room: Option<usize>,
    pub link_wait_secs: u64,
    pub link_check_ms: u64,
    /// Seconds between stats reports, 0 disables them
    pub stats_interval_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            portmask: PortMask::EMPTY,
            queues_per_worker: 1,
            ports: Vec::new(),
            workers: None,
            cpus: Vec::new(),
            forward_port: 0,
            mirror_mask: PortMask::single(3),
            rewrite_mac: format_mac(REFERENCE_MAC),
            src_mac: None,
            burst: MAX_PKT_BURST,
            drain_us: BURST_TX_DRAIN_US,
            packet_buffers: NB_PKT_BUFFERS,
            header_buffers: NB_HDR_BUFFERS,
            data_room: DEFAULT_DATA_ROOM,
            header_room: None,
            link_wait_secs: 9,
            link_check_ms: 100,
            stats_interval_secs: 10,
        }
    }
}

impl ForwardConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Number of workers, explicit or just enough for all enabled ports
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            self.portmask
                .count()
                .div_ceil(self.queues_per_worker.max(1))
                .max(1)
        })
    }

    pub fn header_room(&self) -> usize {
        self.header_room.unwrap_or(self.data_room)
    }

    /// Addresses written into every outgoing frame
    pub fn l2_rewrite(&self) -> Result<L2Rewrite> {
        let dst = parse_mac(&self.rewrite_mac)
            .ok_or_else(|| ConfigError::InvalidMac(self.rewrite_mac.clone()))?;
        let src = match &self.src_mac {
            Some(s) => parse_mac(s).ok_or_else(|| ConfigError::InvalidMac(s.clone()))?,
            None => dst,
        };
        Ok(L2Rewrite { dst, src })
    }

    pub fn policy(&self) -> Result<StaticPolicy> {
        Ok(StaticPolicy {
            forward_port: self.forward_port,
            mirror_ports: self.mirror_mask,
            rewrite: self.l2_rewrite()?,
        })
    }

    /// Worker assignments and loop parameters
    pub fn launch(&self) -> Result<LaunchConfig> {
        Ok(LaunchConfig {
            assignments: assign_queues(
                self.portmask,
                self.worker_count(),
                self.queues_per_worker,
            )?,
            cpus: self.cpus.clone(),
            burst: self.burst,
            drain_us: self.drain_us,
        })
    }

    pub fn packet_pool(&self) -> PoolConfig {
        PoolConfig::packet("mbuf_pool", self.packet_buffers, self.data_room)
    }

    pub fn header_pool(&self) -> PoolConfig {
        PoolConfig::header("header_pool", self.header_buffers, self.header_room())
    }

    /// Interface name of an enabled port
    pub fn interface(&self, port: PortId) -> Option<&str> {
        self.ports
            .get(port as usize)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Check everything that can be checked before touching a device
    pub fn validate(&self) -> Result<()> {
        if self.portmask.is_empty() {
            return Err(ConfigError::InvalidPortmask(self.portmask.to_string()));
        }
        if self.portmask.iter().any(|p| p as usize >= MAX_PORTS) {
            return Err(ConfigError::PortmaskTooWide(self.portmask));
        }
        if self.queues_per_worker == 0 || self.queues_per_worker >= MAX_RX_QUEUE_PER_WORKER {
            return Err(ConfigError::InvalidQueues(self.queues_per_worker.to_string()));
        }
        if self.burst == 0 || self.burst > MAX_PKT_BURST {
            return Err(ConfigError::InvalidBurst(self.burst));
        }
        let workers = self.worker_count();
        if workers == 0 || workers > MAX_TX_QUEUE_PER_PORT {
            return Err(ConfigError::InvalidWorkers(workers));
        }

        if let Some(port) = self.portmask.iter().find(|&p| self.interface(p).is_none()) {
            return Err(ConfigError::MissingInterface(port));
        }
        if !self.portmask.contains(self.forward_port) {
            return Err(ConfigError::PortNotEnabled {
                role: "forward",
                port: self.forward_port,
            });
        }
        if let Some(port) = self.mirror_mask.iter().find(|&p| !self.portmask.contains(p)) {
            return Err(ConfigError::PortNotEnabled {
                role: "mirror",
                port,
            });
        }

        self.l2_rewrite()?;

        if self.header_room() < self.data_room {
            return Err(ConfigError::InsufficientHeadroom {
                header_room: self.header_room(),
                data_room: self.data_room,
            });
        }

        for (value, name) in [
            (self.drain_us, "drain interval"),
            (self.link_check_ms, "link check interval"),
            (self.packet_buffers as u64, "packet buffer count"),
            (self.header_buffers as u64, "header buffer count"),
            (self.data_room as u64, "data room"),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.drain_us > MAX_DRAIN_US {
            return Err(ConfigError::DrainTooLong(self.drain_us));
        }

        assign_queues(self.portmask, workers, self.queues_per_worker)?;
        Ok(())
    }
}
