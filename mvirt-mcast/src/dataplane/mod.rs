//! Data plane: per-core forwarding workers
//!
//! Architecture:
//! - Each worker is a busy-polling OS thread that owns a static, disjoint set
//!   of receive queues (shared-nothing)
//! - Every received frame is replicated to the configured mirror ports and
//!   forwarded to its primary port, with the Ethernet header rewritten
//! - Output is batched per destination port and flushed when a batch is full
//!   or when the drain interval expires
//! - Buffer pools are the only state shared between workers

pub mod batch;
pub mod buffer;
pub mod drain;
pub mod ether;
pub mod manager;
pub mod port;
pub mod replicate;
pub mod ring;
pub mod stats;
pub mod tap;
pub mod worker;

/// Port identifier (index into the port table)
pub type PortId = u16;

/// Queue identifier within a port
pub type QueueId = u16;

/// Maximum number of ports
pub const MAX_PORTS: usize = 16;

/// Maximum frames per receive burst and per output batch
pub const MAX_PKT_BURST: usize = 32;

/// Maximum receive queues a single worker polls
pub const MAX_RX_QUEUE_PER_WORKER: usize = 16;

/// Maximum transmit queues per port (bounds the worker count)
pub const MAX_TX_QUEUE_PER_PORT: usize = 16;

/// How many frames ahead of the current one get prefetched
pub const PREFETCH_OFFSET: usize = 3;

/// Default drain interval for partially filled batches
pub const BURST_TX_DRAIN_US: u64 = 100;

pub use batch::{FlushOutcome, OutputBatch, PacketSink, TxBatches};
pub use buffer::{BufferError, BufferPool, PacketMeta, PoolBuffer, PoolConfig};
pub use drain::{CycleClock, DrainTimer, ManualClock, MonotonicClock, TscClock, drain_cycles};
pub use ether::{L2Rewrite, REFERENCE_MAC, format_mac, parse_mac, rewrite_l2};
pub use manager::{DataPlane, DataPlaneError, LaunchConfig};
pub use port::{LinkStatus, PortError, PortHandle, PortMask, PortTable, wait_for_links};
pub use replicate::{ReplicateError, ReplicationPolicy, Replicator, StaticPolicy};
pub use ring::RingPort;
pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use tap::{TapDevice, TapPort};
pub use worker::{
    RxBinding, Worker, WorkerConfig, WorkerError, WorkerExit, WorkerHandle, pin_to_cpu, spawn_worker,
};
