use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Instant, interval_at};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_mcast::config::{ForwardConfig, parse_nqueue, parse_portmask};
use mvirt_mcast::dataplane::{
    BufferPool, CycleClock, DataPlane, MAX_PORTS, MonotonicClock, PortId, PortMask, PortTable,
    TapPort, TscClock, WorkerExit, wait_for_links,
};

/// How long the TSC is measured against the monotonic clock
const TSC_CALIBRATION: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "mvirt-mcast")]
#[command(about = "mvirt multicast fan-out forwarder")]
struct Args {
    /// Hexadecimal bitmask of the ports to use
    #[arg(short, long, value_parser = parse_portmask)]
    portmask: Option<PortMask>,

    /// Receive queues (ports) polled by each worker
    #[arg(short = 'q', long = "queues", value_parser = parse_nqueue)]
    queues: Option<usize>,

    /// TAP interface of the next port id, repeat once per port
    #[arg(long = "port", value_name = "IFNAME")]
    ports: Vec<String>,

    /// Number of workers (default: enough for all enabled ports)
    #[arg(short, long)]
    workers: Option<usize>,

    /// CPUs to pin the workers to, comma separated
    #[arg(long, value_delimiter = ',')]
    cpus: Vec<usize>,

    /// Port every received frame is forwarded to
    #[arg(long)]
    forward_port: Option<PortId>,

    /// Hexadecimal bitmask of the ports that get a copy
    #[arg(long, value_parser = parse_mask)]
    mirror_mask: Option<PortMask>,

    /// Destination MAC written into outgoing frames
    #[arg(long)]
    rewrite_mac: Option<String>,

    /// Source MAC written into outgoing frames
    #[arg(long)]
    src_mac: Option<String>,

    /// Frames per receive burst and output batch
    #[arg(long)]
    burst: Option<usize>,

    /// Microseconds before a partially filled batch is sent
    #[arg(long)]
    drain_us: Option<u64>,

    #[arg(long)]
    packet_buffers: Option<usize>,

    #[arg(long)]
    header_buffers: Option<usize>,

    /// Seconds to wait for links to come up
    #[arg(long)]
    link_wait_secs: Option<u64>,

    /// Seconds between stats reports, 0 disables them
    #[arg(long)]
    stats_interval_secs: Option<u64>,

    /// JSON configuration file, flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Port mask that may be empty
fn parse_mask(s: &str) -> Result<PortMask, String> {
    PortMask::parse_hex(s).ok_or_else(|| format!("invalid port mask {s:?}"))
}

impl Args {
    fn into_config(self) -> Result<ForwardConfig> {
        let mut config = match &self.config {
            Some(path) => ForwardConfig::load(path)?,
            None => ForwardConfig::default(),
        };

        if let Some(mask) = self.portmask {
            config.portmask = mask;
        }
        if let Some(n) = self.queues {
            config.queues_per_worker = n;
        }
        if !self.ports.is_empty() {
            config.ports = self.ports;
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        if !self.cpus.is_empty() {
            config.cpus = self.cpus;
        }
        if let Some(port) = self.forward_port {
            config.forward_port = port;
        }
        if let Some(mask) = self.mirror_mask {
            config.mirror_mask = mask;
        }
        if let Some(mac) = self.rewrite_mac {
            config.rewrite_mac = mac;
        }
        if self.src_mac.is_some() {
            config.src_mac = self.src_mac;
        }
        if let Some(burst) = self.burst {
            config.burst = burst;
        }
        if let Some(us) = self.drain_us {
            config.drain_us = us;
        }
        if let Some(n) = self.packet_buffers {
            config.packet_buffers = n;
        }
        if let Some(n) = self.header_buffers {
            config.header_buffers = n;
        }
        if let Some(secs) = self.link_wait_secs {
            config.link_wait_secs = secs;
        }
        if let Some(secs) = self.stats_interval_secs {
            config.stats_interval_secs = secs;
        }

        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_mcast=info".parse()?))
        .init();

    let config = Args::parse().into_config()?;
    config.validate().context("Invalid configuration")?;

    info!(
        portmask = %config.portmask,
        queues_per_worker = config.queues_per_worker,
        workers = config.worker_count(),
        forward_port = config.forward_port,
        mirror_mask = %config.mirror_mask,
        "Initializing mvirt-mcast"
    );

    let packet_pool = Arc::new(
        BufferPool::new(config.packet_pool()).context("Failed to create packet buffer pool")?,
    );
    let header_pool = Arc::new(
        BufferPool::new(config.header_pool()).context("Failed to create header buffer pool")?,
    );

    let ports = Arc::new(open_ports(&config, &packet_pool)?);
    wait_for_links(
        &ports,
        Duration::from_millis(config.link_check_ms),
        Duration::from_secs(config.link_wait_secs),
    );

    let mut plane = DataPlane::start(
        config.launch()?,
        Arc::clone(&ports),
        Arc::clone(&header_pool),
        Arc::new(config.policy()?),
        cycle_clock(),
    )
    .context("Failed to start data plane")?;

    run_until_signal(
        &plane,
        &ports,
        &packet_pool,
        &header_pool,
        config.stats_interval_secs,
    )
    .await?;

    let exits = match plane.join() {
        Ok(exits) => exits,
        Err(e) => {
            error!(error = %e, "Data plane stopped with an error");
            std::process::exit(1);
        }
    };
    let idle = exits.iter().filter(|&&e| e == WorkerExit::NothingToDo).count();

    for (worker_id, stats) in plane.stats().iter().enumerate() {
        info!(
            worker_id,
            rx_packets = stats.rx_packets,
            tx_packets = stats.tx_packets,
            dropped = stats.dropped(),
            "Worker statistics"
        );
    }
    let total = plane.total_stats();
    info!(
        idle_workers = idle,
        rx_nombuf = ports.rx_nombuf(),
        rx_truncated = ports.rx_truncated(),
        stats = %serde_json::to_string(&total)?,
        "Forwarder stopped"
    );

    Ok(())
}

/// Open a TAP port for every port in the mask
fn open_ports(config: &ForwardConfig, pool: &Arc<BufferPool>) -> Result<PortTable> {
    let mut table = PortTable::new();

    for id in 0..MAX_PORTS as PortId {
        if !config.portmask.contains(id) {
            if let Some(name) = config.interface(id) {
                info!(port = id, name, "Skipping disabled port");
            }
            continue;
        }

        let name = config
            .interface(id)
            .with_context(|| format!("Port {id} has no interface"))?;
        let port = TapPort::open(id, name, Arc::clone(pool))
            .with_context(|| format!("Failed to open port {id} ({name})"))?;
        table.insert(Arc::new(port))?;
    }

    info!(ports = table.len(), "Ports initialized");
    Ok(table)
}

fn cycle_clock() -> Arc<dyn CycleClock> {
    match TscClock::calibrate(TSC_CALIBRATION) {
        Some(tsc) => {
            info!(hz = tsc.hz(), "Using TSC for drain timing");
            Arc::new(tsc)
        }
        None => {
            info!("No invariant TSC, using monotonic clock for drain timing");
            Arc::new(MonotonicClock::new())
        }
    }
}

/// Report stats until SIGINT or SIGTERM, or until every worker has exited
async fn run_until_signal(
    plane: &DataPlane,
    ports: &PortTable,
    packet_pool: &BufferPool,
    header_pool: &BufferPool,
    interval_secs: u64,
) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut last = plane.total_stats();
    let mut last_nombuf = ports.rx_nombuf();
    let mut last_at = Instant::now();

    info!("Forwarding (Ctrl+C to stop)");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = ticker.tick(), if interval_secs > 0 => {
                if !plane.is_running() {
                    warn!("All workers have exited");
                    break;
                }

                let now = plane.total_stats();
                let delta = now.delta(&last);
                let nombuf = ports.rx_nombuf();
                info!(
                    tx_mpps = delta.packet_rate_mpps(last_at.elapsed().as_secs_f64()),
                    rx_packets = now.rx_packets,
                    tx_packets = now.tx_packets,
                    replicas = now.replicas,
                    dropped = now.dropped(),
                    rx_nombuf = nombuf,
                    rx_truncated = ports.rx_truncated(),
                    packet_buffers_in_use = packet_pool.in_use(),
                    header_buffers_in_use = header_pool.in_use(),
                    "Forwarding statistics"
                );
                if delta.alloc_failures > 0 {
                    warn!(frames = delta.alloc_failures, "Header pool exhausted, frames dropped");
                }
                if nombuf > last_nombuf {
                    warn!(attempts = nombuf - last_nombuf, "Packet pool exhausted on receive");
                }

                last = now;
                last_nombuf = nombuf;
                last_at = Instant::now();
            }
        }
    }

    Ok(())
}
