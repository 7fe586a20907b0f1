//! main.rs: MAVC drone fleet simulator entry point
//!
//! Stands in for a cluster of SITL drones. Per drone:
//!   1. Handshake on `base_port + index` for a CID, then TCP to `base_port + CID`
//!   2. Kinematics loop at the STAT rate: flies queued actions, reports
//!      STAT over UDP and ARRIVED over TCP
//!
//! One shared listener on `base_port` receives the monitor's subnet broadcasts
//! and fans them out to every drone. Start the monitor first and add the same
//! number of simulated drones there; each simulator index then meets the
//! session waiting on its port.

mod drone;
mod kinematics;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mavc_types::geo::offset_by_meters;
use mavc_types::{GeoPoint, Message, DEFAULT_BASE_PORT};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use drone::{DroneSpec, LinkConfig};
use kinematics::MotionLimits;

/// Spacing between generated home positions (m, eastwards)
const HOME_SPACING_M: f64 = 5.0;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "drone-sim", about = "MAVC drone fleet simulator")]
struct Args {
    /// Fleet file (TOML) with link settings and per-drone homes
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Monitor address (its public IP)
    #[arg(long)]
    monitor_ip: Option<Ipv4Addr>,
    /// Number of drones when the fleet file lists none
    #[arg(short = 'n', long, default_value = "1")]
    count: u16,
    #[arg(long)]
    base_port: Option<u16>,
    /// Home of the first generated drone
    #[arg(long, default_value = "31.8880")]
    home_lat: f64,
    #[arg(long, default_value = "118.8122")]
    home_lon: f64,
    /// Ground speed (m/s)
    #[arg(long)]
    speed: Option<f64>,
    /// STAT reports per second
    #[arg(long)]
    rate: Option<f64>,
}

// ── Fleet file ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FleetConfig {
    monitor_ip: Ipv4Addr,
    base_port: u16,
    rate_hz: f64,
    gps_noise_m: f64,
    speed_mps: f64,
    climb_mps: f64,
    handshake_retry_ms: u64,
    drone: Vec<HomeEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct HomeEntry {
    lat: f64,
    lon: f64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let limits = MotionLimits::default();
        Self {
            monitor_ip: Ipv4Addr::LOCALHOST,
            base_port: DEFAULT_BASE_PORT,
            rate_hz: 4.0,
            gps_noise_m: 0.3,
            speed_mps: limits.speed_mps,
            climb_mps: limits.climb_mps,
            handshake_retry_ms: 1_000,
            drone: Vec::new(),
        }
    }
}

impl FleetConfig {
    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else { return Ok(Self::default()) };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply(&mut self, args: &Args) {
        if let Some(ip) = args.monitor_ip {
            self.monitor_ip = ip;
        }
        if let Some(port) = args.base_port {
            self.base_port = port;
        }
        if let Some(speed) = args.speed {
            self.speed_mps = speed;
        }
        if let Some(rate) = args.rate {
            self.rate_hz = rate;
        }
    }

    fn link(&self) -> LinkConfig {
        LinkConfig {
            monitor_ip: self.monitor_ip,
            base_port: self.base_port,
            rate_hz: self.rate_hz,
            gps_noise_m: self.gps_noise_m,
            limits: MotionLimits { speed_mps: self.speed_mps, climb_mps: self.climb_mps },
            handshake_retry: Duration::from_millis(self.handshake_retry_ms),
        }
    }

    /// Listed homes win; otherwise `count` drones in a row east of `first`.
    fn fleet(&self, count: u16, first: GeoPoint) -> Vec<DroneSpec> {
        if !self.drone.is_empty() {
            return self
                .drone
                .iter()
                .zip(1u16..)
                .map(|(h, index)| DroneSpec { index, home: GeoPoint::new(h.lat, h.lon) })
                .collect();
        }
        (1..=count)
            .map(|index| DroneSpec {
                index,
                home: offset_by_meters(first, 0.0, HOME_SPACING_M * f64::from(index - 1)),
            })
            .collect()
    }
}

// ── Broadcast listener ────────────────────────────────────────────────────────

/// UDP socket on `0.0.0.0:port` that tolerates other listeners on the same port
/// (the monitor's own handshake socket, other simulator processes).
fn bind_broadcast_listener(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

async fn fan_out(socket: UdpSocket, tx: broadcast::Sender<Message>) {
    let mut buf = vec![0u8; 65_535];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Broadcast listener: recv failed: {e}");
                continue;
            }
        };
        match Message::from_slice(&buf[..len]) {
            Ok(msg) => {
                // No receivers just means every drone has stopped.
                let _ = tx.send(msg);
            }
            Err(e) => debug!("Broadcast listener: dropped datagram from {from}: {e}"),
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drone_simulator=info,drone_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = FleetConfig::load(args.config.as_deref())?;
    cfg.apply(&args);

    let link = cfg.link();
    let fleet = cfg.fleet(args.count, GeoPoint::new(args.home_lat, args.home_lon));
    info!(
        "Simulating {} drone(s) against {}:{} at {} Hz, {} m/s",
        fleet.len(),
        link.monitor_ip,
        link.base_port,
        link.rate_hz,
        link.limits.speed_mps
    );

    let (tx, _) = broadcast::channel::<Message>(256);
    match bind_broadcast_listener(link.base_port) {
        Ok(socket) => {
            tokio::spawn(fan_out(socket, tx.clone()));
        }
        Err(e) => warn!(
            "Broadcast listener on port {} unavailable ({e}); drones only hear TCP commands",
            link.base_port
        ),
    }

    let mut drones = JoinSet::new();
    for spec in fleet {
        let link = link.clone();
        let rx = tx.subscribe();
        drones.spawn(async move { (spec.index, drone::run(link, spec, rx).await) });
    }

    loop {
        tokio::select! {
            joined = drones.join_next() => match joined {
                Some(Ok((index, Ok(())))) => info!("sim-{index}: finished"),
                Some(Ok((index, Err(e)))) => error!("sim-{index}: {e:#}"),
                Some(Err(e)) => error!("drone task panicked: {e}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping {} drone(s)", drones.len());
                drones.abort_all();
                break;
            }
        }
    }
    Ok(())
}
