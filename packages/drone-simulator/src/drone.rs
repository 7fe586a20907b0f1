//! drone.rs: one simulated drone speaking MAVC to the monitor
//!
//! Lifecycle:
//!   1. REQ_CID (with home position) to the SITL handshake port, retried until
//!      the monitor answers with a CID
//!   2. TCP connect to `base_port + CID` for ARRIVED reports and direct commands
//!   3. Fixed-rate loop: advance kinematics, send STAT, report ARRIVED for
//!      finished barrier actions; commands come from the shared broadcast
//!      listener and from the TCP stream
//!
//! Send errors are logged; only a lost handshake or TCP connect aborts the drone.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use futures::{SinkExt, StreamExt};
use mavc_types::{
    Action, Arrived, CidAssignment, Cid, GeoPoint, Geofence, MavcCodec, Message, MsgType, SectionAssembler,
};
use rand_distr::{Distribution, Normal};
use serde_json::json;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::kinematics::{MotionLimits, Vehicle};

/// Metres per degree of latitude on the flat-earth grid
const METERS_PER_DEG: f64 = 1.113195e5;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub monitor_ip: Ipv4Addr,
    pub base_port: u16,
    /// STAT reports per second
    pub rate_hz: f64,
    /// 1-sigma GPS noise on reported positions (m)
    pub gps_noise_m: f64,
    pub limits: MotionLimits,
    pub handshake_retry: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct DroneSpec {
    /// 1-based position in the fleet; selects the handshake port
    pub index: u16,
    pub home: GeoPoint,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What a command asks of the drone loop.
#[derive(Debug, PartialEq)]
enum Reaction {
    None,
    Enqueue(Vec<Action>),
    Geofence(Geofence),
    DelayTest,
    Stop,
}

/// Command interpretation, separate from I/O.
struct CommandState {
    cid: Cid,
    sections: SectionAssembler,
}

impl CommandState {
    fn new(cid: Cid) -> Self {
        Self { cid, sections: SectionAssembler::new() }
    }

    fn react(&mut self, msg: Message) -> Reaction {
        if msg.is_from_drone() {
            return Reaction::None;
        }
        match msg.msg_type() {
            MsgType::Action => self.own_actions(&msg),
            MsgType::ActionSec => match self.sections.push(msg) {
                Some(whole) => self.own_actions(&whole),
                None => Reaction::None,
            },
            MsgType::SetGeofence => match msg.body_as::<Geofence>() {
                Some(fence) => Reaction::Geofence(fence),
                None => {
                    warn!("drone-{}: SET_GEOFENCE without Radius/Lat/Lon", self.cid);
                    Reaction::None
                }
            },
            MsgType::DelayTest => Reaction::DelayTest,
            MsgType::Done => Reaction::Stop,
            other => {
                debug!("drone-{}: ignoring {:?}", self.cid, other);
                Reaction::None
            }
        }
    }

    fn own_actions(&self, msg: &Message) -> Reaction {
        match msg.actions() {
            Ok(actions) => {
                let mine: Vec<Action> = actions.into_iter().filter(|a| a.cid == self.cid).collect();
                if mine.is_empty() {
                    Reaction::None
                } else {
                    Reaction::Enqueue(mine)
                }
            }
            Err(e) => {
                warn!("drone-{}: unreadable ACTION payload: {e}", self.cid);
                Reaction::None
            }
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

async fn request_cid(udp: &UdpSocket, link: &LinkConfig, spec: &DroneSpec) -> anyhow::Result<Cid> {
    let handshake = SocketAddr::from((link.monitor_ip, link.base_port + spec.index));
    let request = Message::drone(MsgType::ReqCid, json!({ "Lat": spec.home.lat, "Lon": spec.home.lon })).to_bytes()?;
    let mut buf = vec![0u8; 4096];

    loop {
        udp.send_to(&request, handshake)
            .await
            .with_context(|| format!("sending REQ_CID to {handshake}"))?;
        debug!("sim-{}: REQ_CID -> {handshake}", spec.index);

        let Ok(received) = timeout(link.handshake_retry, udp.recv_from(&mut buf)).await else {
            continue;
        };
        let (len, from) = received?;
        if from.ip() != link.monitor_ip {
            debug!("sim-{}: ignoring datagram from {from}", spec.index);
            continue;
        }
        let Ok(reply) = Message::from_slice(&buf[..len]) else { continue };
        if reply.msg_type() != MsgType::Cid {
            continue;
        }
        if let Some(assigned) = reply.body_as::<CidAssignment>() {
            return Ok(assigned.cid);
        }
    }
}

// ── Drone loop ────────────────────────────────────────────────────────────────

pub async fn run(link: LinkConfig, spec: DroneSpec, mut commands: broadcast::Receiver<Message>) -> anyhow::Result<()> {
    if !(link.rate_hz > 0.0) {
        bail!("STAT rate must be positive, got {}", link.rate_hz);
    }
    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.context("binding drone UDP socket")?;
    let cid = request_cid(&udp, &link, &spec).await?;
    let port = link.base_port + cid as u16;
    let telemetry = SocketAddr::from((link.monitor_ip, port));
    info!("sim-{}: assigned CID {cid}", spec.index);

    let stream = TcpStream::connect(telemetry)
        .await
        .with_context(|| format!("drone-{cid}: connecting command channel {telemetry}"))?;
    let (read, write) = stream.into_split();
    let mut tcp_in = FramedRead::new(read, MavcCodec::new());
    let mut tcp_out = FramedWrite::new(write, MavcCodec::new());
    let mut tcp_open = true;
    info!("drone-{cid}: command channel up");

    let dt = 1.0 / link.rate_hz;
    let noise = Normal::new(0.0, link.gps_noise_m.max(0.0) / METERS_PER_DEG)?;
    let mut vehicle = Vehicle::new(spec.home, link.limits);
    let mut state = CommandState::new(cid);

    let mut ticker = interval(Duration::from_secs_f64(dt));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let incoming = tokio::select! {
            _ = ticker.tick() => {
                if let Some(done) = vehicle.step(dt) {
                    if done.sync {
                        report_arrived(&mut tcp_out, cid, done.step).await;
                    }
                    if vehicle.is_idle() {
                        info!("drone-{cid}: action queue drained");
                    }
                }
                send_stat(&udp, telemetry, cid, &vehicle, &noise).await;
                continue;
            }
            received = commands.recv() => match received {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("drone-{cid}: missed {n} broadcast commands");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = tcp_in.next(), if tcp_open => match frame {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!("drone-{cid}: bad frame on command channel: {e}");
                    continue;
                }
                None => {
                    warn!("drone-{cid}: monitor closed the command channel");
                    tcp_open = false;
                    continue;
                }
            },
        };

        match state.react(incoming) {
            Reaction::None => {}
            Reaction::Enqueue(actions) => {
                info!("drone-{cid}: queued {} action(s)", actions.len());
                vehicle.enqueue(actions);
            }
            Reaction::Geofence(fence) => vehicle.set_geofence(fence),
            Reaction::DelayTest => {
                let reply = Message::drone(MsgType::DelayResponse, json!({ "CID": cid, "Get_time": now_ms() }));
                send_udp(&udp, telemetry, &reply).await;
            }
            Reaction::Stop => {
                info!("drone-{cid}: DONE received, stopping");
                break;
            }
        }
    }
    Ok(())
}

async fn send_stat(udp: &UdpSocket, to: SocketAddr, cid: Cid, vehicle: &Vehicle, noise: &Normal<f64>) {
    // ThreadRng is !Send; it must be gone before the await.
    let stat = {
        let mut rng = rand::thread_rng();
        Message::drone(
            MsgType::Stat,
            json!({
                "CID": cid,
                "Armed": vehicle.armed,
                "Mode": vehicle.mode,
                "Lat": vehicle.pos.lat + noise.sample(&mut rng),
                "Lon": vehicle.pos.lon + noise.sample(&mut rng),
                "Alt": vehicle.alt,
            }),
        )
    };
    send_udp(udp, to, &stat).await;
}

async fn send_udp(udp: &UdpSocket, to: SocketAddr, msg: &Message) {
    match msg.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = udp.send_to(&bytes, to).await {
                warn!("UDP send to {to} failed: {e}");
            }
        }
        Err(e) => warn!("encoding {:?} failed: {e}", msg.msg_type()),
    }
}

async fn report_arrived(tcp: &mut FramedWrite<OwnedWriteHalf, MavcCodec>, cid: Cid, step: Option<u32>) {
    let body = serde_json::to_value(Arrived { cid, step }).unwrap_or_else(|_| json!({ "CID": cid }));
    match tcp.send(Message::drone(MsgType::Arrived, body)).await {
        Ok(()) => info!("drone-{cid}: ARRIVED step {step:?}"),
        Err(e) => warn!("drone-{cid}: ARRIVED not delivered: {e}"),
    }
}
