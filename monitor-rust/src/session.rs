//! # session
//!
//! One drone's network endpoint on the monitor side.
//!
//! ## Sockets
//! - UDP handshake: `base_port` for real drones, `base_port + CID` for simulators
//! - UDP telemetry: the handshake socket (simulators) or a socket bound on
//!   `base_port + CID` (real drones; bound up front, used once the handshake
//!   socket is released)
//! - TCP command channel: listener on `base_port + CID`, one peer at a time
//!
//! All sockets are bound in [`DroneSession::start`], so a port clash fails the
//! `add_drone` call for that CID and nothing else.
//!
//! ## Tasks
//! `start` spawns two Tokio tasks per session: the UDP task (handshake, then
//! telemetry) and the TCP accept loop, which spawns a reader per accepted peer.
//! Once `finish` is called the TCP side shuts down; the UDP task keeps merging
//! STAT so the map stays current but publishes no more events.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mavc_types::{Arrived, Cid, DroneStatus, HomePosition, MavcCodec, Message, MsgType};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accounting::{FlightLog, TaskTimes};
use crate::config::MonitorConfig;
use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::map::{DisplayHandles, MapDisplay};

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DroneKind {
    /// Physical drone behind a Pi relay
    Real,
    /// SITL drone
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    AwaitingHandshake,
    CidSent,
    TelemetryActive,
    TcpConnected,
    TaskActive,
    TaskDone,
    /// Handshake abandoned or the handshake socket failed
    Failed,
}

#[derive(Debug, Clone)]
struct SessionSettings {
    public_ip: Ipv4Addr,
    base_port: u16,
    drone_port: u16,
    enforce_peer_address: bool,
    handshake_timeout: Option<Duration>,
    write_timeout: Duration,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    status: DroneStatus,
    home: HomePosition,
    peer: Option<SocketAddr>,
    display: Option<DisplayHandles>,
    flight: FlightLog,
    task_done: bool,
}

/// Point-in-time copy of a session, as served to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneSnapshot {
    #[serde(rename = "CID")]
    pub cid: Cid,
    pub kind: DroneKind,
    pub phase: SessionPhase,
    pub status: DroneStatus,
    pub home: HomePosition,
    pub peer: Option<SocketAddr>,
    pub distance_m: f64,
    pub task_times: TaskTimes,
    pub trace_len: usize,
}

pub struct DroneSession {
    cid: Cid,
    kind: DroneKind,
    settings: SessionSettings,
    state: RwLock<SessionState>,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, MavcCodec>>>,
    map: Arc<dyn MapDisplay>,
    events: EventBus,
    shutdown: CancellationToken,
}

async fn bind_udp(addr: SocketAddrV4, kind: &'static str) -> Result<UdpSocket> {
    let addr = SocketAddr::V4(addr);
    UdpSocket::bind(addr).await.map_err(|source| ClusterError::Bind { kind, addr, source })
}

impl DroneSession {
    /// Bind every socket this session needs and start listening for the drone.
    pub async fn start(
        cid: Cid,
        kind: DroneKind,
        config: &MonitorConfig,
        map: Arc<dyn MapDisplay>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let settings = SessionSettings {
            public_ip: config.public_ip,
            base_port: config.base_port,
            drone_port: config.drone_port(cid)?,
            enforce_peer_address: config.enforce_peer_address,
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.write_timeout(),
        };
        let drone_addr = SocketAddrV4::new(settings.public_ip, settings.drone_port);

        let (handshake, telemetry) = match kind {
            DroneKind::Simulated => (bind_udp(drone_addr, "UDP handshake").await?, None),
            DroneKind::Real => {
                let handshake_addr = SocketAddrV4::new(settings.public_ip, settings.base_port);
                let handshake = bind_udp(handshake_addr, "UDP handshake").await?;
                (handshake, Some(bind_udp(drone_addr, "UDP telemetry").await?))
            }
        };
        let listener = TcpListener::bind(SocketAddr::V4(drone_addr)).await.map_err(|source| {
            ClusterError::Bind { kind: "TCP command", addr: SocketAddr::V4(drone_addr), source }
        })?;

        let session = Arc::new(Self {
            cid,
            kind,
            settings,
            state: RwLock::new(SessionState {
                phase: SessionPhase::AwaitingHandshake,
                status: DroneStatus::new(cid),
                home: HomePosition::default(),
                peer: None,
                display: None,
                flight: FlightLog::new(),
                task_done: false,
            }),
            writer: Mutex::new(None),
            map,
            events,
            shutdown: CancellationToken::new(),
        });

        info!(
            "drone-{cid}: {kind:?} session awaiting REQ_CID on {}, commands on {drone_addr}",
            handshake.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        tokio::spawn(session.clone().run_udp(handshake, telemetry));
        tokio::spawn(session.clone().accept_loop(listener));
        Ok(session)
    }

    // ── UDP: handshake, then telemetry ───────────────────────────────────────

    async fn run_udp(self: Arc<Self>, handshake: UdpSocket, telemetry: Option<UdpSocket>) {
        let outcome = match self.settings.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.handshake(&handshake)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("drone-{}: no REQ_CID within {limit:?}, abandoning handshake", self.cid);
                    self.fail().await;
                    return;
                }
            },
            None => self.handshake(&handshake).await,
        };
        if let Err(e) = outcome {
            error!("drone-{}: handshake failed: {e}", self.cid);
            self.fail().await;
            return;
        }

        let socket = match telemetry {
            Some(fresh) => {
                drop(handshake);
                fresh
            }
            None => handshake,
        };
        self.listen_telemetry(socket).await;
    }

    async fn fail(&self) {
        self.state.write().await.phase = SessionPhase::Failed;
        self.shutdown.cancel();
    }

    async fn handshake(&self, socket: &UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = socket.recv_from(&mut buf).await?;
            let msg = match Message::from_slice(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("drone-{}: dropping datagram from {src} during handshake: {e}", self.cid);
                    continue;
                }
            };
            if !msg.is_from_drone() || msg.msg_type() != MsgType::ReqCid {
                debug!("drone-{}: ignoring {:?} from {src} while awaiting REQ_CID", self.cid, msg.msg_type());
                continue;
            }

            let home = msg.body_as::<HomePosition>().unwrap_or_default();
            let display = self.map.preload_display(self.cid, home);
            {
                let mut st = self.state.write().await;
                st.peer = Some(src);
                st.home = home;
                st.display = Some(display);
                st.phase = SessionPhase::CidSent;
            }

            let reply = Message::monitor(MsgType::Cid, json!({ "CID": self.cid }));
            socket.send_to(&reply.to_bytes()?, src).await?;
            self.events.emit(ClusterEvent::MessageOut { cid: Some(self.cid), message: reply });

            let mut st = self.state.write().await;
            if st.phase == SessionPhase::CidSent {
                st.phase = SessionPhase::TelemetryActive;
            }
            info!("drone-{}: handshake with {src} complete, home {:.7},{:.7}", self.cid, home.lat, home.lon);
            return Ok(());
        }
    }

    async fn listen_telemetry(&self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("drone-{}: telemetry socket closed: {e}", self.cid);
                    return;
                }
            };
            if !self.peer_allowed(src).await {
                debug!("drone-{}: ignoring datagram from foreign address {src}", self.cid);
                continue;
            }
            match Message::from_slice(&buf[..len]) {
                Ok(msg) => self.ingest(msg).await,
                Err(e) => debug!("drone-{}: dropping malformed datagram from {src}: {e}", self.cid),
            }
        }
    }

    async fn peer_allowed(&self, src: SocketAddr) -> bool {
        if !self.settings.enforce_peer_address {
            return true;
        }
        self.state.read().await.peer.is_some_and(|p| p.ip() == src.ip())
    }

    async fn ingest(&self, msg: Message) {
        let task_done = {
            let mut st = self.state.write().await;
            if msg.msg_type() == MsgType::Stat {
                if let Some(body) = msg.body() {
                    self.apply_stat(&mut st, body);
                }
            }
            st.task_done
        };
        if !task_done {
            self.events.emit(ClusterEvent::MessageIn { cid: self.cid, message: msg });
        }
    }

    fn apply_stat(&self, st: &mut SessionState, body: &Value) {
        if !st.status.merge(body) {
            return;
        }
        let pos = st.status.position();
        let armed = st.status.armed;
        if let (Some(display), true) = (st.display, pos.is_valid()) {
            self.map.set_position(display.marker, pos);
        }
        let grew = st.flight.record(armed, pos, &*self.map);
        if grew && st.flight.trace().len() >= 2 {
            if let Some(display) = st.display {
                self.map.set_path(display.trace, st.flight.trace());
            }
        }
    }

    // ── TCP command channel ──────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = listener.accept() => r,
            };
            let (stream, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("drone-{}: TCP accept failed: {e}", self.cid);
                    continue;
                }
            };
            if !self.peer_allowed(peer).await {
                warn!("drone-{}: rejecting TCP connection from {peer}: not the handshake peer", self.cid);
                continue;
            }

            let mut writer = self.writer.lock().await;
            if writer.is_some() {
                warn!("drone-{}: rejecting second TCP connection from {peer}", self.cid);
                continue;
            }
            let (read, write) = stream.into_split();
            *writer = Some(FramedWrite::new(write, MavcCodec::new()));
            drop(writer);

            {
                let mut st = self.state.write().await;
                if matches!(st.phase, SessionPhase::CidSent | SessionPhase::TelemetryActive) {
                    st.phase = SessionPhase::TcpConnected;
                }
            }
            info!("drone-{}: command channel connected from {peer}", self.cid);
            tokio::spawn(self.clone().read_commands(FramedRead::new(read, MavcCodec::new()), peer));
        }
        info!("drone-{}: TCP command server closed", self.cid);
    }

    async fn read_commands(self: Arc<Self>, mut frames: FramedRead<OwnedReadHalf, MavcCodec>, peer: SocketAddr) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                n = frames.next() => n,
            };
            match next {
                Some(Ok(msg)) => self.handle_command_frame(msg).await,
                Some(Err(e)) => {
                    warn!("drone-{}: command channel error from {peer}: {e}", self.cid);
                    break;
                }
                None => {
                    info!("drone-{}: command channel closed by {peer}", self.cid);
                    break;
                }
            }
        }
        *self.writer.lock().await = None;
    }

    async fn handle_command_frame(&self, msg: Message) {
        if self.state.read().await.task_done {
            return;
        }
        let arrived = (msg.msg_type() == MsgType::Arrived).then(|| msg.body_as::<Arrived>());
        self.events.emit(ClusterEvent::MessageIn { cid: self.cid, message: msg });

        match arrived {
            Some(Some(a)) if a.cid == self.cid => {
                debug!("drone-{}: ARRIVED step {:?}", self.cid, a.step);
                self.events.arrive(self.cid, a.step);
            }
            Some(Some(a)) => {
                warn!("drone-{}: ignoring ARRIVED addressed to CID {}", self.cid, a.cid);
            }
            Some(None) => debug!("drone-{}: ARRIVED without a usable body", self.cid),
            None => {}
        }
    }

    /// Send one MAVC message over the TCP command channel (`$$`-framed).
    ///
    /// A peer that stops reading stalls the send; past the write timeout the
    /// channel is dropped so other callers do not queue behind it.
    pub async fn write_data_to_pi(&self, msg: &Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ClusterError::NotConnected(self.cid));
        };
        let limit = self.settings.write_timeout;
        match tokio::time::timeout(limit, writer.send(msg.clone())).await {
            Ok(sent) => sent?,
            Err(_) => {
                *guard = None;
                warn!("drone-{}: command write stalled for {limit:?}, dropping the channel", self.cid);
                return Err(ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("write to drone-{} timed out", self.cid),
                )));
            }
        }
        drop(guard);
        self.events.emit(ClusterEvent::MessageOut { cid: Some(self.cid), message: msg.clone() });
        Ok(())
    }

    // ── Task lifecycle ───────────────────────────────────────────────────────

    pub async fn begin_task(&self) {
        let mut st = self.state.write().await;
        if matches!(st.phase, SessionPhase::TelemetryActive | SessionPhase::TcpConnected) {
            st.phase = SessionPhase::TaskActive;
        }
    }

    pub async fn end_task(&self) {
        let connected = self.is_connected().await;
        let mut st = self.state.write().await;
        if st.phase == SessionPhase::TaskActive {
            st.phase = if connected { SessionPhase::TcpConnected } else { SessionPhase::TelemetryActive };
        }
    }

    /// Tell the drone it is done (DONE over TCP) and stop processing its traffic.
    pub async fn finish(&self) -> Result<()> {
        let done = Message::monitor(MsgType::Done, json!({ "CID": self.cid }));
        let sent = self.write_data_to_pi(&done).await;
        {
            let mut st = self.state.write().await;
            st.task_done = true;
            st.phase = SessionPhase::TaskDone;
        }
        self.shutdown.cancel();
        info!("drone-{}: task done", self.cid);
        match sent {
            Err(ClusterError::NotConnected(cid)) => {
                warn!("drone-{cid}: finished without a command channel, DONE not delivered");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn clear_trace(&self) {
        let mut st = self.state.write().await;
        if st.flight.clear() {
            if let Some(display) = st.display {
                self.map.set_path(display.trace, &[]);
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn kind(&self) -> DroneKind {
        self.kind
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.read().await.phase
    }

    pub async fn status(&self) -> DroneStatus {
        self.state.read().await.status.clone()
    }

    pub async fn home(&self) -> HomePosition {
        self.state.read().await.home
    }

    pub async fn display(&self) -> Option<DisplayHandles> {
        self.state.read().await.display
    }

    pub async fn distance_m(&self) -> f64 {
        self.state.read().await.flight.distance_m()
    }

    pub async fn task_times(&self) -> TaskTimes {
        self.state.read().await.flight.times()
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    pub async fn snapshot(&self) -> DroneSnapshot {
        let st = self.state.read().await;
        DroneSnapshot {
            cid: self.cid,
            kind: self.kind,
            phase: st.phase,
            status: st.status.clone(),
            home: st.home,
            peer: st.peer,
            distance_m: st.flight.distance_m(),
            task_times: st.flight.times(),
            trace_len: st.flight.trace().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::HeadlessMap;
    use mavc_types::GeoPoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::broadcast;

    const WAIT: Duration = Duration::from_secs(2);

    fn config(base_port: u16) -> MonitorConfig {
        MonitorConfig { base_port, ..Default::default() }
    }

    async fn wait_for_phase(session: &DroneSession, phase: SessionPhase) {
        for _ in 0..100 {
            if session.phase().await == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session never reached {phase:?}, stuck at {:?}", session.phase().await);
    }

    async fn next_message_in(rx: &mut broadcast::Receiver<ClusterEvent>) -> Message {
        loop {
            let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if let ClusterEvent::MessageIn { message, .. } = event {
                return message;
            }
        }
    }

    /// Send REQ_CID from `drone` to `port` and return the assigned CID.
    async fn request_cid(drone: &UdpSocket, port: u16) -> Cid {
        let req = Message::drone(MsgType::ReqCid, json!({ "Lat": 31.88, "Lon": 118.81 }));
        drone.send_to(&req.to_bytes().unwrap(), ("127.0.0.1", port)).await.unwrap();
        let mut buf = vec![0u8; 1024];
        let (len, _) = tokio::time::timeout(WAIT, drone.recv_from(&mut buf)).await.unwrap().unwrap();
        let reply = Message::from_slice(&buf[..len]).unwrap();
        assert_eq!(reply.msg_type(), MsgType::Cid);
        reply.body().and_then(|b| b["CID"].as_u64()).unwrap() as Cid
    }

    async fn start(cid: Cid, kind: DroneKind, config: &MonitorConfig) -> (Arc<DroneSession>, Arc<HeadlessMap>, EventBus) {
        let map = Arc::new(HeadlessMap::new());
        let (bus, _arrivals) = EventBus::new(64);
        let session = DroneSession::start(cid, kind, config, map.clone(), bus.clone()).await.unwrap();
        (session, map, bus)
    }

    #[tokio::test]
    async fn simulated_handshake_ignores_noise_and_assigns_cid() {
        let config = config(47100);
        let (session, map, _bus) = start(1, DroneKind::Simulated, &config).await;
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        drone.send_to(b"definitely not json", ("127.0.0.1", 47101)).await.unwrap();
        let stat = Message::drone(MsgType::Stat, json!({ "Lat": 1.0 }));
        drone.send_to(&stat.to_bytes().unwrap(), ("127.0.0.1", 47101)).await.unwrap();

        assert_eq!(request_cid(&drone, 47101).await, 1);
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        assert_eq!(session.home().await, HomePosition { lat: 31.88, lon: 118.81 });
        assert!(!session.status().await.position().is_valid());
        let display = session.display().await.unwrap();
        assert_eq!(map.marker_position(display.marker), Some(GeoPoint::new(31.88, 118.81)));
    }

    #[tokio::test]
    async fn real_drone_handshakes_on_base_port_and_reports_on_its_own() {
        let config = config(47110);
        let (session, _map, bus) = start(2, DroneKind::Real, &config).await;
        let mut events = bus.subscribe();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert_eq!(request_cid(&drone, 47110).await, 2);
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        let stat = Message::drone(MsgType::Stat, json!({ "CID": 2, "Lat": 10, "Lon": 20, "Armed": true }));
        drone.send_to(&stat.to_bytes().unwrap(), ("127.0.0.1", 47112)).await.unwrap();
        let seen = next_message_in(&mut events).await;
        assert_eq!(seen, stat);

        let status = session.status().await;
        assert_eq!((status.lat, status.lon, status.armed), (10.0, 20.0, true));
        assert_eq!(status.mode, "");
    }

    #[tokio::test]
    async fn malformed_telemetry_leaves_status_untouched() {
        let config = config(47120);
        let (session, _map, bus) = start(1, DroneKind::Simulated, &config).await;
        let mut events = bus.subscribe();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47121).await;
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;
        let before = session.status().await;

        drone.send_to(b"[{\"Header\":\"MAVCluster_Drone\"", ("127.0.0.1", 47121)).await.unwrap();
        drone.send_to(b"{}", ("127.0.0.1", 47121)).await.unwrap();
        let response = Message::drone(MsgType::DelayResponse, json!({ "CID": 1, "Get_time": 5 }));
        drone.send_to(&response.to_bytes().unwrap(), ("127.0.0.1", 47121)).await.unwrap();

        // Only the well-formed response comes through, and it is not a STAT.
        assert_eq!(next_message_in(&mut events).await, response);
        assert_eq!(session.status().await, before);
    }

    #[tokio::test]
    async fn armed_stats_accumulate_distance_and_draw_the_trace() {
        let config = config(47130);
        let (session, map, bus) = start(1, DroneKind::Simulated, &config).await;
        let mut events = bus.subscribe();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47131).await;
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        for (lat, lon) in [(31.0, 118.0), (31.0, 118.001), (31.001, 118.001)] {
            let stat = Message::drone(MsgType::Stat, json!({ "Armed": true, "Lat": lat, "Lon": lon }));
            drone.send_to(&stat.to_bytes().unwrap(), ("127.0.0.1", 47131)).await.unwrap();
            next_message_in(&mut events).await;
        }

        // one east leg at 31N, one north leg
        let expected = 0.001 * 1.113195e5 * (31f64.to_radians().cos() + 1.0);
        assert!((session.distance_m().await - expected).abs() < 1e-3);
        let display = session.display().await.unwrap();
        assert_eq!(map.path(display.trace).len(), 3);
        assert!(session.task_times().await.start.is_some());

        session.clear_trace().await;
        assert_eq!(session.distance_m().await, 0.0);
        assert!(map.path(display.trace).is_empty());
    }

    #[tokio::test]
    async fn arrived_over_tcp_reaches_the_barrier_channel() {
        let config = config(47140);
        let map = Arc::new(HeadlessMap::new());
        let (bus, mut arrivals) = EventBus::new(64);
        let session = DroneSession::start(1, DroneKind::Simulated, &config, map, bus).await.unwrap();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47141).await;
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        let mut tcp = TcpStream::connect("127.0.0.1:47141").await.unwrap();
        wait_for_phase(&session, SessionPhase::TcpConnected).await;

        let wrong = Message::drone(MsgType::Arrived, json!({ "CID": 5, "Step": 0 }));
        let right = Message::drone(MsgType::Arrived, json!({ "CID": 1, "Step": 0 }));
        let mut frame = wrong.to_bytes().unwrap();
        frame.extend_from_slice(b"$$");
        // Pi relays send ARRIVED without the delimiter
        frame.extend_from_slice(&right.to_bytes().unwrap());
        tcp.write_all(&frame).await.unwrap();

        let arrival = tokio::time::timeout(WAIT, arrivals.recv()).await.unwrap().unwrap();
        assert_eq!((arrival.cid, arrival.step), (1, Some(0)));
        assert!(arrivals.try_recv().is_err());
    }

    #[tokio::test]
    async fn commands_are_framed_and_second_peer_is_rejected() {
        let config = config(47150);
        let (session, _map, _bus) = start(1, DroneKind::Simulated, &config).await;
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let done = Message::monitor(MsgType::Done, json!({}));
        assert!(matches!(session.write_data_to_pi(&done).await, Err(ClusterError::NotConnected(1))));

        request_cid(&drone, 47151).await;
        let mut first = TcpStream::connect("127.0.0.1:47151").await.unwrap();
        wait_for_phase(&session, SessionPhase::TcpConnected).await;

        let mut second = TcpStream::connect("127.0.0.1:47151").await.unwrap();
        let mut scratch = [0u8; 16];
        let n = tokio::time::timeout(WAIT, second.read(&mut scratch)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0, "second connection should be closed by the monitor");

        let geofence = Message::monitor(MsgType::SetGeofence, json!({ "Radius": 50.0, "Lat": 31.0, "Lon": 118.0 }));
        session.write_data_to_pi(&geofence).await.unwrap();
        let expected = [geofence.to_bytes().unwrap(), b"$$".to_vec()].concat();
        let mut received = vec![0u8; expected.len()];
        tokio::time::timeout(WAIT, first.read_exact(&mut received)).await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn finish_sends_done_and_silences_events() {
        let config = config(47160);
        let (session, _map, bus) = start(1, DroneKind::Simulated, &config).await;
        let mut events = bus.subscribe();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47161).await;
        let mut tcp = TcpStream::connect("127.0.0.1:47161").await.unwrap();
        wait_for_phase(&session, SessionPhase::TcpConnected).await;

        session.finish().await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::TaskDone);

        let mut codec_buf = vec![0u8; 256];
        let n = tokio::time::timeout(WAIT, tcp.read(&mut codec_buf)).await.unwrap().unwrap();
        let frame = std::str::from_utf8(&codec_buf[..n]).unwrap();
        assert!(frame.contains("\"Type\":6") && frame.ends_with("$$"));

        // Status still merges, but nothing reaches observers any more.
        while events.try_recv().is_ok() {}
        let stat = Message::drone(MsgType::Stat, json!({ "Lat": 12.0, "Lon": 34.0 }));
        drone.send_to(&stat.to_bytes().unwrap(), ("127.0.0.1", 47161)).await.unwrap();
        for _ in 0..50 {
            if session.status().await.lat == 12.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.status().await.lat, 12.0);
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn foreign_source_address_is_ignored_when_enforced() {
        let config = config(47170);
        let (session, _map, bus) = start(1, DroneKind::Simulated, &config).await;
        let mut events = bus.subscribe();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47171).await;
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        let intruder = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        let spoofed = Message::drone(MsgType::Stat, json!({ "Lat": 66.0, "Lon": 66.0 }));
        intruder.send_to(&spoofed.to_bytes().unwrap(), ("127.0.0.1", 47171)).await.unwrap();
        let genuine = Message::drone(MsgType::Stat, json!({ "Lat": 1.0, "Lon": 2.0 }));
        drone.send_to(&genuine.to_bytes().unwrap(), ("127.0.0.1", 47171)).await.unwrap();

        assert_eq!(next_message_in(&mut events).await, genuine);
        assert_eq!(session.status().await.lat, 1.0);
    }

    #[tokio::test]
    async fn foreign_source_address_is_accepted_when_not_enforced() {
        let config = MonitorConfig { enforce_peer_address: false, ..config(47180) };
        let (session, _map, bus) = start(1, DroneKind::Simulated, &config).await;
        let mut events = bus.subscribe();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47181).await;
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        let other = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        let stat = Message::drone(MsgType::Stat, json!({ "Lat": 66.0, "Lon": 66.0 }));
        other.send_to(&stat.to_bytes().unwrap(), ("127.0.0.1", 47181)).await.unwrap();

        assert_eq!(next_message_in(&mut events).await, stat);
        assert_eq!(session.status().await.lat, 66.0);
    }

    #[tokio::test]
    async fn handshake_timeout_marks_session_failed() {
        let config = MonitorConfig { handshake_timeout_secs: Some(0.1), ..config(47190) };
        let (session, _map, _bus) = start(1, DroneKind::Simulated, &config).await;
        wait_for_phase(&session, SessionPhase::Failed).await;
    }

    #[tokio::test]
    async fn port_clash_fails_start() {
        let config = config(47200);
        let _blocker = UdpSocket::bind("127.0.0.1:47201").await.unwrap();
        let map = Arc::new(HeadlessMap::new());
        let (bus, _arrivals) = EventBus::new(4);
        let err = DroneSession::start(1, DroneKind::Simulated, &config, map, bus).await.err().unwrap();
        assert!(matches!(err, ClusterError::Bind { .. }));
    }

    #[tokio::test]
    async fn stalled_peer_times_out_and_frees_the_channel() {
        let config = MonitorConfig { write_timeout_secs: 0.2, ..config(47210) };
        let (session, _map, _bus) = start(1, DroneKind::Simulated, &config).await;
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        request_cid(&drone, 47211).await;
        wait_for_phase(&session, SessionPhase::TelemetryActive).await;

        // Connected but never reads, so the socket buffers eventually fill.
        let _tcp = TcpStream::connect("127.0.0.1:47211").await.unwrap();
        wait_for_phase(&session, SessionPhase::TcpConnected).await;

        let bulky = Message::monitor(MsgType::Stat, json!({ "Pad": "x".repeat(256 * 1024) }));
        let mut failure = None;
        for _ in 0..400 {
            let sent = tokio::time::timeout(WAIT, session.write_data_to_pi(&bulky)).await.unwrap();
            if let Err(e) = sent {
                failure = Some(e);
                break;
            }
        }
        match failure {
            Some(ClusterError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("expected a write timeout, got {other:?}"),
        }
        assert!(!session.is_connected().await);
        assert!(matches!(session.write_data_to_pi(&bulky).await, Err(ClusterError::NotConnected(1))));
    }
}
