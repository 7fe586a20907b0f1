//! # cluster
//!
//! The cluster coordinator owns every drone session (list index + 1 == CID),
//! the subnet broadcaster, and the barrier runner of the active task.
//!
//! ## Task execution
//! 1. `execute_task` parses and decomposes the task into subtask messages
//! 2. subtask 0 is dispatched immediately
//! 3. every ARRIVED report bumps a shared counter; when it reaches the session
//!    count the counter resets and the next subtask is dispatched
//! 4. after the last barrier the sessions go back to idle
//!
//! An optional per-subtask timeout either warns and keeps waiting or forces the
//! next subtask out, depending on `on_subtask_timeout`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mavc_types::{Cid, Geofence, GeoPoint, Message, MsgType};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accounting::TaskTimes;
use crate::barrier::{BarrierStep, SubtaskBarrier};
use crate::broadcast::{broadcast_addr, Broadcaster};
use crate::cid::{next_cid, session_index};
use crate::config::{DispatchMode, MonitorConfig, TimeoutPolicy};
use crate::decompose::{decompose, parse_task};
use crate::error::{ClusterError, Result};
use crate::events::{Arrival, ClusterEvent, EventBus};
use crate::map::MapDisplay;
use crate::session::{DroneKind, DroneSession, DroneSnapshot};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub public_ip: Ipv4Addr,
    pub broadcast_addr: Ipv4Addr,
}

/// Progress of the running task, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub subtask: usize,
    pub total: usize,
    pub ready: usize,
}

struct ActiveTask {
    id: u64,
    token: CancellationToken,
}

pub struct ClusterCoordinator {
    config: MonitorConfig,
    map: Arc<dyn MapDisplay>,
    sessions: RwLock<Vec<Arc<DroneSession>>>,
    add_lock: Mutex<()>,
    events: EventBus,
    arrivals: Mutex<mpsc::UnboundedReceiver<Arrival>>,
    broadcaster: Broadcaster,
    broadcast_addr: Ipv4Addr,
    active_task: Mutex<Option<ActiveTask>>,
    task_seq: AtomicU64,
    progress: RwLock<Option<TaskProgress>>,
}

impl ClusterCoordinator {
    /// Validate `config` and derive the broadcast address. No socket is bound
    /// until the first `add_drone`.
    pub fn new(config: MonitorConfig, map: Arc<dyn MapDisplay>) -> Result<Arc<Self>> {
        config.validate()?;
        let broadcast_ip = broadcast_addr(config.public_ip, config.netmask);
        let broadcaster = Broadcaster::new(
            config.public_ip,
            SocketAddrV4::new(broadcast_ip, config.base_port),
            config.section_size,
        );
        let (events, arrivals) = EventBus::new(EVENT_CAPACITY);
        info!(
            "Cluster: interface {}/{}, broadcasting to {}",
            config.public_ip,
            config.netmask,
            broadcaster.target()
        );
        Ok(Arc::new(Self {
            config,
            map,
            sessions: RwLock::new(Vec::new()),
            add_lock: Mutex::new(()),
            events,
            arrivals: Mutex::new(arrivals),
            broadcaster,
            broadcast_addr: broadcast_ip,
            active_task: Mutex::new(None),
            task_seq: AtomicU64::new(0),
            progress: RwLock::new(None),
        }))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn map(&self) -> Arc<dyn MapDisplay> {
        self.map.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    // ── Membership ───────────────────────────────────────────────────────────

    /// Allocate the next CID and start a session for it. A bind failure aborts
    /// this call only; the CID is not consumed.
    pub async fn add_drone(&self, kind: DroneKind) -> Result<Cid> {
        let _guard = self.add_lock.lock().await;
        let cid = next_cid(self.sessions.read().await.len());
        let session =
            DroneSession::start(cid, kind, &self.config, self.map.clone(), self.events.clone()).await?;
        self.sessions.write().await.push(session);
        self.events.emit(ClusterEvent::NewDroneAdd { cid });
        info!("Cluster: drone-{cid} added ({kind:?})");
        Ok(cid)
    }

    /// Add `count` simulated drones, stopping at the first failure.
    pub async fn add_simulators(&self, count: usize) -> Result<Vec<Cid>> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            added.push(self.add_drone(DroneKind::Simulated).await?);
        }
        Ok(added)
    }

    async fn session(&self, cid: Cid) -> Result<Arc<DroneSession>> {
        let sessions = self.sessions.read().await;
        session_index(cid, sessions.len())
            .map(|i| sessions[i].clone())
            .ok_or(ClusterError::UnknownDrone(cid))
    }

    async fn all_sessions(&self) -> Vec<Arc<DroneSession>> {
        self.sessions.read().await.clone()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get_connection_info(&self) -> ConnectionInfo {
        ConnectionInfo { public_ip: self.config.public_ip, broadcast_addr: self.broadcast_addr }
    }

    /// Flown distance per drone, indexed by CID - 1.
    pub async fn get_distances(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for s in self.all_sessions().await {
            out.push(s.distance_m().await);
        }
        out
    }

    /// Task start/end per drone, indexed by CID - 1.
    pub async fn get_task_times(&self) -> Vec<TaskTimes> {
        let mut out = Vec::new();
        for s in self.all_sessions().await {
            out.push(s.task_times().await);
        }
        out
    }

    pub async fn get_drone(&self, cid: Cid) -> Result<DroneSnapshot> {
        Ok(self.session(cid).await?.snapshot().await)
    }

    pub async fn get_drone_num(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn task_progress(&self) -> Option<TaskProgress> {
        *self.progress.read().await
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    pub async fn clear_trace(&self) {
        for s in self.all_sessions().await {
            s.clear_trace().await;
        }
    }

    /// Broadcast `message` on the subnet, fragmenting oversized ACTIONs.
    pub async fn broadcast_msg(&self, message: &Message) -> Result<usize> {
        let sent = self.broadcaster.send(message).await?;
        self.events.emit(ClusterEvent::MessageOut { cid: None, message: message.clone() });
        Ok(sent)
    }

    /// Send `message` to one drone over its TCP command channel.
    pub async fn send_msg(&self, cid: Cid, message: &Message) -> Result<()> {
        self.session(cid).await?.write_data_to_pi(message).await
    }

    pub async fn set_geofence(&self, radius: f64, lat: f64, lon: f64) -> Result<()> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(ClusterError::InvalidArgument(format!("geofence radius {radius} must be positive")));
        }
        if !GeoPoint::new(lat, lon).is_valid() {
            return Err(ClusterError::InvalidArgument(format!("geofence center {lat},{lon} is out of range")));
        }
        let body = serde_json::to_value(Geofence { radius, lat, lon })
            .map_err(mavc_types::CodecError::from)?;
        self.broadcast_msg(&Message::monitor(MsgType::SetGeofence, body)).await?;
        info!("Cluster: geofence set, {radius} m around {lat:.7},{lon:.7}");
        Ok(())
    }

    /// Send DONE to every drone and stop the running task, if any.
    pub async fn finish_all(&self) {
        self.cancel_task().await;
        for s in self.all_sessions().await {
            if let Err(e) = s.finish().await {
                warn!("Cluster: drone-{} did not take DONE: {e}", s.cid());
            }
        }
    }

    // ── Task execution ───────────────────────────────────────────────────────

    /// Stop the running task without sending anything to the drones; they keep
    /// whatever actions they already hold. False when no task is running.
    pub async fn cancel_task(&self) -> bool {
        let mut active = self.active_task.lock().await;
        let Some(task) = active.take() else { return false };
        task.token.cancel();
        *self.progress.write().await = None;
        for s in self.all_sessions().await {
            s.end_task().await;
        }
        info!("Cluster: task {} cancelled", task.id);
        true
    }

    /// Parse, decompose and start a task. Returns the number of subtasks.
    pub async fn execute_task(self: &Arc<Self>, raw: &str) -> Result<usize> {
        let sessions = self.all_sessions().await;
        if sessions.is_empty() {
            return Err(ClusterError::EmptyCluster);
        }
        let mut active = self.active_task.lock().await;
        if active.is_some() {
            return Err(ClusterError::TaskInProgress);
        }

        let actions = parse_task(raw, self.config.task_validation, sessions.len())?;
        let subtasks = decompose(actions);
        if subtasks.is_empty() {
            return Err(ClusterError::InvalidTask("task has no actions".into()));
        }
        let total = subtasks.len();

        self.clear_trace().await;
        for s in &sessions {
            s.begin_task().await;
        }

        let id = self.task_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *active = Some(ActiveTask { id, token: token.clone() });
        drop(active);

        let barrier = SubtaskBarrier::new(subtasks, sessions.len());
        info!("Cluster: task started, {total} subtask(s) across {} drone(s)", sessions.len());
        let this = self.clone();
        tokio::spawn(async move {
            this.run_task(id, barrier, token).await;
        });
        Ok(total)
    }

    async fn run_task(self: Arc<Self>, id: u64, mut barrier: SubtaskBarrier, token: CancellationToken) {
        let mut arrivals = self.arrivals.lock().await;
        while arrivals.try_recv().is_ok() {}

        if let Some(first) = barrier.first().cloned() {
            self.dispatch(0, &first).await;
        }
        self.set_progress(id, &barrier).await;

        let timeout = self.config.subtask_timeout();
        loop {
            if !barrier.awaits_arrivals() {
                info!("Cluster: task complete, final subtask {} has no barrier", barrier.current());
                break;
            }
            let step = tokio::select! {
                _ = token.cancelled() => {
                    info!("Cluster: task cancelled at subtask {}", barrier.current());
                    break;
                }
                next = next_arrival(&mut arrivals, timeout) => match next {
                    Some(Some(arrival)) => {
                        info!("Cluster: drone-{} arrived (step {:?})", arrival.cid, arrival.step);
                        barrier.arrive()
                    }
                    Some(None) => {
                        let index = barrier.current();
                        match self.config.on_subtask_timeout {
                            TimeoutPolicy::Warn => {
                                warn!(
                                    "Cluster: subtask {index} still waiting ({}/{} arrived)",
                                    barrier.ready(),
                                    self.get_drone_num().await
                                );
                                continue;
                            }
                            TimeoutPolicy::Advance => {
                                warn!("Cluster: subtask {index} timed out, advancing");
                                barrier.force_advance()
                            }
                        }
                    }
                    None => {
                        error!("Cluster: arrival channel closed");
                        break;
                    }
                },
            };

            match step {
                BarrierStep::Waiting { ready, needed } => {
                    info!("Cluster: barrier {ready}/{needed}");
                }
                BarrierStep::Release { index, message } => {
                    self.dispatch(index, &message).await;
                }
                BarrierStep::Complete => {
                    info!("Cluster: task complete after {} subtask(s)", barrier.total());
                    break;
                }
            }
            self.set_progress(id, &barrier).await;
        }

        // A cancelled task was already cleaned up and may have a successor.
        let mut active = self.active_task.lock().await;
        if active.as_ref().is_some_and(|t| t.id == id) {
            *active = None;
            *self.progress.write().await = None;
            for s in self.all_sessions().await {
                s.end_task().await;
            }
        }
    }

    async fn set_progress(&self, id: u64, barrier: &SubtaskBarrier) {
        let active = self.active_task.lock().await;
        if active.as_ref().is_some_and(|t| t.id == id) {
            *self.progress.write().await = Some(TaskProgress {
                subtask: barrier.current(),
                total: barrier.total(),
                ready: barrier.ready(),
            });
        }
    }

    async fn dispatch(&self, index: usize, message: &Message) {
        info!("Cluster: dispatching subtask {index} ({} action(s))", message.payload.len());
        match self.config.dispatch {
            DispatchMode::Broadcast => {
                if let Err(e) = self.broadcast_msg(message).await {
                    error!("Cluster: broadcast of subtask {index} failed: {e}");
                }
            }
            DispatchMode::Stream => {
                for s in self.all_sessions().await {
                    if let Err(e) = s.write_data_to_pi(message).await {
                        warn!("Cluster: subtask {index} not delivered to drone-{}: {e}", s.cid());
                    }
                }
            }
        }
    }
}

/// `None`: channel closed. `Some(None)`: timed out.
async fn next_arrival(
    rx: &mut mpsc::UnboundedReceiver<Arrival>,
    timeout: Option<std::time::Duration>,
) -> Option<Option<Arrival>> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
            Ok(received) => received.map(Some),
            Err(_) => Some(None),
        },
        None => rx.recv().await.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::HeadlessMap;
    use crate::session::SessionPhase;

    fn coordinator(base_port: u16) -> Arc<ClusterCoordinator> {
        let config = MonitorConfig { base_port, ..Default::default() };
        ClusterCoordinator::new(config, Arc::new(HeadlessMap::new())).unwrap()
    }

    #[test]
    fn bad_netmask_is_fatal_at_construction() {
        let config = MonitorConfig { netmask: Ipv4Addr::new(255, 0, 255, 0), ..Default::default() };
        assert!(matches!(
            ClusterCoordinator::new(config, Arc::new(HeadlessMap::new())),
            Err(ClusterError::Config(_))
        ));
    }

    #[test]
    fn connection_info_uses_derived_broadcast_address() {
        let config = MonitorConfig {
            public_ip: Ipv4Addr::new(192, 168, 1, 42),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            ..Default::default()
        };
        let coord = ClusterCoordinator::new(config, Arc::new(HeadlessMap::new())).unwrap();
        let info = coord.get_connection_info();
        assert_eq!(info.broadcast_addr, Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({ "publicIp": "192.168.1.42", "broadcastAddr": "192.168.1.255" })
        );
    }

    #[tokio::test]
    async fn cids_are_sequential_and_failures_do_not_consume_them() {
        let coord = coordinator(47300);
        let mut events = coord.subscribe();
        assert_eq!(coord.add_simulators(2).await.unwrap(), vec![1, 2]);

        let _blocker = tokio::net::UdpSocket::bind("127.0.0.1:47303").await.unwrap();
        assert!(matches!(coord.add_drone(DroneKind::Simulated).await, Err(ClusterError::Bind { .. })));
        assert_eq!(coord.get_drone_num().await, 2);
        drop(_blocker);
        assert_eq!(coord.add_drone(DroneKind::Simulated).await.unwrap(), 3);

        let mut added = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClusterEvent::NewDroneAdd { cid } = event {
                added.push(cid);
            }
        }
        assert_eq!(added, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn task_preconditions() {
        let coord = coordinator(47310);
        assert!(matches!(coord.execute_task("[]").await, Err(ClusterError::EmptyCluster)));

        coord.add_drone(DroneKind::Simulated).await.unwrap();
        assert!(matches!(coord.execute_task("[]").await, Err(ClusterError::InvalidTask(_))));
        assert!(matches!(
            coord.execute_task(r#"[{"CID": 2, "Action_type": 0, "Alt": 5}]"#).await,
            Err(ClusterError::InvalidTask(_))
        ));
        assert!(matches!(coord.get_drone(4).await, Err(ClusterError::UnknownDrone(4))));
        assert!(matches!(
            coord.send_msg(1, &Message::monitor(MsgType::Done, serde_json::json!({}))).await,
            Err(ClusterError::NotConnected(1))
        ));
    }

    #[tokio::test]
    async fn geofence_arguments_are_checked() {
        let coord = coordinator(47320);
        assert!(coord.set_geofence(-1.0, 31.0, 118.0).await.is_err());
        assert!(coord.set_geofence(50.0, 91.0, 118.0).await.is_err());
    }

    #[tokio::test]
    async fn queries_are_indexed_by_cid() {
        let coord = coordinator(47330);
        coord.add_simulators(3).await.unwrap();
        assert_eq!(coord.get_distances().await, vec![0.0; 3]);
        assert_eq!(coord.get_task_times().await.len(), 3);
        assert_eq!(coord.get_drone(2).await.unwrap().cid, 2);
        assert_eq!(coord.task_progress().await, None);
    }

    #[tokio::test]
    async fn a_stuck_task_can_be_cancelled_and_replaced() {
        let config = MonitorConfig {
            base_port: 47340,
            netmask: Ipv4Addr::new(255, 255, 255, 255),
            ..Default::default()
        };
        let coord = ClusterCoordinator::new(config, Arc::new(HeadlessMap::new())).unwrap();
        assert!(!coord.cancel_task().await);
        coord.add_simulators(2).await.unwrap();

        // Only one lane of the final subtask is a barrier: two ARRIVEDs never come.
        let task = r#"[
            {"CID": 1, "Action_type": 3, "Sync": true, "Lat": 31.0, "Lon": 118.0},
            {"CID": 2, "Action_type": 3, "Sync": false, "Lat": 31.0, "Lon": 118.0}
        ]"#;
        assert_eq!(coord.execute_task(task).await.unwrap(), 1);
        assert!(matches!(coord.execute_task(task).await, Err(ClusterError::TaskInProgress)));

        assert!(coord.cancel_task().await);
        assert_eq!(coord.task_progress().await, None);
        assert!(!coord.cancel_task().await);

        assert_eq!(coord.execute_task(task).await.unwrap(), 1);
        for s in coord.all_sessions().await {
            assert_ne!(s.phase().await, SessionPhase::TaskDone);
        }
        assert!(coord.cancel_task().await);
    }
}
