//! kinematics.rs: simulated multicopter
//!
//! Flat-earth point-mass model: straight-line horizontal moves at a fixed
//! ground speed, vertical moves at a fixed climb rate. Actions are executed one
//! at a time from a queue; each finished action is handed back to the caller so
//! it can report ARRIVED for barrier actions.
//!
//! No panics, no unwraps: bad parameters skip the action with a warning.

use std::collections::VecDeque;

use mavc_types::geo::{offset_by_meters, planar_distance_m};
use mavc_types::{Action, ActionType, GeoPoint, Geofence};
use tracing::{info, warn};

/// Horizontal distance at which a target counts as reached (m)
const ARRIVAL_RADIUS_M: f64 = 0.5;
/// Vertical tolerance for reaching a target altitude (m)
const ALT_TOLERANCE_M: f64 = 0.2;
/// Below this altitude a landing vehicle touches down and disarms (m)
const TOUCHDOWN_ALT_M: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionLimits {
    pub speed_mps: f64,
    pub climb_mps: f64,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self { speed_mps: 5.0, climb_mps: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Goal {
    Fly { to: GeoPoint, alt: f64 },
    Land { to: GeoPoint },
    Hold { remaining_s: f64 },
    /// Geofence breach: fly home, nothing to report
    ReturnHome { alt: f64 },
}

#[derive(Debug, Clone)]
struct Running {
    action: Option<Action>,
    goal: Goal,
}

#[derive(Debug, Clone)]
pub struct Vehicle {
    pub pos: GeoPoint,
    pub alt: f64,
    pub armed: bool,
    pub mode: String,
    home: GeoPoint,
    limits: MotionLimits,
    queue: VecDeque<Action>,
    running: Option<Running>,
    geofence: Option<Geofence>,
}

impl Vehicle {
    pub fn new(home: GeoPoint, limits: MotionLimits) -> Self {
        Self {
            pos: home,
            alt: 0.0,
            armed: false,
            mode: "STABILIZE".to_string(),
            home,
            limits,
            queue: VecDeque::new(),
            running: None,
            geofence: None,
        }
    }

    pub fn enqueue(&mut self, actions: impl IntoIterator<Item = Action>) {
        self.queue.extend(actions);
    }

    pub fn set_geofence(&mut self, fence: Geofence) {
        info!("Vehicle: geofence {} m around {:.7},{:.7}", fence.radius, fence.lat, fence.lon);
        self.geofence = Some(fence);
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_none() && self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.running.is_some())
    }

    /// Advance the simulation by `dt` seconds. Returns the action that finished
    /// during this step, if any.
    pub fn step(&mut self, dt: f64) -> Option<Action> {
        self.check_geofence();
        if self.running.is_none() {
            self.running = self.start_next();
        }
        let running = self.running.as_mut()?;

        let done = match running.goal.clone() {
            Goal::Fly { to, alt } => self.move_towards(to, alt, dt),
            Goal::ReturnHome { alt } => {
                let home = self.home;
                self.move_towards(home, alt, dt)
            }
            Goal::Land { to } => {
                let reached = self.move_towards(to, 0.0, dt);
                if self.alt < TOUCHDOWN_ALT_M && planar_distance_m(self.pos, to) < ARRIVAL_RADIUS_M {
                    self.alt = 0.0;
                    self.armed = false;
                    self.mode = "LAND".to_string();
                    true
                } else {
                    reached
                }
            }
            Goal::Hold { remaining_s } => {
                let left = remaining_s - dt;
                if let Some(r) = self.running.as_mut() {
                    r.goal = Goal::Hold { remaining_s: left };
                }
                left <= 0.0
            }
        };

        if !done {
            return None;
        }
        self.running.take().and_then(|r| r.action)
    }

    fn start_next(&mut self) -> Option<Running> {
        while let Some(action) = self.queue.pop_front() {
            match self.goal_for(&action) {
                Some(goal) => return Some(Running { action: Some(action), goal }),
                None => warn!(
                    "Vehicle: skipping action {:?} (step {:?}): missing parameters",
                    action.action_type, action.step
                ),
            }
        }
        None
    }

    fn goal_for(&mut self, action: &Action) -> Option<Goal> {
        match action.action_type {
            ActionType::ArmAndTakeoff => {
                let alt = action.param("Alt")?;
                self.armed = true;
                self.mode = "GUIDED".to_string();
                Some(Goal::Fly { to: self.pos, alt })
            }
            ActionType::GoTo => {
                let to = GeoPoint::new(action.param("Lat")?, action.param("Lon")?);
                Some(Goal::Fly { to, alt: action.param("Alt").unwrap_or(self.alt) })
            }
            ActionType::GoBy => {
                let to = offset_by_meters(self.pos, action.param("N")?, action.param("E")?);
                Some(Goal::Fly { to, alt: action.param("Alt").unwrap_or(self.alt) })
            }
            ActionType::Land => {
                let to = match (action.param("Lat"), action.param("Lon")) {
                    (Some(lat), Some(lon)) => GeoPoint::new(lat, lon),
                    _ => self.pos,
                };
                self.mode = "LAND".to_string();
                Some(Goal::Land { to })
            }
            ActionType::Wait => Some(Goal::Hold { remaining_s: action.param("Time")? }),
            ActionType::Other(_) => None,
        }
    }

    /// Straight-line move towards `to`/`alt`. True once both are reached.
    fn move_towards(&mut self, to: GeoPoint, alt: f64, dt: f64) -> bool {
        let remaining = planar_distance_m(self.pos, to);
        let stride = self.limits.speed_mps * dt;
        if remaining <= stride || remaining < f64::EPSILON {
            self.pos = to;
        } else {
            let f = stride / remaining;
            self.pos = GeoPoint::new(
                self.pos.lat + (to.lat - self.pos.lat) * f,
                self.pos.lon + (to.lon - self.pos.lon) * f,
            );
        }

        let climb = self.limits.climb_mps * dt;
        let d_alt = alt - self.alt;
        self.alt = if d_alt.abs() <= climb { alt } else { self.alt + climb.copysign(d_alt) };

        planar_distance_m(self.pos, to) < ARRIVAL_RADIUS_M && (self.alt - alt).abs() < ALT_TOLERANCE_M
    }

    fn check_geofence(&mut self) {
        let Some(fence) = self.geofence else { return };
        if !self.armed || matches!(self.running, Some(Running { goal: Goal::ReturnHome { .. }, .. })) {
            return;
        }
        let from_center = planar_distance_m(self.pos, GeoPoint::new(fence.lat, fence.lon));
        if from_center > fence.radius {
            warn!(
                "Vehicle: outside geofence ({from_center:.1} m > {} m), dropping {} action(s) and returning home",
                fence.radius,
                self.pending()
            );
            self.queue.clear();
            self.mode = "RTL".to_string();
            self.running = Some(Running { action: None, goal: Goal::ReturnHome { alt: self.alt } });
        }
    }
}
