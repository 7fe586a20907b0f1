//! # mavc-types
//!
//! Wire structures of the MAVC protocol spoken between the cluster monitor and
//! the drones (physical Pi relays or SITL simulators).
//!
//! These types are used by:
//! - `monitor-rust`: session handshake, telemetry ingestion, task dispatch
//! - `drone-simulator`: the drone side of the same conversation
//!
//! ## Envelope
//!
//! Every message is a JSON array whose first element is the header:
//!
//! ```text
//! [{"Header": "MAVCluster_Drone", "Type": 2}, {"CID": 1, "Armed": true, ...}]
//! ```
//!
//! Most types carry exactly one body object after the header. ACTION and
//! ACTION_SEC carry a list of action objects instead.
//!
//! ## Ports
//! - UDP `4396`: CID handshake for real drones, broadcast commands
//! - UDP `4396 + CID`: handshake for simulators, telemetry afterwards
//! - TCP `4396 + CID`: command channel, `$$`-delimited frames

pub mod codec;
pub mod geo;
pub mod sections;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use codec::MavcCodec;
pub use sections::{split_into_sections, SectionAssembler};

/// Connection ID handed out by the monitor, starting at 1.
pub type Cid = u32;

/// Handshake / broadcast port. Per-drone ports are `DEFAULT_BASE_PORT + CID`.
pub const DEFAULT_BASE_PORT: u16 = 4396;

/// Maximum number of actions carried by one ACTION datagram before it is split.
pub const DEFAULT_SECTION_SIZE: usize = 8;

/// Latitude/longitude value meaning "no fix yet" (outside every valid range).
pub const UNKNOWN_COORD: f64 = 361.0;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a MAVC envelope: {0}")]
    Envelope(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Which endpoint produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "MAVCluster_Monitor")]
    Monitor,
    #[serde(rename = "MAVCluster_Drone")]
    Drone,
}

/// Message type namespace. Unknown values survive decoding as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum MsgType {
    ReqCid,
    Cid,
    Stat,
    SetGeofence,
    Action,
    Arrived,
    Done,
    /// One numbered part of an oversized ACTION message.
    ActionSec,
    DelayTest,
    DelayResponse,
    Other(u16),
}

impl From<u16> for MsgType {
    fn from(v: u16) -> Self {
        match v {
            0 => Self::ReqCid,
            1 => Self::Cid,
            2 => Self::Stat,
            3 => Self::SetGeofence,
            4 => Self::Action,
            5 => Self::Arrived,
            6 => Self::Done,
            7 => Self::ActionSec,
            101 => Self::DelayTest,
            102 => Self::DelayResponse,
            other => Self::Other(other),
        }
    }
}

impl From<MsgType> for u16 {
    fn from(t: MsgType) -> Self {
        match t {
            MsgType::ReqCid => 0,
            MsgType::Cid => 1,
            MsgType::Stat => 2,
            MsgType::SetGeofence => 3,
            MsgType::Action => 4,
            MsgType::Arrived => 5,
            MsgType::Done => 6,
            MsgType::ActionSec => 7,
            MsgType::DelayTest => 101,
            MsgType::DelayResponse => 102,
            MsgType::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "Header")]
    pub origin: Origin,
    #[serde(rename = "Type")]
    pub msg_type: MsgType,
    /// ACTION_SEC only: total number of sections
    #[serde(rename = "Subtask", default, skip_serializing_if = "Option::is_none")]
    pub subtask: Option<u32>,
    /// ACTION_SEC only: 0-based index of this section
    #[serde(rename = "Index", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl Header {
    pub fn new(origin: Origin, msg_type: MsgType) -> Self {
        Self { origin, msg_type, subtask: None, index: None }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A decoded MAVC message: the header plus everything after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct Message {
    pub header: Header,
    pub payload: Vec<Value>,
}

impl TryFrom<Vec<Value>> for Message {
    type Error = CodecError;

    fn try_from(mut items: Vec<Value>) -> Result<Self, Self::Error> {
        if items.is_empty() {
            return Err(CodecError::Envelope("empty array".into()));
        }
        let payload = items.split_off(1);
        let header = match items.pop() {
            Some(v) => serde_json::from_value::<Header>(v)?,
            None => return Err(CodecError::Envelope("missing header".into())),
        };
        Ok(Self { header, payload })
    }
}

impl From<Message> for Vec<Value> {
    fn from(msg: Message) -> Self {
        let mut items = Vec::with_capacity(msg.payload.len() + 1);
        items.push(serde_json::to_value(&msg.header).unwrap_or_default());
        items.extend(msg.payload);
        items
    }
}

impl Message {
    pub fn new(origin: Origin, msg_type: MsgType, body: Value) -> Self {
        Self { header: Header::new(origin, msg_type), payload: vec![body] }
    }

    pub fn monitor(msg_type: MsgType, body: Value) -> Self {
        Self::new(Origin::Monitor, msg_type, body)
    }

    pub fn drone(msg_type: MsgType, body: Value) -> Self {
        Self::new(Origin::Drone, msg_type, body)
    }

    /// ACTION message carrying `actions` after the header.
    pub fn action(actions: &[Action]) -> Self {
        let payload = actions
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or_default())
            .collect();
        Self { header: Header::new(Origin::Monitor, MsgType::Action), payload }
    }

    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    pub fn is_from_drone(&self) -> bool {
        self.header.origin == Origin::Drone
    }

    /// The single body object following the header, if any.
    pub fn body(&self) -> Option<&Value> {
        self.payload.first()
    }

    /// Deserialize the body into a typed record. `None` if absent or ill-typed.
    pub fn body_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.body().and_then(|b| serde_json::from_value(b.clone()).ok())
    }

    /// Actions of an ACTION / ACTION_SEC message.
    pub fn actions(&self) -> Result<Vec<Action>, CodecError> {
        self.payload
            .iter()
            .map(|v| serde_json::from_value(v.clone()).map_err(CodecError::from))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode one datagram / frame. Anything that is not a MAVC envelope is an error.
    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ── Action ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ActionType {
    ArmAndTakeoff,
    GoTo,
    GoBy,
    Land,
    /// Deprecated: only early task files use it.
    Wait,
    Other(u8),
}

impl From<u8> for ActionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::ArmAndTakeoff,
            1 => Self::GoTo,
            2 => Self::GoBy,
            3 => Self::Land,
            4 => Self::Wait,
            other => Self::Other(other),
        }
    }
}

impl From<ActionType> for u8 {
    fn from(t: ActionType) -> Self {
        match t {
            ActionType::ArmAndTakeoff => 0,
            ActionType::GoTo => 1,
            ActionType::GoBy => 2,
            ActionType::Land => 3,
            ActionType::Wait => 4,
            ActionType::Other(v) => v,
        }
    }
}

impl ActionType {
    /// Numeric parameters an action of this type must carry. `None` for unknown types.
    pub fn required_params(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::ArmAndTakeoff => Some(&["Alt"]),
            Self::GoTo => Some(&["Lat", "Lon", "Alt"]),
            Self::GoBy => Some(&["N", "E", "Alt"]),
            Self::Land => Some(&["Lat", "Lon"]),
            Self::Wait => Some(&["Time"]),
            Self::Other(_) => None,
        }
    }
}

/// One step of a task, addressed to a single drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "CID")]
    pub cid: Cid,
    #[serde(rename = "Action_type")]
    pub action_type: ActionType,
    /// Barrier flag: the drone reports ARRIVED after finishing this action
    #[serde(rename = "Sync", default)]
    pub sync: bool,
    #[serde(rename = "Step", default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    /// Type-specific numeric parameters (Alt, Lat, Lon, N, E, Time)
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Action {
    pub fn new(cid: Cid, action_type: ActionType, sync: bool) -> Self {
        Self { cid, action_type, sync, step: None, params: Map::new() }
    }

    pub fn with_param(mut self, key: &str, value: f64) -> Self {
        self.params.insert(key.to_string(), Value::from(value));
        self
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

/// Geographic point (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "Lat")]
    pub lat: f64,
    #[serde(rename = "Lon")]
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Home location announced in REQ_CID. Captured once per session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomePosition {
    #[serde(rename = "Lat")]
    pub lat: f64,
    #[serde(rename = "Lon")]
    pub lon: f64,
}

impl Default for HomePosition {
    fn default() -> Self {
        Self { lat: UNKNOWN_COORD, lon: UNKNOWN_COORD }
    }
}

impl From<HomePosition> for GeoPoint {
    fn from(h: HomePosition) -> Self {
        GeoPoint::new(h.lat, h.lon)
    }
}

/// Latest known state of one drone, as reported by STAT messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroneStatus {
    #[serde(rename = "CID")]
    pub cid: Cid,
    #[serde(rename = "Armed")]
    pub armed: bool,
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "Lat")]
    pub lat: f64,
    #[serde(rename = "Lon")]
    pub lon: f64,
    #[serde(rename = "Alt")]
    pub alt: f64,
    /// Keys a drone reported that the monitor has no field for
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DroneStatus {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            armed: false,
            mode: String::new(),
            lat: UNKNOWN_COORD,
            lon: UNKNOWN_COORD,
            alt: 0.0,
            extra: Map::new(),
        }
    }

    /// Shallow key overwrite from a STAT body. `CID` is never overwritten and
    /// values of the wrong JSON type are skipped. Returns false if `body` is not
    /// an object.
    pub fn merge(&mut self, body: &Value) -> bool {
        let Some(fields) = body.as_object() else {
            return false;
        };
        for (key, value) in fields {
            match key.as_str() {
                "CID" => {}
                "Armed" => {
                    if let Some(v) = value.as_bool() {
                        self.armed = v;
                    }
                }
                "Mode" => {
                    if let Some(v) = value.as_str() {
                        self.mode = v.to_string();
                    }
                }
                "Lat" => {
                    if let Some(v) = value.as_f64() {
                        self.lat = v;
                    }
                }
                "Lon" => {
                    if let Some(v) = value.as_f64() {
                        self.lon = v;
                    }
                }
                "Alt" => {
                    if let Some(v) = value.as_f64() {
                        self.alt = v;
                    }
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
        true
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CidAssignment {
    #[serde(rename = "CID")]
    pub cid: Cid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Arrived {
    #[serde(rename = "CID")]
    pub cid: Cid,
    #[serde(rename = "Step", default)]
    pub step: Option<u32>,
}

/// Circular geofence (radius in meters around a center point).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    #[serde(rename = "Radius")]
    pub radius: f64,
    #[serde(rename = "Lat")]
    pub lat: f64,
    #[serde(rename = "Lon")]
    pub lon: f64,
}
