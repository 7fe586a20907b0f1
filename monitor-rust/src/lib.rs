//! # mavcluster-monitor
//!
//! Ground-side core of a MAVC drone cluster: CID allocation, per-drone
//! sessions, task decomposition with barrier synchronisation, and subnet
//! broadcast with ACTION_SEC fragmentation.
//!
//! The map/UI layer is reached only through [`map::MapDisplay`]; everything
//! here runs headless. The `mavc-monitor` binary wires the coordinator to a
//! Socket.IO bridge.

pub mod accounting;
pub mod barrier;
pub mod broadcast;
pub mod cid;
pub mod cluster;
pub mod config;
pub mod decompose;
pub mod error;
pub mod events;
pub mod extensions;
pub mod map;
pub mod session;

pub use cluster::{ClusterCoordinator, ConnectionInfo, TaskProgress};
pub use config::{DispatchMode, MonitorConfig, TaskValidation, TimeoutPolicy};
pub use error::ClusterError;
pub use events::ClusterEvent;
pub use map::{HeadlessMap, MapDisplay};
pub use mavc_types::{Cid, Message, MsgType};
pub use session::{DroneKind, DroneSession, DroneSnapshot, SessionPhase};
