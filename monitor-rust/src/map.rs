//! Map display collaborator.
//!
//! The monitor never draws anything itself. Sessions call into a `MapDisplay`
//! to place a marker and a trace for a new drone, move the marker, redraw the
//! trace, and measure how far a drone moved. The desktop UI supplies its own
//! implementation; `HeadlessMap` keeps everything in memory.

use std::collections::HashMap;
use std::sync::Mutex;

use mavc_types::geo::planar_distance_m;
use mavc_types::{Cid, GeoPoint, HomePosition};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MarkerHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TraceHandle(pub u32);

/// Opaque handles returned by `preload_display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayHandles {
    pub marker: MarkerHandle,
    pub trace: TraceHandle,
}

pub trait MapDisplay: Send + Sync {
    /// Prepare a marker and an empty trace for a drone that just joined.
    fn preload_display(&self, cid: Cid, home: HomePosition) -> DisplayHandles;

    /// Move a marker; returns the position as projected for display.
    fn set_position(&self, marker: MarkerHandle, pos: GeoPoint) -> GeoPoint;

    fn set_path(&self, trace: TraceHandle, points: &[GeoPoint]);

    /// Distance between two points in meters.
    fn cal_distance(&self, a: GeoPoint, b: GeoPoint) -> f64;
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_handle: u32,
    markers: HashMap<MarkerHandle, Option<GeoPoint>>,
    traces: HashMap<TraceHandle, Vec<GeoPoint>>,
}

/// In-memory display used when no UI is attached.
#[derive(Debug, Default)]
pub struct HeadlessMap {
    state: Mutex<HeadlessState>,
}

impl HeadlessMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HeadlessState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn marker_position(&self, marker: MarkerHandle) -> Option<GeoPoint> {
        self.with_state(|s| s.markers.get(&marker).copied().flatten())
    }

    pub fn path(&self, trace: TraceHandle) -> Vec<GeoPoint> {
        self.with_state(|s| s.traces.get(&trace).cloned().unwrap_or_default())
    }
}

impl MapDisplay for HeadlessMap {
    fn preload_display(&self, cid: Cid, home: HomePosition) -> DisplayHandles {
        self.with_state(|s| {
            let marker = MarkerHandle(s.next_handle);
            let trace = TraceHandle(s.next_handle + 1);
            s.next_handle += 2;
            let home = GeoPoint::from(home);
            s.markers.insert(marker, home.is_valid().then_some(home));
            s.traces.insert(trace, Vec::new());
            debug!("Map: drone-{cid} preloaded at {:.7},{:.7}", home.lat, home.lon);
            DisplayHandles { marker, trace }
        })
    }

    fn set_position(&self, marker: MarkerHandle, pos: GeoPoint) -> GeoPoint {
        self.with_state(|s| {
            s.markers.insert(marker, Some(pos));
        });
        pos
    }

    fn set_path(&self, trace: TraceHandle, points: &[GeoPoint]) {
        self.with_state(|s| {
            s.traces.insert(trace, points.to_vec());
        });
    }

    fn cal_distance(&self, a: GeoPoint, b: GeoPoint) -> f64 {
        planar_distance_m(a, b)
    }
}
