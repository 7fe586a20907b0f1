//! Per-drone flight accounting: trace, flown distance, task start/end times.

use chrono::{DateTime, Utc};
use mavc_types::GeoPoint;
use serde::Serialize;

use crate::map::MapDisplay;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTimes {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct FlightLog {
    trace: Vec<GeoPoint>,
    distance_m: f64,
    task_start: Option<DateTime<Utc>>,
    task_end: Option<DateTime<Utc>>,
}

impl FlightLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one STAT update. Armed positions extend the trace and add the leg
    /// from the previous point to the distance. Returns true if the trace grew.
    pub fn record(&mut self, armed: bool, pos: GeoPoint, map: &dyn MapDisplay) -> bool {
        self.record_at(armed, pos, map, Utc::now())
    }

    fn record_at(&mut self, armed: bool, pos: GeoPoint, map: &dyn MapDisplay, now: DateTime<Utc>) -> bool {
        if !armed {
            if self.task_start.is_some() && self.task_end.is_none() {
                self.task_end = Some(now);
            }
            return false;
        }
        if self.task_start.is_none() {
            self.task_start = Some(now);
        }
        if !pos.is_valid() {
            return false;
        }
        if let Some(&last) = self.trace.last() {
            self.distance_m += map.cal_distance(last, pos);
        }
        self.trace.push(pos);
        true
    }

    /// Reset for a new task. Returns true if a drawn path (two or more points)
    /// needs clearing on the map.
    pub fn clear(&mut self) -> bool {
        let had_path = self.trace.len() > 1;
        self.trace.clear();
        self.distance_m = 0.0;
        self.task_start = None;
        self.task_end = None;
        had_path
    }

    pub fn trace(&self) -> &[GeoPoint] {
        &self.trace
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn times(&self) -> TaskTimes {
        let duration_secs = match (self.task_start, self.task_end) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        TaskTimes { start: self.task_start, end: self.task_end, duration_secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{DisplayHandles, MarkerHandle, TraceHandle};
    use chrono::Duration;
    use mavc_types::{Cid, HomePosition};

    /// Distance in raw coordinate units.
    struct UnitMap;

    impl MapDisplay for UnitMap {
        fn preload_display(&self, _cid: Cid, _home: HomePosition) -> DisplayHandles {
            DisplayHandles { marker: MarkerHandle(0), trace: TraceHandle(1) }
        }
        fn set_position(&self, _marker: MarkerHandle, pos: GeoPoint) -> GeoPoint {
            pos
        }
        fn set_path(&self, _trace: TraceHandle, _points: &[GeoPoint]) {}
        fn cal_distance(&self, a: GeoPoint, b: GeoPoint) -> f64 {
            ((a.lat - b.lat).powi(2) + (a.lon - b.lon).powi(2)).sqrt()
        }
    }

    #[test]
    fn distance_is_accumulated_leg_by_leg() {
        let mut log = FlightLog::new();
        log.record(true, GeoPoint::new(0.0, 0.0), &UnitMap);
        log.record(true, GeoPoint::new(3.0, 0.0), &UnitMap);
        log.record(true, GeoPoint::new(3.0, 4.0), &UnitMap);
        assert!((log.distance_m() - 7.0).abs() < 1e-9);
        assert_eq!(log.trace().len(), 3);
    }

    #[test]
    fn disarmed_updates_do_not_move_the_trace() {
        let mut log = FlightLog::new();
        assert!(!log.record(false, GeoPoint::new(1.0, 1.0), &UnitMap));
        assert!(log.trace().is_empty());
        assert_eq!(log.times().start, None);
    }

    #[test]
    fn start_and_end_follow_armed_transitions() {
        let t0 = Utc::now();
        let mut log = FlightLog::new();
        log.record_at(true, GeoPoint::new(0.0, 0.0), &UnitMap, t0);
        log.record_at(true, GeoPoint::new(0.0, 1.0), &UnitMap, t0 + Duration::seconds(5));
        log.record_at(false, GeoPoint::new(0.0, 1.0), &UnitMap, t0 + Duration::seconds(10));
        log.record_at(false, GeoPoint::new(0.0, 1.0), &UnitMap, t0 + Duration::seconds(20));

        let times = log.times();
        assert_eq!(times.start, Some(t0));
        assert_eq!(times.end, Some(t0 + Duration::seconds(10)));
        assert_eq!(times.duration_secs, Some(10.0));
    }

    #[test]
    fn clear_resets_everything() {
        let mut log = FlightLog::new();
        log.record(true, GeoPoint::new(0.0, 0.0), &UnitMap);
        log.record(true, GeoPoint::new(0.0, 2.0), &UnitMap);
        assert!(log.clear());
        assert_eq!(log.distance_m(), 0.0);
        assert!(log.trace().is_empty());
        assert_eq!(log.times().start, None);

        log.record(true, GeoPoint::new(0.0, 0.0), &UnitMap);
        assert!(!log.clear());
    }
}
