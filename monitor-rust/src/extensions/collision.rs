//! Collision watch: warns when two drones report positions closer than the
//! configured safe distance.

use std::collections::BTreeMap;
use std::sync::Arc;

use mavc_types::{Cid, GeoPoint, MsgType};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::ClusterCoordinator;
use crate::events::ClusterEvent;
use crate::map::MapDisplay;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollisionWarning {
    pub first: Cid,
    pub second: Cid,
    pub distance_m: f64,
}

#[derive(Debug)]
pub struct CollisionWatch {
    min_safe_m: f64,
    positions: BTreeMap<Cid, GeoPoint>,
}

impl CollisionWatch {
    pub fn new(min_safe_m: f64) -> Self {
        Self { min_safe_m, positions: BTreeMap::new() }
    }

    /// Record the position in a STAT body and check it against every other
    /// drone's last known position.
    pub fn observe(&mut self, cid: Cid, body: &Value, map: &dyn MapDisplay) -> Vec<CollisionWarning> {
        let (Some(lat), Some(lon)) = (body["Lat"].as_f64(), body["Lon"].as_f64()) else {
            return Vec::new();
        };
        let pos = GeoPoint::new(lat, lon);
        if !pos.is_valid() {
            return Vec::new();
        }
        self.positions.insert(cid, pos);

        self.positions
            .iter()
            .filter(|(other, _)| **other != cid)
            .filter_map(|(other, other_pos)| {
                let distance_m = map.cal_distance(pos, *other_pos);
                (distance_m < self.min_safe_m).then(|| CollisionWarning {
                    first: cid.min(*other),
                    second: cid.max(*other),
                    distance_m,
                })
            })
            .collect()
    }
}

/// Watch the event stream of `cluster`, calling `on_warning` for every pair
/// found too close.
pub fn spawn_collision_watch<F>(cluster: &ClusterCoordinator, on_warning: F) -> JoinHandle<()>
where
    F: Fn(CollisionWarning) + Send + Sync + 'static,
{
    let mut events = cluster.subscribe();
    let map: Arc<dyn MapDisplay> = cluster.map();
    let mut watch = CollisionWatch::new(cluster.config().min_safe_distance_m);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::MessageIn { cid, message }) if message.msg_type() == MsgType::Stat => {
                    let Some(body) = message.body() else { continue };
                    for w in watch.observe(cid, body, &*map) {
                        warn!(
                            "Collision: drone-{} and drone-{} only {:.2} m apart",
                            w.first, w.second, w.distance_m
                        );
                        on_warning(w);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!("Collision: skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
