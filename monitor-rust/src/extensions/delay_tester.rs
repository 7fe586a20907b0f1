//! Broadcast delay tester.
//!
//! Broadcasts DELAY_TEST carrying the monitor's clock and collects one
//! DELAY_RESPONSE per drone. Each drone stamps `Get_time` when the request
//! reached it, so the spread of those stamps is how far apart the drones
//! received the same broadcast. Clocks must be NTP-synchronised for the
//! numbers to mean anything.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use mavc_types::{Cid, Message, MsgType};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::info;

use crate::cluster::ClusterCoordinator;
use crate::error::{ClusterError, Result};
use crate::events::ClusterEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayReport {
    pub send_time: i64,
    /// `Get_time` per responding drone (ms, floored)
    pub responses: BTreeMap<Cid, i64>,
    pub missing: Vec<Cid>,
    /// `max(Get_time) - min(Get_time)` over the responses
    pub spread_ms: Option<i64>,
}

pub fn spread(responses: &BTreeMap<Cid, i64>) -> Option<i64> {
    let min = responses.values().min()?;
    let max = responses.values().max()?;
    Some(max - min)
}

pub async fn run_delay_test(cluster: &ClusterCoordinator, wait: Duration) -> Result<DelayReport> {
    let drones = cluster.get_drone_num().await;
    if drones == 0 {
        return Err(ClusterError::EmptyCluster);
    }
    let mut events = cluster.subscribe();
    let send_time = Utc::now().timestamp_millis();
    cluster
        .broadcast_msg(&Message::monitor(MsgType::DelayTest, json!({ "Send_time": send_time })))
        .await?;

    let deadline = Instant::now() + wait;
    let mut responses = BTreeMap::new();
    while responses.len() < drones {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(e)) => e,
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        };
        let ClusterEvent::MessageIn { cid, message } = event else { continue };
        if message.msg_type() != MsgType::DelayResponse {
            continue;
        }
        if let Some(get_time) = message.body().and_then(|b| b["Get_time"].as_f64()) {
            responses.insert(cid, get_time.floor() as i64);
        }
    }

    let missing = (1..=drones as Cid).filter(|c| !responses.contains_key(c)).collect();
    let report = DelayReport { send_time, spread_ms: spread(&responses), responses, missing };
    match report.spread_ms {
        Some(ms) => info!("Delay test: max spread of Get_time is {ms} ms ({} responses)", report.responses.len()),
        None => info!("Delay test: no responses within {wait:?}"),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::map::HeadlessMap;
    use crate::session::DroneKind;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    #[test]
    fn spread_is_max_minus_min() {
        let responses = BTreeMap::from([(1, 1_000), (2, 1_012), (3, 1_004)]);
        assert_eq!(spread(&responses), Some(12));
        assert_eq!(spread(&BTreeMap::new()), None);
    }

    #[tokio::test]
    async fn empty_cluster_is_rejected() {
        let coord = ClusterCoordinator::new(
            MonitorConfig { base_port: 47500, ..Default::default() },
            Arc::new(HeadlessMap::new()),
        )
        .unwrap();
        assert!(matches!(run_delay_test(&coord, Duration::from_millis(10)).await, Err(ClusterError::EmptyCluster)));
    }

    #[tokio::test]
    async fn collects_responses_from_drones() {
        // A /32 netmask turns the subnet broadcast into a loopback unicast.
        let config = MonitorConfig {
            base_port: 47510,
            netmask: Ipv4Addr::new(255, 255, 255, 255),
            ..Default::default()
        };
        let coord = ClusterCoordinator::new(config, Arc::new(HeadlessMap::new())).unwrap();
        coord.add_drone(DroneKind::Simulated).await.unwrap();

        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let req = Message::drone(MsgType::ReqCid, json!({ "Lat": 31.0, "Lon": 118.0 }));
        drone.send_to(&req.to_bytes().unwrap(), "127.0.0.1:47511").await.unwrap();
        let mut buf = vec![0u8; 2048];
        drone.recv_from(&mut buf).await.unwrap();

        let listener = UdpSocket::bind("127.0.0.1:47510").await.unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, _) = listener.recv_from(&mut buf).await.unwrap();
            let request = Message::from_slice(&buf[..len]).unwrap();
            assert_eq!(request.msg_type(), MsgType::DelayTest);
            let resp = Message::drone(MsgType::DelayResponse, json!({ "CID": 1, "Get_time": 1234.7 }));
            drone.send_to(&resp.to_bytes().unwrap(), "127.0.0.1:47511").await.unwrap();
        });

        let report = run_delay_test(&coord, Duration::from_secs(2)).await.unwrap();
        responder.await.unwrap();
        assert_eq!(report.responses.get(&1), Some(&1234));
        assert_eq!(report.spread_ms, Some(0));
        assert!(report.missing.is_empty());
    }
}
