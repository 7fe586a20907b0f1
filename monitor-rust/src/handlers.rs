use std::sync::Arc;
use std::time::Duration;

use mavcluster_monitor::error::Result;
use mavcluster_monitor::extensions::run_delay_test;
use mavcluster_monitor::{ClusterCoordinator, DroneKind, Message};
use mavc_types::Cid;
use serde::Serialize;
use serde_json::{json, Value};
use socketioxide::extract::{Data, SocketRef};
use tracing::{info, warn};

// ─── Shared State Types ───────────────────────────────────────────────────────

pub type SharedCluster = Arc<ClusterCoordinator>;

const DEFAULT_DELAY_WAIT_MS: u64 = 3_000;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Answer `command` on the calling socket with `<command>-result` or `error-message`.
fn reply<T: Serialize>(s: &SocketRef, command: &str, result: Result<T>) {
    match result {
        Ok(v) => {
            let _ = s.emit(format!("{command}-result"), &v);
        }
        Err(e) => {
            warn!("Client {}: {command} failed: {e}", s.id);
            let _ = s.emit("error-message", &json!({ "command": command, "error": e.to_string() }));
        }
    }
}

/// CID from either a bare number or `{ "CID": n }` / `{ "cid": n }`.
fn cid_of(data: &Value) -> Option<Cid> {
    data.as_u64()
        .or_else(|| data["CID"].as_u64())
        .or_else(|| data["cid"].as_u64())
        .and_then(|v| Cid::try_from(v).ok())
}

/// Task JSON from a string, `{ "task": ... }`, or an inline action array.
fn task_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(o) => match o.get("task") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => data.to_string(),
        },
        other => other.to_string(),
    }
}

fn bad_request(what: &str) -> mavcluster_monitor::ClusterError {
    mavcluster_monitor::ClusterError::InvalidArgument(what.to_string())
}

// ─── Socket Handler ──────────────────────────────────────────────────────────

pub async fn on_connect(socket: SocketRef, cluster: SharedCluster) {
    info!("Client connected: {}", socket.id);

    socket.on_disconnect(|s: SocketRef| async move {
        info!("Client disconnected: {}", s.id);
    });

    let _ = socket.emit(
        "init-state",
        &json!({
            "connection": cluster.get_connection_info(),
            "droneNum": cluster.get_drone_num().await,
        }),
    );

    // ── add-drone ─────────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("add-drone", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let kind = match data["kind"].as_str() {
                    Some("simulated") | Some("sitl") => DroneKind::Simulated,
                    _ => DroneKind::Real,
                };
                reply(&s, "add-drone", cluster.add_drone(kind).await.map(|cid| json!({ "CID": cid })));
            }
        });
    }

    // ── add-simulators ────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("add-simulators", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let count = data.as_u64().or_else(|| data["count"].as_u64()).unwrap_or(1) as usize;
                reply(&s, "add-simulators", cluster.add_simulators(count).await);
            }
        });
    }

    // ── execute-task ──────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("execute-task", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let raw = task_text(&data);
                let result = cluster.execute_task(&raw).await.map(|n| json!({ "subtasks": n }));
                reply(&s, "execute-task", result);
            }
        });
    }

    // ── cancel-task ───────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("cancel-task", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                let cancelled = cluster.cancel_task().await;
                info!("Client {}: cancel-task ({})", s.id, if cancelled { "stopped" } else { "no task" });
                reply(&s, "cancel-task", Ok(json!({ "cancelled": cancelled })));
            }
        });
    }

    // ── set-geofence ──────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("set-geofence", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let result = match (data["radius"].as_f64(), data["lat"].as_f64(), data["lon"].as_f64()) {
                    (Some(r), Some(lat), Some(lon)) => cluster.set_geofence(r, lat, lon).await,
                    _ => Err(bad_request("set-geofence needs radius, lat and lon")),
                };
                reply(&s, "set-geofence", result);
            }
        });
    }

    // ── clear-trace ───────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("clear-trace", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                cluster.clear_trace().await;
                reply(&s, "clear-trace", Ok(json!({})));
            }
        });
    }

    // ── queries ───────────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("get-connection-info", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                reply(&s, "get-connection-info", Ok(cluster.get_connection_info()));
            }
        });
    }
    {
        let cluster = cluster.clone();
        socket.on("get-distances", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                reply(&s, "get-distances", Ok(cluster.get_distances().await));
            }
        });
    }
    {
        let cluster = cluster.clone();
        socket.on("get-task-times", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                reply(&s, "get-task-times", Ok(cluster.get_task_times().await));
            }
        });
    }
    {
        let cluster = cluster.clone();
        socket.on("get-drone", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let result = match cid_of(&data) {
                    Some(cid) => cluster.get_drone(cid).await,
                    None => Err(bad_request("get-drone needs a CID")),
                };
                reply(&s, "get-drone", result);
            }
        });
    }
    {
        let cluster = cluster.clone();
        socket.on("get-drone-num", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                reply(&s, "get-drone-num", Ok(cluster.get_drone_num().await));
            }
        });
    }

    // ── broadcast-msg / send-msg ──────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("broadcast-msg", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let result = match serde_json::from_value::<Message>(data) {
                    Ok(msg) => cluster.broadcast_msg(&msg).await.map(|n| json!({ "datagrams": n })),
                    Err(e) => Err(bad_request(&e.to_string())),
                };
                reply(&s, "broadcast-msg", result);
            }
        });
    }
    {
        let cluster = cluster.clone();
        socket.on("send-msg", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let msg = serde_json::from_value::<Message>(data["msg"].clone());
                let result = match (cid_of(&data), msg) {
                    (Some(cid), Ok(msg)) => cluster.send_msg(cid, &msg).await.map(|_| json!({ "CID": cid })),
                    (None, _) => Err(bad_request("send-msg needs a CID")),
                    (_, Err(e)) => Err(bad_request(&e.to_string())),
                };
                reply(&s, "send-msg", result);
            }
        });
    }

    // ── delay-test ────────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("delay-test", move |s: SocketRef, Data::<Value>(data)| {
            let cluster = cluster.clone();
            async move {
                let wait = Duration::from_millis(data["waitMs"].as_u64().unwrap_or(DEFAULT_DELAY_WAIT_MS));
                reply(&s, "delay-test", run_delay_test(&cluster, wait).await);
            }
        });
    }

    // ── finish ────────────────────────────────────────────────────────────────
    {
        let cluster = cluster.clone();
        socket.on("finish", move |s: SocketRef, Data::<Value>(_data)| {
            let cluster = cluster.clone();
            async move {
                info!("Client {}: finishing all drones", s.id);
                cluster.finish_all().await;
                reply(&s, "finish", Ok(json!({})));
            }
        });
    }
}
