mod handlers;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::json;
use socketioxide::SocketIo;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use handlers::{on_connect, SharedCluster};
use mavcluster_monitor::extensions::spawn_collision_watch;
use mavcluster_monitor::{ClusterCoordinator, ClusterEvent, DispatchMode, HeadlessMap, MonitorConfig};

#[derive(Debug, Parser)]
#[command(name = "mavc-monitor", about = "MAVC drone cluster monitor")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address of the interface facing the drones
    #[arg(long)]
    public_ip: Option<Ipv4Addr>,
    #[arg(long)]
    netmask: Option<Ipv4Addr>,
    #[arg(long)]
    base_port: Option<u16>,
    /// Socket.IO bridge port
    #[arg(long)]
    http_port: Option<u16>,
    /// Deliver subtasks over each drone's TCP channel instead of broadcasting
    #[arg(long)]
    stream: bool,
    /// Per-subtask barrier timeout in seconds
    #[arg(long)]
    subtask_timeout: Option<f64>,
}

impl Args {
    fn apply(&self, config: &mut MonitorConfig) {
        if let Some(ip) = self.public_ip {
            config.public_ip = ip;
        }
        if let Some(mask) = self.netmask {
            config.netmask = mask;
        }
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if self.stream {
            config.dispatch = DispatchMode::Stream;
        }
        if self.subtask_timeout.is_some() {
            config.subtask_timeout_secs = self.subtask_timeout;
        }
    }
}

// ─── Event Relay ──────────────────────────────────────────────────────────────

async fn relay_events(cluster: SharedCluster, io: SocketIo) {
    let mut events = cluster.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let _ = io.emit(event.name(), &event.payload());
                if let ClusterEvent::NewDroneAdd { .. } = event {
                    let _ = io.emit("drone-num", &cluster.get_drone_num().await);
                }
            }
            Err(RecvError::Lagged(n)) => warn!("Relay: dropped {n} events for UI clients"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mavcluster_monitor=info,mavc_monitor=info,socketioxide=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = MonitorConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);

    info!("MAVC cluster monitor starting...");

    let cluster: SharedCluster = ClusterCoordinator::new(config.clone(), Arc::new(HeadlessMap::new()))
        .context("invalid cluster configuration")?;

    // Build Socket.IO layer
    let (socket_layer, io) = SocketIo::builder().build_layer();

    let cluster_sock = cluster.clone();
    io.ns("/", move |socket: socketioxide::extract::SocketRef| {
        let cluster = cluster_sock.clone();
        async move {
            on_connect(socket, cluster).await;
        }
    });

    tokio::spawn(relay_events(cluster.clone(), io.clone()));
    {
        let io = io.clone();
        spawn_collision_watch(&cluster, move |w| {
            let _ = io.emit("collision-warning", &w);
        });
    }

    // CORS: the UI shell loads from file:// and localhost alike
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let info_cluster = cluster.clone();
    let app = Router::new()
        .route(
            "/info",
            get(move || {
                let cluster = info_cluster.clone();
                async move {
                    axum::Json(json!({
                        "connection": cluster.get_connection_info(),
                        "droneNum": cluster.get_drone_num().await,
                        "task": cluster.task_progress().await,
                    }))
                }
            }),
        )
        .layer(socket_layer)
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
