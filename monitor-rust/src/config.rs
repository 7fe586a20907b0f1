//! Monitor configuration.
//!
//! Precedence (lowest first): built-in defaults, TOML file, environment
//! variables, command-line flags (applied by `main`).

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use mavc_types::{Cid, DEFAULT_BASE_PORT, DEFAULT_SECTION_SIZE};
use serde::{Deserialize, Serialize};

use crate::broadcast::is_contiguous_netmask;
use crate::error::{ClusterError, Result};

/// How subtask batches reach the drones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One UDP broadcast per subtask, fragmented into ACTION_SEC when oversized
    #[default]
    Broadcast,
    /// Written to every session's TCP command channel
    Stream,
}

/// What the barrier runner does when a subtask outlives `subtask_timeout_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    #[default]
    Warn,
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskValidation {
    /// Known action types, CIDs in range, required parameters present
    #[default]
    Strict,
    /// Anything that decodes into action records
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// IPv4 address of the interface facing the drones
    pub public_ip: Ipv4Addr,
    /// Netmask of that interface (broadcast address is derived from it)
    pub netmask: Ipv4Addr,
    /// Handshake / broadcast port; per-drone ports are base_port + CID
    pub base_port: u16,
    /// Socket.IO bridge port
    pub http_port: u16,
    /// ACTION messages above this many actions are split into ACTION_SEC
    pub section_size: usize,
    pub dispatch: DispatchMode,
    pub subtask_timeout_secs: Option<f64>,
    pub on_subtask_timeout: TimeoutPolicy,
    /// Opt-in: give up a handshake that sees no REQ_CID in this window
    pub handshake_timeout_secs: Option<f64>,
    /// A TCP write to one drone that takes longer than this drops its command channel
    pub write_timeout_secs: f64,
    /// Ignore traffic whose source IP differs from the handshake peer
    pub enforce_peer_address: bool,
    pub task_validation: TaskValidation,
    /// Collision watch threshold (meters)
    pub min_safe_distance_m: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            public_ip: Ipv4Addr::LOCALHOST,
            netmask: Ipv4Addr::new(255, 0, 0, 0),
            base_port: DEFAULT_BASE_PORT,
            http_port: 3001,
            section_size: DEFAULT_SECTION_SIZE,
            dispatch: DispatchMode::default(),
            subtask_timeout_secs: None,
            on_subtask_timeout: TimeoutPolicy::default(),
            handshake_timeout_secs: None,
            write_timeout_secs: 5.0,
            enforce_peer_address: true,
            task_validation: TaskValidation::default(),
            min_safe_distance_m: 3.0,
        }
    }
}

fn env_addr(key: &str) -> Result<Option<Ipv4Addr>> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ClusterError::Config(format!("{key}={v} is not an IPv4 address"))),
        Err(_) => Ok(None),
    }
}

impl MonitorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ClusterError::Config(e.to_string()))
    }

    /// Defaults, overlaid by the TOML file (if any) and then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    ClusterError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(ip) = env_addr("MAVC_PUBLIC_IP")? {
            self.public_ip = ip;
        }
        if let Some(mask) = env_addr("MAVC_NETMASK")? {
            self.netmask = mask;
        }
        if let Some(port) = std::env::var("MAVC_BASE_PORT").ok().and_then(|v| v.parse().ok()) {
            self.base_port = port;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            self.http_port = port;
        }
        Ok(())
    }

    /// Reject settings no session could work with. Called before any socket is bound.
    pub fn validate(&self) -> Result<()> {
        if self.public_ip.is_unspecified() {
            return Err(ClusterError::Config("public_ip must name a concrete interface".into()));
        }
        if !is_contiguous_netmask(self.netmask) {
            return Err(ClusterError::Config(format!("netmask {} is not contiguous", self.netmask)));
        }
        if self.section_size == 0 {
            return Err(ClusterError::Config("section_size must be at least 1".into()));
        }
        for (name, secs) in [
            ("subtask_timeout_secs", self.subtask_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("write_timeout_secs", Some(self.write_timeout_secs)),
        ] {
            if let Some(s) = secs {
                if !(s.is_finite() && s > 0.0) {
                    return Err(ClusterError::Config(format!("{name} must be positive")));
                }
            }
        }
        Ok(())
    }

    /// Port used by drone `cid` for telemetry and the TCP command channel.
    pub fn drone_port(&self, cid: Cid) -> Result<u16> {
        u16::try_from(self.base_port as u32 + cid)
            .map_err(|_| ClusterError::Config(format!("no port left for CID {cid}")))
    }

    pub fn subtask_timeout(&self) -> Option<Duration> {
        self.subtask_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.write_timeout_secs)
    }
}
