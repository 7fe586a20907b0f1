use std::net::SocketAddr;

use mavc_types::{Cid, CodecError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {kind} socket on {addr}: {source}")]
    Bind {
        kind: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no drone with CID {0}")]
    UnknownDrone(Cid),

    #[error("drone {0} has no TCP connection yet")]
    NotConnected(Cid),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a task is already running")]
    TaskInProgress,

    #[error("the cluster has no drones")]
    EmptyCluster,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
