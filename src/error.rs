//! Registry errors
//!
//! Every error carries the name of the registry operation that produced it.

use crate::model::ServiceIdentity;

/// Errors from registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("[{op}] transport error: {reason}")]
    Transport { op: &'static str, reason: String },

    #[error("[{op}] registry responded {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("[{op}] invalid response body: {reason}")]
    Decode { op: &'static str, reason: String },

    #[error("[{op}] invalid registry address: {reason}")]
    InvalidAddress { op: &'static str, reason: String },

    #[error("[{op}] registration rejected: {source}")]
    Registration {
        op: &'static str,
        #[source]
        source: Box<RegistryError>,
    },

    #[error("[{op}] heartbeat rejected: {source}")]
    Heartbeat {
        op: &'static str,
        #[source]
        source: Box<RegistryError>,
    },

    #[error("[{op}] no instances found for {service}")]
    DiscoveryEmpty {
        op: &'static str,
        service: ServiceIdentity,
    },

    #[error("[{op}] provider endpoints is empty for {service}")]
    EndpointsEmpty {
        op: &'static str,
        service: ServiceIdentity,
    },

    #[error("[{op}] watch terminated: {reason}")]
    WatchTerminated { op: &'static str, reason: String },
}

impl RegistryError {
    /// Operation that produced this error
    pub fn op(&self) -> &'static str {
        match self {
            RegistryError::Transport { op, .. }
            | RegistryError::Status { op, .. }
            | RegistryError::Decode { op, .. }
            | RegistryError::InvalidAddress { op, .. }
            | RegistryError::Registration { op, .. }
            | RegistryError::Heartbeat { op, .. }
            | RegistryError::DiscoveryEmpty { op, .. }
            | RegistryError::EndpointsEmpty { op, .. }
            | RegistryError::WatchTerminated { op, .. } => *op,
        }
    }

    /// Non-2xx/3xx response or undecodable body
    pub fn is_protocol(&self) -> bool {
        matches!(self, RegistryError::Status { .. } | RegistryError::Decode { .. })
    }

    pub(crate) fn registration(op: &'static str, source: RegistryError) -> Self {
        RegistryError::Registration {
            op,
            source: Box::new(source),
        }
    }

    pub(crate) fn heartbeat(op: &'static str, source: RegistryError) -> Self {
        RegistryError::Heartbeat {
            op,
            source: Box::new(source),
        }
    }
}

/// Errors bringing a registering process up
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("missing required section: {0}")]
    Missing(&'static str),

    #[error("instance listen address is empty")]
    EmptyListenAddress,

    #[error("instance listen address {address} is wrong: {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("instance listen port {port} is wrong")]
    InvalidPort { port: String },

    #[error("heartbeat interval must be at least one second")]
    ZeroHeartbeatInterval,
}
