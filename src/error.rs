//! Error types for steer-dns.

use thiserror::Error;

/// Fatal configuration problems, detected before the selection API goes
/// live. The binary exits non-zero on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A backend weight was zero or negative.
    #[error("backend '{name}' has invalid weight {weight}; weights must be >= 1")]
    InvalidWeight {
        /// Offending backend name.
        name: String,
        /// Configured weight value.
        weight: i64,
    },

    /// Two backends in one pool share an identity.
    #[error("duplicate backend '{name}' in pool '{pool}'")]
    DuplicateBackend {
        /// Duplicated backend name.
        name: String,
        /// Pool where the duplicate appeared.
        pool: String,
    },

    /// Policy name not one of the six built-ins.
    #[error("unknown policy '{0}' (expected roundrobin, leastOutstanding, firstAvailable, wrandom, whashed or chashed)")]
    UnknownPolicy(String),

    /// A pool was declared with no servers.
    #[error("pool '{0}' has no servers")]
    EmptyPool(String),

    /// No pool was declared at all.
    #[error("no pools configured")]
    NoPools,

    /// The configured default pool does not exist.
    #[error("default pool '{0}' is not declared")]
    UnknownDefaultPool(String),

    /// The zone name does not parse as a DNS name.
    #[error("invalid zone name '{zone}': {source}")]
    InvalidZone {
        /// Configured zone string.
        zone: String,
        /// Underlying parse error.
        source: hickory_proto::ProtoError,
    },
}

/// Errors that can occur while the server runs.
#[derive(Debug, Error)]
pub enum SteerError {
    /// IO error (sockets, files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// DNS protocol error.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Selection was asked for a pool that does not exist.
    #[error("no pool named '{0}'")]
    UnknownPool(String),

    /// Feedback was reported for a backend that is not registered.
    #[error("no backend with id {0}")]
    UnknownBackend(crate::backend::BackendId),
}
