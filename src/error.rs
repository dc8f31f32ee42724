/// Error types for quartz-kv operations.
///
/// Every failure mode the protocol can surface has its own variant, so
/// callers (and the HTTP layer) can pattern-match instead of parsing
/// message strings.
use thiserror::Error;

/// The main error type for quartz-kv operations.
///
/// All fallible operations return `Result<T, KvError>`, aliased below as
/// `KvResult<T>`.
#[derive(Error, Debug)]
pub enum KvError {
    /// Missing or invalid request arguments.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Key absent on read.
    #[error("Key '{key}' not found")]
    KeyNotFound {
        /// The key that was not found
        key: String,
    },

    /// Disk read/write/sync failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error when converting data to/from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A follower received a client operation but knows no leader.
    #[error("No primary available")]
    NoPrimary,

    /// A quorum write or read saw fewer acknowledgements than required.
    #[error("Quorum not met: {acks} of {required} required responses")]
    QuorumUnmet {
        /// Responses actually received (including self)
        acks: usize,
        /// Responses the quorum rule requires
        required: usize,
    },

    /// An outbound peer call failed or timed out.
    ///
    /// Best-effort paths consume this locally; quorum paths fold it into
    /// the ack count instead of surfacing it.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Any unexpected condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for quartz-kv operations.
pub type KvResult<T> = Result<T, KvError>;
