//! DBMS service error types.

use strata_crypto::CryptoError;
use strata_rbac::GateError;
use strata_shard::DriverError;
use strata_types::DatabaseId;
use thiserror::Error;

/// Result type for DBMS operations.
pub type DbmsResult<T> = Result<T, DbmsError>;

/// Errors returned by the DBMS service.
#[derive(Debug, Error)]
pub enum DbmsError {
    /// The caller lacks the permission or status for the operation.
    #[error("permission denied")]
    PermissionDeny,

    /// No database with this ID is deployed on this node.
    #[error("database not found: {0}")]
    NotFound(DatabaseId),

    #[error("database already deployed: {0}")]
    AlreadyDeployed(DatabaseId),

    /// Request timestamp too far from the node clock.
    #[error("stale request: {skew_ms}ms from node time")]
    StaleRequest { skew_ms: u128 },

    /// Sequence number not above the last one seen on the connection.
    #[error("replayed request: seq {seq_no} on connection {connection_id} (last {last})")]
    ReplayedRequest {
        connection_id: u64,
        seq_no: u64,
        last: u64,
    },

    /// Signed before the database was reopened, when its sequence number
    /// can no longer be checked.
    #[error("request seq {seq_no} on connection {connection_id} was signed before the database reopened")]
    SignedBeforeRestart { connection_id: u64, seq_no: u64 },

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] CryptoError),

    /// An ack names a response this node is not waiting on.
    #[error("unknown response for database {database_id} at offset {log_offset}")]
    UnknownResponse {
        database_id: DatabaseId,
        log_offset: u64,
    },

    /// Deployment data is inconsistent.
    #[error("invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("execution failed: {0}")]
    Execution(#[from] DriverError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] strata_config::ConfigError),

    #[error("service is shut down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbmsError {
    pub(crate) fn lock_poisoned(what: &str) -> Self {
        Self::Internal(format!("{what} lock poisoned"))
    }
}

impl From<GateError> for DbmsError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::PermissionDeny => Self::PermissionDeny,
            GateError::LockPoisoned => Self::lock_poisoned("permission table"),
        }
    }
}
