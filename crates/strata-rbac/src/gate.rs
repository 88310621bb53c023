//! Query authorization gate.

use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_types::{AccountAddress, DatabaseId, PermStat, Permission, QueryType, UserStatus};
use thiserror::Error;
use tracing::warn;

use crate::table::PermissionTable;

/// Error type for authorization.
///
/// The caller never learns why a request was denied; the reason is logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("permission denied")]
    PermissionDeny,

    #[error("permission table lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, GateError>;

/// Operation classes checked by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
    /// Permission changes and transaction subscriptions.
    Admin,
}

impl Operation {
    /// Lowest permission level allowed to perform the operation.
    pub fn required(self) -> Permission {
        match self {
            Operation::Read => Permission::Read,
            Operation::Write => Permission::Write,
            Operation::Admin => Permission::Admin,
        }
    }
}

impl From<QueryType> for Operation {
    fn from(query_type: QueryType) -> Self {
        match query_type {
            QueryType::Read => Operation::Read,
            QueryType::Write => Operation::Write,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => f.write_str("read"),
            Operation::Write => f.write_str("write"),
            Operation::Admin => f.write_str("admin"),
        }
    }
}

/// Why an operation was rejected. Logged, never returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    NoEntry,
    InsufficientPermission {
        held: Permission,
        required: Permission,
    },
    Status(UserStatus),
}

impl Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::NoEntry => f.write_str("no permission entry"),
            Denial::InsufficientPermission { held, required } => {
                write!(f, "holds {held}, needs {required}")
            }
            Denial::Status(status) => write!(f, "account status is {status}"),
        }
    }
}

/// The decision table.
///
/// # Examples
///
/// ```
/// use strata_rbac::{Denial, Operation, decide};
/// use strata_types::{PermStat, Permission, UserStatus};
///
/// let arrears = PermStat::new(Permission::Admin, UserStatus::Arrears);
/// assert_eq!(decide(Some(arrears), Operation::Read), Err(Denial::Status(UserStatus::Arrears)));
/// assert_eq!(decide(None, Operation::Read), Err(Denial::NoEntry));
/// ```
pub fn decide(perm: Option<PermStat>, op: Operation) -> std::result::Result<(), Denial> {
    let Some(perm) = perm else {
        return Err(Denial::NoEntry);
    };
    let required = op.required();
    if !perm.permission.allows(required) {
        return Err(Denial::InsufficientPermission {
            held: perm.permission,
            required,
        });
    }
    if !perm.status.is_normal() {
        return Err(Denial::Status(perm.status));
    }
    Ok(())
}

/// Single decision point for every gated operation.
#[derive(Debug, Clone)]
pub struct QueryGate {
    table: Arc<PermissionTable>,
}

impl QueryGate {
    pub fn new(table: Arc<PermissionTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<PermissionTable> {
        &self.table
    }

    /// Accepts or rejects `op` by `user` on `db`. Returns the PermStat the
    /// decision was made on.
    pub fn authorize(&self, db: &DatabaseId, user: &AccountAddress, op: Operation) -> Result<PermStat> {
        let perm = self.table.get(db, user)?;
        match decide(perm, op) {
            Ok(()) => Ok(perm.unwrap_or_default()),
            Err(denial) => {
                warn!(database = %db, user = %user, operation = %op, reason = %denial, "request denied");
                Err(GateError::PermissionDeny)
            }
        }
    }
}
