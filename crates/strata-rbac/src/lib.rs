//! # strata-rbac: per-database access control
//!
//! Every operation against a hosted database is decided by one function of
//! the caller's [`PermStat`](strata_types::PermStat) on that database:
//!
//! | Operation | Needs      | Status   |
//! |-----------|------------|----------|
//! | Read      | ≥ `Read`   | `Normal` |
//! | Write     | ≥ `Write`  | `Normal` |
//! | Admin     | `Admin`    | `Normal` |
//!
//! A user without an entry is treated as `Void` and rejected. Any status
//! other than `Normal` rejects regardless of the permission level.
//!
//! ```
//! use std::sync::Arc;
//! use strata_rbac::{Operation, PermissionTable, QueryGate};
//! use strata_types::{AccountAddress, DatabaseId, PermStat, Permission, UserStatus};
//!
//! let table = Arc::new(PermissionTable::new());
//! let db = DatabaseId::new("db1");
//! let user = AccountAddress::default();
//! table.update(&db, user, PermStat::new(Permission::Read, UserStatus::Normal)).unwrap();
//!
//! let gate = QueryGate::new(table);
//! assert!(gate.authorize(&db, &user, Operation::Read).is_ok());
//! assert!(gate.authorize(&db, &user, Operation::Write).is_err());
//! ```

mod gate;
mod table;

pub use gate::{Denial, GateError, Operation, QueryGate, Result, decide};
pub use table::PermissionTable;
