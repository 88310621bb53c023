//! Permission table: PermStat per (database, user).

use std::collections::HashMap;
use std::sync::RwLock;

use strata_types::{AccountAddress, DatabaseId, PermStat};
use tracing::debug;

use crate::gate::{GateError, Result};

/// In-memory permission matrix shared by the gate and the admin API.
///
/// Reads copy the small `PermStat` out so no lock is held across query
/// execution.
#[derive(Debug, Default)]
pub struct PermissionTable {
    entries: RwLock<HashMap<DatabaseId, HashMap<AccountAddress, PermStat>>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the PermStat of `user` on `db`, replacing any previous value.
    pub fn update(&self, db: &DatabaseId, user: AccountAddress, perm: PermStat) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| GateError::LockPoisoned)?;
        let previous = entries.entry(db.clone()).or_default().insert(user, perm);
        debug!(
            database = %db,
            user = %user,
            permission = %perm.permission,
            status = %perm.status,
            replaced = previous.is_some(),
            "permission updated"
        );
        Ok(())
    }

    pub fn get(&self, db: &DatabaseId, user: &AccountAddress) -> Result<Option<PermStat>> {
        let entries = self.entries.read().map_err(|_| GateError::LockPoisoned)?;
        Ok(entries.get(db).and_then(|users| users.get(user)).copied())
    }

    /// Every entry of `db`, ordered by address.
    pub fn snapshot(&self, db: &DatabaseId) -> Result<Vec<(AccountAddress, PermStat)>> {
        let entries = self.entries.read().map_err(|_| GateError::LockPoisoned)?;
        let mut users: Vec<(AccountAddress, PermStat)> = entries
            .get(db)
            .map(|users| users.iter().map(|(a, p)| (*a, *p)).collect())
            .unwrap_or_default();
        users.sort_by_key(|(address, _)| *address);
        Ok(users)
    }

    /// Purges every entry of `db`. Returns the number removed.
    ///
    /// Not called when a database is dropped: permissions outlive deployments
    /// until an operator purges them.
    pub fn remove_database(&self, db: &DatabaseId) -> Result<usize> {
        let mut entries = self.entries.write().map_err(|_| GateError::LockPoisoned)?;
        Ok(entries.remove(db).map_or(0, |users| users.len()))
    }
}
