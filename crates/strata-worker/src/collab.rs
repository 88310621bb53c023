//! Collaborators outside the core: node lookup and transaction delivery.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use strata_types::{AccountAddress, DatabaseId, NodeId, SignedResponseHeader};
use tracing::debug;

/// Resolves the account a node signs with.
pub trait NodeDirectory: Send + Sync {
    fn account_of(&self, node: &NodeId) -> Option<AccountAddress>;
}

/// Delivers acknowledged write transactions to subscribed nodes.
pub trait TxNotifier: Send + Sync {
    fn notify(&self, database_id: &DatabaseId, node: &NodeId, response: &SignedResponseHeader);
}

/// Fixed node-to-account map.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    accounts: RwLock<HashMap<NodeId, AccountAddress>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `node` to `account`, replacing any previous account.
    ///
    /// The map holds plain values, so a guard poisoned by a panicking writer
    /// is recovered rather than dropping the insert.
    pub fn insert(&self, node: NodeId, account: AccountAddress) -> Option<AccountAddress> {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, account)
    }
}

impl NodeDirectory for StaticDirectory {
    fn account_of(&self, node: &NodeId) -> Option<AccountAddress> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .copied()
    }
}

/// Notifier that only logs; used when no transport is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl TxNotifier for LogNotifier {
    fn notify(&self, database_id: &DatabaseId, node: &NodeId, response: &SignedResponseHeader) {
        debug!(
            database = %database_id,
            node = %node,
            log_offset = response.header.log_offset,
            "transaction ready for subscriber"
        );
    }
}
