//! On-disk metadata of a hosted database.
//!
//! Each database directory holds:
//! - `data.db`: the SQLite database, with its shard catalog tables and the
//!   worker journal (write sequence, replay marks)
//! - `instance.json`: the deployment record
//! - `subscriptions.json`: transaction subscribers
//! - `permissions.json`: the PermStat of every user, once one was recorded

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use strata_types::{AccountAddress, NodeId, PermStat, ServiceInstance};

use crate::error::DbmsResult;

pub(crate) const DATA_FILE: &str = "data.db";
pub(crate) const INSTANCE_FILE: &str = "instance.json";
pub(crate) const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
pub(crate) const PERMISSIONS_FILE: &str = "permissions.json";

/// Directory under the root that dropped databases move into before removal.
/// Database IDs cannot start with a dot, so it never clashes with one.
pub(crate) const TRASH_DIR: &str = ".trash";

/// One user's PermStat as written to `permissions.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PermissionEntry {
    pub user: AccountAddress,
    pub perm: PermStat,
}

/// A node that wants acknowledged writes from `start_sequence` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub node_id: NodeId,
    pub start_sequence: u64,
}

/// Subscribers of one database, at most one per node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Subscriptions {
    by_node: BTreeMap<NodeId, u64>,
}

impl Subscriptions {
    /// Adds or replaces the subscription of `node`.
    pub fn insert(&mut self, node: NodeId, start_sequence: u64) -> Option<u64> {
        self.by_node.insert(node, start_sequence)
    }

    pub fn remove(&mut self, node: &NodeId) -> Option<u64> {
        self.by_node.remove(node)
    }

    /// Nodes subscribed at or before `log_offset`.
    pub fn due(&self, log_offset: u64) -> Vec<NodeId> {
        self.by_node
            .iter()
            .filter(|(_, start)| **start <= log_offset)
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn to_vec(&self) -> Vec<Subscription> {
        self.by_node
            .iter()
            .map(|(node_id, start_sequence)| Subscription {
                node_id: node_id.clone(),
                start_sequence: *start_sequence,
            })
            .collect()
    }
}

impl FromIterator<Subscription> for Subscriptions {
    fn from_iter<I: IntoIterator<Item = Subscription>>(iter: I) -> Self {
        Self {
            by_node: iter
                .into_iter()
                .map(|s| (s.node_id, s.start_sequence))
                .collect(),
        }
    }
}

// ============================================================================
// Files
// ============================================================================

/// Paths of one database directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DatabaseDir {
    root: PathBuf,
}

impl DatabaseDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_file(&self) -> PathBuf {
        self.root.join(DATA_FILE)
    }

    pub fn is_deployed(&self) -> bool {
        self.root.join(INSTANCE_FILE).is_file()
    }

    pub fn load_instance(&self) -> DbmsResult<ServiceInstance> {
        load_json(&self.root.join(INSTANCE_FILE))
    }

    pub fn save_instance(&self, instance: &ServiceInstance) -> DbmsResult<()> {
        save_json(&self.root.join(INSTANCE_FILE), instance)
    }

    /// Missing file means no subscribers.
    pub fn load_subscriptions(&self) -> DbmsResult<Subscriptions> {
        let path = self.root.join(SUBSCRIPTIONS_FILE);
        if !path.exists() {
            return Ok(Subscriptions::default());
        }
        let list: Vec<Subscription> = load_json(&path)?;
        Ok(list.into_iter().collect())
    }

    pub fn save_subscriptions(&self, subscriptions: &Subscriptions) -> DbmsResult<()> {
        save_json(&self.root.join(SUBSCRIPTIONS_FILE), &subscriptions.to_vec())
    }

    /// `None` until permissions were first recorded for the database.
    pub fn load_permissions(&self) -> DbmsResult<Option<Vec<PermissionEntry>>> {
        let path = self.root.join(PERMISSIONS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        load_json(&path).map(Some)
    }

    pub fn save_permissions(&self, entries: &[PermissionEntry]) -> DbmsResult<()> {
        save_json(&self.root.join(PERMISSIONS_FILE), entries)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> DbmsResult<T> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Writes through a temporary file so readers never see a partial file.
fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> DbmsResult<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
