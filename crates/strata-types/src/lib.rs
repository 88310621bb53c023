//! # strata-types: Core types for `Strata`
//!
//! This crate contains shared types used across the `Strata` worker:
//! - Entity IDs ([`DatabaseId`], [`NodeId`], [`AccountAddress`])
//! - Cryptographic types ([`struct@Hash`], [`PublicKey`], [`Signature`], [`HeaderSignature`])
//! - Temporal types ([`Timestamp`])
//! - Access control ([`Permission`], [`UserStatus`], [`PermStat`], [`QueryType`])
//! - Deployment ([`ServiceInstance`], [`Peers`], [`GenesisBlock`], [`UpdateType`])
//! - Typed SQL values ([`Value`])
//! - Signed request/response/ack envelopes ([`Request`], [`Response`], [`Ack`])

use std::{
    fmt::{Debug, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

mod envelope;
mod value;

pub use envelope::{
    Ack, AckHeader, AckResponse, NamedArg, PermissionUpdate, PermissionUpdateHeader, Query,
    Request, RequestHeader, RequestPayload, Response, ResponseHeader, ResponsePayload,
    ResponseRow, SignedAckHeader, SignedRequestHeader, SignedResponseHeader,
    SignedUpdateServiceHeader, UpdateService, UpdateServiceHeader, UpdateServiceResponse,
};
pub use value::Value;

// ============================================================================
// Entity IDs
// ============================================================================

/// Longest database identifier accepted as an on-disk directory name.
pub const MAX_DATABASE_ID_LEN: usize = 128;

/// Identifier of a hosted database.
///
/// Database IDs double as directory names under the worker root, so only
/// IDs passing [`DatabaseId::is_path_safe`] can be deployed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseId(String);

impl DatabaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the database ID owned by an account address.
    ///
    /// # Examples
    ///
    /// ```
    /// # use strata_types::{AccountAddress, DatabaseId, Hash};
    /// let addr = AccountAddress::from(Hash::from_bytes([0xab; 32]));
    /// let id = DatabaseId::from_address(&addr);
    /// assert_eq!(id.as_str().len(), 64);
    /// ```
    pub fn from_address(address: &AccountAddress) -> Self {
        Self(address.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is usable as a single path component.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_DATABASE_ID_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a peer node in the network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Cryptographic Types - Copy where fixed-size
// ============================================================================

/// Length of digests in bytes (BLAKE3).
pub const HASH_LENGTH: usize = 32;

/// Length of Ed25519 public keys in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// A 32-byte digest.
///
/// Used for header hashes, payload hashes and account addresses. The
/// algorithm is chosen by `strata-crypto`; this type only stores bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LENGTH]
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to tell hashes apart in logs
        write!(
            f,
            "Hash({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// Error parsing a hex-encoded [`struct@Hash`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hash {0:?}: expected {HASH_LENGTH} hex-encoded bytes")]
pub struct ParseHashError(String);

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != HASH_LENGTH * 2 || !s.is_ascii() {
            return Err(ParseHashError(s.to_string()));
        }
        let mut bytes = [0u8; HASH_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseHashError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Account address of a user, derived from the hash of its public key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AccountAddress(Hash);

impl AccountAddress {
    pub fn hash(&self) -> &Hash {
        &self.0
    }
}

impl Display for AccountAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for AccountAddress {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<Hash> for AccountAddress {
    fn from(hash: Hash) -> Self {
        Self(hash)
    }
}

/// Raw Ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PublicKey({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Raw signature bytes (64 bytes for Ed25519).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Signature block attached to every signed header.
///
/// `hash` is the digest of the header's canonical encoding, and
/// `signature` is the signee's signature over that digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeaderSignature {
    pub hash: Hash,
    pub signee: PublicKey,
    pub signature: Signature,
}

// ============================================================================
// Timestamp - Copy (8-byte value)
// ============================================================================

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp as seconds since Unix epoch (truncates nanoseconds).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Creates a timestamp for the current time.
    ///
    /// A clock set before the Unix epoch reads as [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(self, other: Timestamp) -> Duration {
        Duration::from_nanos(self.0.abs_diff(other.0))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as u64))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

// ============================================================================
// Access Control
// ============================================================================

/// Permission level of a user on one database.
///
/// Levels are ordered by capability: `Void < Read < Write < Admin`.
/// Every level except `Void` also grants the levels below it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Permission {
    /// No access at all.
    #[default]
    Void,
    /// Read queries.
    Read,
    /// Read and write queries.
    Write,
    /// Everything, including permission and subscription management.
    Admin,
}

impl Permission {
    /// Returns true if this level grants `required`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use strata_types::Permission;
    /// assert!(Permission::Admin.allows(Permission::Read));
    /// assert!(!Permission::Read.allows(Permission::Write));
    /// assert!(!Permission::Void.allows(Permission::Void));
    /// ```
    pub fn allows(self, required: Permission) -> bool {
        self != Permission::Void && self >= required
    }
}

impl Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Permission::Void => "void",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// Billing status of a user on one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UserStatus {
    /// Account in good standing.
    #[default]
    Normal,
    /// Balance running low; the user has been reminded.
    Reminder,
    /// Balance exhausted.
    Arrears,
    /// Billing under dispute.
    Arbitration,
}

impl UserStatus {
    pub fn is_normal(self) -> bool {
        self == UserStatus::Normal
    }
}

impl Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserStatus::Normal => "normal",
            UserStatus::Reminder => "reminder",
            UserStatus::Arrears => "arrears",
            UserStatus::Arbitration => "arbitration",
        };
        f.write_str(s)
    }
}

/// Permission level plus billing status for one (database, user) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PermStat {
    pub permission: Permission,
    pub status: UserStatus,
}

impl PermStat {
    pub fn new(permission: Permission, status: UserStatus) -> Self {
        Self { permission, status }
    }
}

/// Kind of query carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    Read,
    Write,
}

impl Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryType::Read => f.write_str("read"),
            QueryType::Write => f.write_str("write"),
        }
    }
}

// ============================================================================
// Deployment
// ============================================================================

/// Peer set serving a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Peers {
    pub term: u64,
    pub leader: NodeId,
    pub servers: Vec<NodeId>,
}

/// Initial permission carried by a genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGrant {
    pub user: AccountAddress,
    pub perm: PermStat,
}

/// Hashed content of a genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenesisHeader {
    pub producer: AccountAddress,
    pub timestamp: Timestamp,
    /// Initial schema/state, applied in one transaction.
    pub statements: Vec<String>,
    pub grants: Vec<UserGrant>,
}

/// First block of a database chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenesisBlock {
    pub header: GenesisHeader,
    /// Digest of `header`; checked before the block is applied.
    pub hash: Hash,
}

/// Deployment record for a hosted database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub database_id: DatabaseId,
    pub peers: Peers,
    pub genesis: Option<GenesisBlock>,
}

impl ServiceInstance {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            peers: Peers::default(),
            genesis: None,
        }
    }

    pub fn with_peers(mut self, peers: Peers) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_genesis(mut self, genesis: GenesisBlock) -> Self {
        self.genesis = Some(genesis);
        self
    }
}

/// Lifecycle operation carried by an [`UpdateService`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateType {
    CreateDb,
    UpdateDb,
    DropDb,
}

impl Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateType::CreateDb => f.write_str("create_db"),
            UpdateType::UpdateDb => f.write_str("update_db"),
            UpdateType::DropDb => f.write_str("drop_db"),
        }
    }
}
