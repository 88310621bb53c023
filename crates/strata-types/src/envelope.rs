//! Signed request, response and acknowledgement envelopes.
//!
//! Every envelope splits into a plain header (the signed content) and a
//! [`HeaderSignature`]. Signing and verification live in `strata-crypto`;
//! this module only defines the shapes.

use serde::{Deserialize, Serialize};

use crate::{
    AccountAddress, DatabaseId, Hash, HeaderSignature, NodeId, PermStat, QueryType,
    ServiceInstance, Timestamp, UpdateType, Value,
};

// ============================================================================
// Requests
// ============================================================================

/// A query argument. An empty name binds positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArg {
    pub name: String,
    pub value: Value,
}

impl NamedArg {
    pub fn positional(value: impl Into<Value>) -> Self {
        Self {
            name: String::new(),
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_positional(&self) -> bool {
        self.name.is_empty()
    }
}

/// One SQL batch with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub pattern: String,
    pub args: Vec<NamedArg>,
}

impl Query {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<NamedArg>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub query_type: QueryType,
    /// Node the request originates from.
    pub node_id: NodeId,
    pub database_id: DatabaseId,
    pub connection_id: u64,
    /// Strictly increasing per (signee, connection).
    pub seq_no: u64,
    pub timestamp: Timestamp,
    pub batch_count: u64,
    /// Digest of the [`RequestPayload`].
    pub query_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequestHeader {
    pub header: RequestHeader,
    pub signature: HeaderSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequestPayload {
    pub queries: Vec<Query>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub header: SignedRequestHeader,
    pub payload: RequestPayload,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub request: SignedRequestHeader,
    /// Node that executed the request.
    pub node_id: NodeId,
    pub timestamp: Timestamp,
    pub row_count: u64,
    /// Per-database sequence of the write. Zero for reads.
    pub log_offset: u64,
    pub last_insert_id: i64,
    pub affected_rows: u64,
    /// Digest of the [`ResponsePayload`].
    pub payload_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResponseHeader {
    pub header: ResponseHeader,
    pub signature: HeaderSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseRow {
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponsePayload {
    pub columns: Vec<String>,
    pub decl_types: Vec<String>,
    pub rows: Vec<ResponseRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub header: SignedResponseHeader,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn database_id(&self) -> &DatabaseId {
        &self.header.header.request.header.database_id
    }

    pub fn query_type(&self) -> QueryType {
        self.header.header.request.header.query_type
    }
}

// ============================================================================
// Acknowledgements
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHeader {
    pub response: SignedResponseHeader,
    /// Node sending the acknowledgement.
    pub node_id: NodeId,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAckHeader {
    pub header: AckHeader,
    pub signature: HeaderSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub header: SignedAckHeader,
}

impl Ack {
    pub fn response(&self) -> &SignedResponseHeader {
        &self.header.header.response
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub database_id: DatabaseId,
    pub log_offset: u64,
    /// Subscribers notified for this acknowledgement.
    pub notified: usize,
}

// ============================================================================
// Deployment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServiceHeader {
    pub op: UpdateType,
    pub instance: ServiceInstance,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUpdateServiceHeader {
    pub header: UpdateServiceHeader,
    pub signature: HeaderSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateService {
    pub header: SignedUpdateServiceHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServiceResponse {
    pub database_id: DatabaseId,
    pub op: UpdateType,
}

// ============================================================================
// Permission administration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionUpdateHeader {
    pub database_id: DatabaseId,
    pub user: AccountAddress,
    pub perm: PermStat,
    pub timestamp: Timestamp,
}

/// Remote permission change, signed by an admin of the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionUpdate {
    pub header: PermissionUpdateHeader,
    pub signature: HeaderSignature,
}
