//! # strata-worker: the DBMS service of a worker node
//!
//! [`Dbms`] hosts any number of databases under one root directory. Each
//! database gets a directory with a `sqlite+shard` data file, one writer
//! connection and a pool of readers.
//!
//! Request flow for [`Dbms::query`]:
//! 1. Verify the request seal and the payload digest
//! 2. Reject requests whose timestamp is too far from the node clock
//! 3. Look up the database
//! 4. Ask the [`QueryGate`](strata_rbac::QueryGate) for the signee's permission
//! 5. Reject non-increasing sequence numbers per connection, and requests
//!    signed before the database was last reopened
//! 6. Execute, sign the response, and keep it until it is acked
//!
//! Deployment operations (`CreateDb`, `UpdateDb`, `DropDb`) are only accepted
//! from configured block producers. Acknowledged writes are pushed to
//! subscribed nodes through a [`TxNotifier`].

mod acks;
mod collab;
mod database;
mod dbms;
mod error;
mod journal;
mod replay;
mod state;

pub use collab::{LogNotifier, NodeDirectory, StaticDirectory, TxNotifier};
pub use dbms::Dbms;
pub use error::{DbmsError, DbmsResult};
pub use state::Subscription;
