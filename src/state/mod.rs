//! The shared state abstraction between the Director and Matchmakers.
//!
//! Both roles communicate exclusively through a small typed keyspace:
//! strings with TTL (status blobs, the leader lease, pool configuration),
//! unordered sets (live ticket ids, registered matchmakers) and append-only
//! streams with per-entry ids (ticket and match hand-off). The [`State`]
//! trait captures exactly those capabilities; everything above it is
//! backend-agnostic.
//!
//! # Available Implementations
//!
//! - [`MemoryState`](memory::MemoryState): in-process backend for Standalone
//!   mode and tests
//! - [`RedisState`](redis::RedisState): Redis backend for distributed
//!   deployments (required whenever the two roles run in separate processes)
//!
//! # Batching
//!
//! Batch variants exist so backends can collapse many entries into one
//! round-trip (the Redis backend pipelines them). Where an operation is
//! per-element, failure is reported per entry through a parallel result
//! vector rather than failing the whole batch. Callers cap batch sizes at
//! [`BATCH_LIMIT`](crate::constants::BATCH_LIMIT).

pub mod keys;
pub mod memory;
pub mod redis;

pub use memory::MemoryState;
pub use redis::RedisState;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::StateId;

pub type StateResult<T> = Result<T, StateError>;

/// State-backend failures.
#[derive(Debug, Error)]
pub enum StateError {
    /// The Redis backend reported an error.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// An operation hit a key holding a different type.
    #[error("key '{key}' holds {actual:?}, expected {expected:?}")]
    WrongType {
        key: String,
        expected: KeyKind,
        actual: KeyKind,
    },

    /// The backend could not be reached.
    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

/// The type a key currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    None,
    String,
    Stream,
    Set,
}

/// One stream entry: the backend-assigned id and the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StateId,
    pub data: Bytes,
}

/// Typed key/value capabilities shared by both roles.
///
/// All operations are asynchronous and may suspend on backend I/O. None of
/// them observe cancellation: an in-flight operation completes or fails on
/// its own even when the caller's loop is shutting down.
#[async_trait]
pub trait State: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Read a string key. `None` when absent or expired.
    async fn get_string(&self, key: &str) -> StateResult<Option<String>>;

    /// Write a string key. `None` removes it; `ttl` arms expiry.
    async fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> StateResult<()>;

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Append one entry; returns the assigned entry id.
    async fn stream_add(&self, key: &str, data: Bytes) -> StateResult<StateId>;

    /// Append many entries in one round-trip. The result is parallel to the
    /// input; `None` marks an entry the backend rejected.
    async fn stream_add_batch(&self, key: &str, entries: &[Bytes])
        -> StateResult<Vec<Option<StateId>>>;

    /// Read entries oldest-first, up to `max_count` when given. Entries are
    /// not consumed by reading.
    async fn stream_read(&self, key: &str, max_count: Option<usize>)
        -> StateResult<Vec<StreamEntry>>;

    /// Drop a whole stream.
    async fn stream_delete(&self, key: &str) -> StateResult<()>;

    /// Delete specific entries; returns how many actually existed.
    async fn stream_delete_messages(&self, key: &str, ids: &[StateId]) -> StateResult<usize>;

    // ------------------------------------------------------------------
    // Sets
    // ------------------------------------------------------------------

    /// Add a member; `true` when it was not present before.
    async fn set_add(&self, key: &str, member: &str) -> StateResult<bool>;

    /// Batch add; result is parallel to the input.
    async fn set_add_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>>;

    /// Remove a member; `true` when it was present.
    async fn set_remove(&self, key: &str, member: &str) -> StateResult<bool>;

    /// Batch remove; result is parallel to the input.
    async fn set_remove_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>>;

    /// Membership test.
    async fn set_contains(&self, key: &str, member: &str) -> StateResult<bool>;

    /// Batch membership test; result is parallel to the input.
    async fn set_contains_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>>;

    /// All members, in no particular order.
    async fn set_values(&self, key: &str) -> StateResult<Vec<String>>;

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Remove a key of any type.
    async fn key_delete(&self, key: &str) -> StateResult<()>;

    /// The type currently held at a key.
    async fn key_type(&self, key: &str) -> StateResult<KeyKind>;
}
