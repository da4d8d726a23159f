//! Read model persistence abstraction.
//!
//! The projection engine never talks to a database directly. It depends on
//! [`ReadModelStore`], whose implementations must honour one concurrency contract:
//!
//! - `fetch` is a strongly consistent read. Stale reads defeat optimistic concurrency.
//! - `store` is a conditional write. It succeeds only if the currently stored version
//!   of the addressed row equals `expected_version` (0 meaning "no row yet"), and it
//!   reports a mismatch as [`ReadModelStoreError::OptimisticConcurrencyUnexpectedVersion`],
//!   distinguishable from every other failure.
//! - `delete` is unconditional.
//!
//! A row is addressed by `(read model name, id, sequence key)`. Read models that declare
//! a sequence key must always be addressed with it.
//!
//! # Implementations
//!
//! - `PostgresReadModelStore` (in `readside-projections`): JSONB documents with a version column
//! - `InMemoryReadModelStore` (in `readside-testing`): fast, deterministic testing
//!
//! # Dyn Compatibility
//!
//! Methods return [`BoxFuture`] instead of `impl Future` so the store can be shared as
//! `Arc<dyn ReadModelStore>` across concurrently running projection cycles.

use crate::read_model::{ReadModel, ReadModelFilter, ReadModelId, SequenceKey, Version};
use crate::BoxFuture;
use thiserror::Error;

/// Errors that can occur during read model persistence.
#[derive(Error, Debug)]
pub enum ReadModelStoreError {
    /// Conditional write rejected: the stored version is not the expected one.
    ///
    /// Another writer updated (or created) the row between our fetch and our store.
    #[error(
        "Optimistic concurrency conflict on {read_model_name} {id}: expected version {expected}"
    )]
    OptimisticConcurrencyUnexpectedVersion {
        /// Read model class
        read_model_name: String,
        /// Read model id
        id: ReadModelId,
        /// The version we expected to replace
        expected: Version,
    },

    /// A fetch by id matched more than one row.
    ///
    /// Typically a sequenced read model queried without its sequence key.
    #[error("Expected one {read_model_name} for id {id}, found {count}")]
    MultipleObjectsFound {
        /// Read model class
        read_model_name: String,
        /// Read model id
        id: ReadModelId,
        /// Number of rows found
        count: usize,
    },

    /// The read model to write has no usable id.
    #[error("{read_model_name} has no id field")]
    MissingId {
        /// Read model class
        read_model_name: String,
    },

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ReadModelStoreError {
    /// Whether this is an optimistic concurrency conflict (the only retryable error).
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::OptimisticConcurrencyUnexpectedVersion { .. })
    }
}

impl From<serde_json::Error> for ReadModelStoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for read model persistence.
pub type Result<T> = std::result::Result<T, ReadModelStoreError>;

/// Storage backend for read models.
pub trait ReadModelStore: Send + Sync {
    /// Load one read model by id (and sequence key, if the class declares one).
    ///
    /// # Returns
    ///
    /// - `Some(read_model)` if found
    /// - `None` if no row exists (a new read model, not an error)
    ///
    /// # Errors
    ///
    /// - [`ReadModelStoreError::MultipleObjectsFound`] if the address is ambiguous
    /// - [`ReadModelStoreError::Storage`] if retrieval fails
    fn fetch<'a>(
        &'a self,
        read_model_name: &'a str,
        id: &'a ReadModelId,
        sequence_key: Option<&'a SequenceKey>,
    ) -> BoxFuture<'a, Result<Option<ReadModel>>>;

    /// Find all read models of a class matching a filter.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelStoreError::Storage`] if the query fails.
    fn search<'a>(
        &'a self,
        read_model_name: &'a str,
        filter: &'a ReadModelFilter,
    ) -> BoxFuture<'a, Result<Vec<ReadModel>>>;

    /// Write a read model, conditioned on the stored version being `expected_version`.
    ///
    /// The read model already carries its new metadata (`version == expected_version + 1`).
    ///
    /// # Errors
    ///
    /// - [`ReadModelStoreError::OptimisticConcurrencyUnexpectedVersion`] on version mismatch
    /// - [`ReadModelStoreError::MissingId`] if the read model has no id
    /// - [`ReadModelStoreError::Storage`] for any other failure
    fn store<'a>(
        &'a self,
        read_model_name: &'a str,
        read_model: &'a ReadModel,
        sequence_key: Option<&'a SequenceKey>,
        expected_version: Version,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete a read model. No version check is performed.
    ///
    /// # Errors
    ///
    /// - [`ReadModelStoreError::MissingId`] if the read model has no id
    /// - [`ReadModelStoreError::Storage`] if deletion fails
    fn delete<'a>(
        &'a self,
        read_model_name: &'a str,
        read_model: &'a ReadModel,
        sequence_key: Option<&'a SequenceKey>,
    ) -> BoxFuture<'a, Result<()>>;
}
