//! Errors of the projection engine.
//!
//! Every variant is scoped to one read model target, except
//! [`ProjectionError::Entity`] which aborts the whole snapshot before any target runs.

use readside_core::entity::EntityError;
use readside_core::migration::MigrationError;
use readside_core::projection::ProjectionFnError;
use readside_core::store::ReadModelStoreError;
use thiserror::Error;

/// Error type for projection engine operations.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// Read model persistence failed.
    ///
    /// Optimistic concurrency conflicts only surface here from the writer; the
    /// retry coordinator turns them into retries or [`ProjectionError::RetriesExhausted`].
    #[error(transparent)]
    Store(#[from] ReadModelStoreError),

    /// The stored read model could not be migrated to the current schema.
    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),

    /// The projection function failed and the global error handler rethrew.
    #[error("Projection {projection} failed: {source}")]
    ProjectionFunction {
        /// `"<ReadModel>.<method>"`
        projection: String,
        /// Error returned by the global error handler
        #[source]
        source: ProjectionFnError,
    },

    /// Every attempt hit an optimistic concurrency conflict.
    #[error("Giving up on {read_model_name} {id} after {attempts} conflicting attempts")]
    RetriesExhausted {
        /// Read model class
        read_model_name: String,
        /// Target id (`<new>` for a filter-joined first instance)
        id: String,
        /// Attempts performed
        attempts: usize,
        /// The last conflict
        #[source]
        source: ReadModelStoreError,
    },

    /// The projection produced a state without id and the target has none either.
    #[error("Projection {projection} produced a read model without an id")]
    MissingReadModelId {
        /// `"<ReadModel>.<method>"`
        projection: String,
    },

    /// The snapshot could not be turned into an entity.
    #[error(transparent)]
    Entity(#[from] EntityError),
}

impl ProjectionError {
    /// Whether this error is an optimistic concurrency conflict from the store.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_concurrency_conflict())
    }

    /// Short label used in metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Store(_) => "store_error",
            Self::Migration(_) => "migration_error",
            Self::ProjectionFunction { .. } => "projection_error",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::MissingReadModelId { .. } => "missing_id",
            Self::Entity(_) => "entity_error",
        }
    }
}

/// Result type for projection engine operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
