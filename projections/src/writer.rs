//! Persisting projection outcomes.
//!
//! The writer is the only component that stamps the reserved metadata block. For an
//! updated state it computes:
//!
//! - `version = expected + 1`, where `expected` is the version of the (migrated)
//!   existing read model, or 0 when there is none
//! - `schemaVersion` from the existing read model, or the class's current schema
//!   version for a new one
//! - `lastUpdateAt` from the injected [`Clock`]
//! - `lastProjectionInfo` from the entity and the projection
//!
//! and issues a store conditioned on `expected`.

use crate::error::{ProjectionError, Result};
use readside_core::config::ProjectionRegistry;
use readside_core::entity::Entity;
use readside_core::environment::Clock;
use readside_core::projection::{ProjectionMetadata, ProjectionOutcome};
use readside_core::read_model::{
    ProjectionInfo, ReadModel, ReadModelId, ReadModelMetadata, SequenceKey, Version, ID_FIELD,
};
use readside_core::store::ReadModelStore;
use serde_json::Value;
use std::sync::Arc;

/// What the writer did with an outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteResult {
    /// The new state was stored, metadata included
    Stored(ReadModel),
    /// The existing read model was deleted
    Deleted,
    /// Nothing was written
    Unchanged,
}

/// Everything the writer needs to persist one outcome.
#[derive(Debug)]
pub struct WriteRequest<'a> {
    /// Projection that produced the outcome
    pub metadata: &'a ProjectionMetadata,
    /// Entity that was projected
    pub entity: &'a Entity,
    /// The existing read model, already migrated
    pub existing: Option<&'a ReadModel>,
    /// Target id, used when the new state carries none
    pub target_id: Option<&'a ReadModelId>,
    /// Sequence key of the target row
    pub sequence_key: Option<&'a SequenceKey>,
}

/// Writes projection outcomes through a [`ReadModelStore`].
#[derive(Clone)]
pub struct ReadModelWriter {
    store: Arc<dyn ReadModelStore>,
    registry: Arc<ProjectionRegistry>,
    clock: Arc<dyn Clock>,
}

impl ReadModelWriter {
    /// Create a writer.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        registry: Arc<ProjectionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Persist `outcome`.
    ///
    /// - `Deleted` deletes the existing read model (no version check). Without an
    ///   existing read model there is nothing to delete and nothing is written.
    /// - `Unchanged` returns immediately.
    /// - `Updated` stamps the metadata and stores conditionally on the expected version.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Store`] if persistence fails; an optimistic concurrency
    ///   conflict is reported as such
    /// - [`ProjectionError::MissingReadModelId`] if the new state has no id and the
    ///   target has none to fill in
    pub async fn write(
        &self,
        request: WriteRequest<'_>,
        outcome: ProjectionOutcome<ReadModel>,
    ) -> Result<WriteResult> {
        let read_model_name = request.metadata.read_model_name.as_str();
        match outcome {
            ProjectionOutcome::Unchanged => Ok(WriteResult::Unchanged),
            ProjectionOutcome::Deleted => {
                let Some(existing) = request.existing else {
                    tracing::debug!(
                        read_model = read_model_name,
                        id = ?request.target_id,
                        "Projection asked to delete a read model that does not exist"
                    );
                    return Ok(WriteResult::Unchanged);
                };
                self.store
                    .delete(read_model_name, existing, request.sequence_key)
                    .await?;
                tracing::debug!(
                    read_model = read_model_name,
                    id = ?existing.id(),
                    "Read model deleted"
                );
                Ok(WriteResult::Deleted)
            },
            ProjectionOutcome::Updated(mut state) => {
                let expected = request.existing.map_or(Version::INITIAL, ReadModel::version);
                let schema_version = request
                    .existing
                    .and_then(ReadModel::schema_version)
                    .unwrap_or_else(|| self.registry.schema_version(read_model_name));

                if state.id().is_none() {
                    let Some(id) = request.target_id.cloned().or_else(|| {
                        request.existing.and_then(ReadModel::id)
                    }) else {
                        return Err(ProjectionError::MissingReadModelId {
                            projection: request.metadata.projection_method(),
                        });
                    };
                    state
                        .fields
                        .insert(ID_FIELD.to_string(), Value::String(id.into_inner()));
                }
                if let Some(sequence_key) = request.sequence_key {
                    state
                        .fields
                        .entry(sequence_key.name.clone())
                        .or_insert_with(|| {
                            request
                                .entity
                                .field(&sequence_key.name)
                                .cloned()
                                .unwrap_or_else(|| Value::String(sequence_key.value.clone()))
                        });
                }

                state.metadata = Some(ReadModelMetadata {
                    version: expected.next(),
                    schema_version,
                    last_update_at: self.clock.now(),
                    last_projection_info: Some(ProjectionInfo {
                        entity_id: request.entity.id().to_string(),
                        entity_name: request.entity.type_name().to_string(),
                        entity_updated_at: request.entity.updated_at(),
                        projection_method: request.metadata.projection_method(),
                    }),
                });

                self.store
                    .store(read_model_name, &state, request.sequence_key, expected)
                    .await?;
                tracing::debug!(
                    read_model = read_model_name,
                    id = ?state.id(),
                    version = %expected.next(),
                    "Read model stored"
                );
                Ok(WriteResult::Stored(state))
            },
        }
    }
}

impl std::fmt::Debug for ReadModelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadModelWriter").finish_non_exhaustive()
    }
}
