//! Calling projection functions with the argument shape of their join strategy.

use crate::error::{ProjectionError, Result};
use readside_core::entity::Entity;
use readside_core::error_handler::GlobalErrorHandler;
use readside_core::projection::{ProjectionJoin, ProjectionMetadata, ProjectionOutcome};
use readside_core::read_model::{ReadModel, ReadModelId};
use std::sync::Arc;

/// What came out of one projection function call.
#[derive(Clone, Debug, PartialEq)]
pub enum Invocation {
    /// The function returned an outcome
    Outcome(ProjectionOutcome<ReadModel>),
    /// The function failed and the global error handler suppressed the error
    Suppressed,
}

/// Invokes registered projection functions and routes their errors through the
/// [`GlobalErrorHandler`].
#[derive(Clone)]
pub struct ProjectionInvoker {
    error_handler: Arc<dyn GlobalErrorHandler>,
}

impl ProjectionInvoker {
    /// Create an invoker reporting errors to `error_handler`.
    #[must_use]
    pub fn new(error_handler: Arc<dyn GlobalErrorHandler>) -> Self {
        Self { error_handler }
    }

    /// Call the projection function of `metadata`.
    ///
    /// `id` is the read model instance being produced. It is required by array joins,
    /// ignored by scalar joins, and `None` for a filter join creating its first instance.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::ProjectionFunction`] if the function failed and the global
    ///   error handler rethrew
    /// - [`ProjectionError::MissingReadModelId`] if an array join is invoked without id
    pub async fn invoke(
        &self,
        metadata: &ProjectionMetadata,
        entity: &Entity,
        existing: Option<&ReadModel>,
        id: Option<&ReadModelId>,
    ) -> Result<Invocation> {
        let result = match &metadata.join {
            ProjectionJoin::ScalarEntityJoin { handler, .. } => {
                handler(entity.clone(), existing.cloned()).await
            },
            ProjectionJoin::ArrayEntityJoin { handler, .. } => {
                let Some(id) = id else {
                    return Err(ProjectionError::MissingReadModelId {
                        projection: metadata.projection_method(),
                    });
                };
                handler(entity.clone(), id.clone(), existing.cloned()).await
            },
            ProjectionJoin::FilterJoin { handler, .. } => {
                handler(entity.clone(), id.cloned(), existing.cloned()).await
            },
        };

        match result {
            Ok(outcome) => {
                tracing::trace!(
                    projection = %metadata.projection_method(),
                    outcome = outcome.label(),
                    "Projection function returned"
                );
                Ok(Invocation::Outcome(outcome))
            },
            Err(error) => {
                tracing::warn!(
                    projection = %metadata.projection_method(),
                    entity_id = entity.id(),
                    error = %error,
                    "Projection function failed"
                );
                match self
                    .error_handler
                    .on_projection_error(error, entity, existing)
                {
                    Some(error) => Err(ProjectionError::ProjectionFunction {
                        projection: metadata.projection_method(),
                        source: error,
                    }),
                    None => Ok(Invocation::Suppressed),
                }
            },
        }
    }
}

impl std::fmt::Debug for ProjectionInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionInvoker").finish_non_exhaustive()
    }
}
