//! Global handling of errors raised by projection functions.
//!
//! When a projection function fails, the engine asks the [`GlobalErrorHandler`] what
//! to do. Returning `Some(error)` rethrows it: the projection cycle of that one read
//! model target fails. Returning `None` suppresses it: the existing read model is
//! left untouched and the target is reported as suppressed.

use crate::entity::Entity;
use crate::projection::ProjectionFnError;
use crate::read_model::ReadModel;

/// Decides whether a projection function error is rethrown or suppressed.
pub trait GlobalErrorHandler: Send + Sync {
    /// Handle an error raised while projecting `entity` onto `existing`.
    ///
    /// Return `Some` to rethrow (possibly a different error), `None` to suppress.
    fn on_projection_error(
        &self,
        error: ProjectionFnError,
        entity: &Entity,
        existing: Option<&ReadModel>,
    ) -> Option<ProjectionFnError>;
}

/// Default handler: every projection error is rethrown.
#[derive(Debug, Clone, Copy, Default)]
pub struct RethrowErrorHandler;

impl GlobalErrorHandler for RethrowErrorHandler {
    fn on_projection_error(
        &self,
        error: ProjectionFnError,
        _entity: &Entity,
        _existing: Option<&ReadModel>,
    ) -> Option<ProjectionFnError> {
        Some(error)
    }
}

/// Handler that logs and suppresses every projection error.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressErrorHandler;

impl GlobalErrorHandler for SuppressErrorHandler {
    fn on_projection_error(
        &self,
        error: ProjectionFnError,
        entity: &Entity,
        _existing: Option<&ReadModel>,
    ) -> Option<ProjectionFnError> {
        tracing::warn!(
            entity = entity.type_name(),
            entity_id = entity.id(),
            error = %error,
            "Suppressing projection error"
        );
        None
    }
}
