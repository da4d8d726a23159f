//! Projection functions and their registration metadata.
//!
//! A projection binds one entity type to one read model class. The binding knows
//! how to find the affected read model instances (the join) and which function to
//! call to compute their new state.
//!
//! # Join Strategies
//!
//! The argument shape of a projection function depends on how the entity joins the
//! read model. The strategy is fixed at registration time:
//!
//! | strategy           | join rule                        | function arguments                    |
//! |--------------------|----------------------------------|---------------------------------------|
//! | `ScalarEntityJoin` | `entity[field]` is one id        | `(entity, existing)`                  |
//! | `ArrayEntityJoin`  | `entity[field]` is a list of ids | `(entity, id, existing)`              |
//! | `FilterJoin`       | `resolver(entity)` is a filter   | `(entity, Option<id>, existing)`      |
//!
//! # Example
//!
//! ```
//! use readside_core::projection::{self, ProjectionMetadata, ProjectionOutcome};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Cart {
//!     id: String,
//!     items: Vec<String>,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct CartSummary {
//!     id: String,
//!     item_count: usize,
//! }
//!
//! let metadata = ProjectionMetadata::scalar(
//!     "Cart",
//!     "CartSummary",
//!     "from_cart",
//!     "id",
//!     projection::scalar(|cart: Cart, _existing: Option<CartSummary>| async move {
//!         Ok(ProjectionOutcome::Updated(CartSummary {
//!             id: cart.id,
//!             item_count: cart.items.len(),
//!         }))
//!     }),
//! );
//!
//! assert_eq!(metadata.projection_method(), "CartSummary.from_cart");
//! ```

use crate::entity::Entity;
use crate::read_model::{ReadModel, ReadModelFilter, ReadModelId};
use crate::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Result of a projection function.
///
/// `Updated` carries the new (possibly partial) read model state; the engine fills
/// in the metadata block. `Deleted` removes the existing read model. `Unchanged`
/// performs no write at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectionOutcome<S> {
    /// Store this new state
    Updated(S),
    /// Delete the existing read model
    Deleted,
    /// Leave the existing read model as is
    Unchanged,
}

impl<S> ProjectionOutcome<S> {
    /// Convert the carried state, keeping `Deleted` and `Unchanged` as they are.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`.
    pub fn try_map<T, E>(self, f: impl FnOnce(S) -> Result<T, E>) -> Result<ProjectionOutcome<T>, E> {
        match self {
            Self::Updated(state) => f(state).map(ProjectionOutcome::Updated),
            Self::Deleted => Ok(ProjectionOutcome::Deleted),
            Self::Unchanged => Ok(ProjectionOutcome::Unchanged),
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Updated(_) => "updated",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Error raised from inside a projection function.
///
/// Cheap to clone so that error handlers can record it and still hand it back.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProjectionFnError {
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ProjectionFnError {
    /// Create an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error.
    #[must_use]
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for ProjectionFnError {
    fn from(error: serde_json::Error) -> Self {
        Self::from_error(error)
    }
}

/// Result type returned by registered projection handlers.
pub type ProjectionResult = Result<ProjectionOutcome<ReadModel>, ProjectionFnError>;

/// Handler for [`ProjectionJoin::ScalarEntityJoin`]: `(entity, existing)`.
pub type ScalarHandler =
    Arc<dyn Fn(Entity, Option<ReadModel>) -> BoxFuture<'static, ProjectionResult> + Send + Sync>;

/// Handler for [`ProjectionJoin::ArrayEntityJoin`]: `(entity, id, existing)`.
pub type ArrayHandler = Arc<
    dyn Fn(Entity, ReadModelId, Option<ReadModel>) -> BoxFuture<'static, ProjectionResult>
        + Send
        + Sync,
>;

/// Handler for [`ProjectionJoin::FilterJoin`]: `(entity, id, existing)`, `id` is
/// `None` when the first instance is being created.
pub type FilterHandler = Arc<
    dyn Fn(Entity, Option<ReadModelId>, Option<ReadModel>) -> BoxFuture<'static, ProjectionResult>
        + Send
        + Sync,
>;

/// Computes the filter selecting the read models an entity affects.
pub type FilterResolver = Arc<dyn Fn(&Entity) -> Option<ReadModelFilter> + Send + Sync>;

/// The closed set of join strategies, each owning its handler shape.
#[derive(Clone)]
pub enum ProjectionJoin {
    /// `entity[field]` holds a single read model id
    ScalarEntityJoin {
        /// Entity field holding the id
        field: String,
        /// Projection function
        handler: ScalarHandler,
    },
    /// `entity[field]` holds a list of read model ids
    ArrayEntityJoin {
        /// Entity field holding the ids
        field: String,
        /// Projection function
        handler: ArrayHandler,
    },
    /// A function of the entity selects read models by filter
    FilterJoin {
        /// Filter computation
        resolver: FilterResolver,
        /// Projection function
        handler: FilterHandler,
    },
}

impl ProjectionJoin {
    /// Short label used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ScalarEntityJoin { .. } => "scalar",
            Self::ArrayEntityJoin { .. } => "array",
            Self::FilterJoin { .. } => "filter",
        }
    }

    /// Entity field used by field-based joins.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::ScalarEntityJoin { field, .. } | Self::ArrayEntityJoin { field, .. } => {
                Some(field)
            },
            Self::FilterJoin { .. } => None,
        }
    }
}

// Manual Debug implementation since handlers don't implement Debug
impl fmt::Debug for ProjectionJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScalarEntityJoin { field, .. } => f
                .debug_struct("ProjectionJoin::ScalarEntityJoin")
                .field("field", field)
                .finish_non_exhaustive(),
            Self::ArrayEntityJoin { field, .. } => f
                .debug_struct("ProjectionJoin::ArrayEntityJoin")
                .field("field", field)
                .finish_non_exhaustive(),
            Self::FilterJoin { .. } => write!(f, "ProjectionJoin::FilterJoin(<resolver>)"),
        }
    }
}

/// One entity type × one read model class binding, registered at startup.
#[derive(Clone, Debug)]
pub struct ProjectionMetadata {
    /// Entity type this projection listens to
    pub entity_type_name: String,
    /// Read model class this projection writes
    pub read_model_name: String,
    /// Name of the projection function, used for provenance
    pub method_name: String,
    /// Join strategy and handler
    pub join: ProjectionJoin,
}

impl ProjectionMetadata {
    /// Register a projection joined through a single-id entity field.
    #[must_use]
    pub fn scalar(
        entity_type_name: impl Into<String>,
        read_model_name: impl Into<String>,
        method_name: impl Into<String>,
        field: impl Into<String>,
        handler: ScalarHandler,
    ) -> Self {
        Self {
            entity_type_name: entity_type_name.into(),
            read_model_name: read_model_name.into(),
            method_name: method_name.into(),
            join: ProjectionJoin::ScalarEntityJoin {
                field: field.into(),
                handler,
            },
        }
    }

    /// Register a projection joined through a list-of-ids entity field.
    #[must_use]
    pub fn array(
        entity_type_name: impl Into<String>,
        read_model_name: impl Into<String>,
        method_name: impl Into<String>,
        field: impl Into<String>,
        handler: ArrayHandler,
    ) -> Self {
        Self {
            entity_type_name: entity_type_name.into(),
            read_model_name: read_model_name.into(),
            method_name: method_name.into(),
            join: ProjectionJoin::ArrayEntityJoin {
                field: field.into(),
                handler,
            },
        }
    }

    /// Register a projection joined through a filter computed from the entity.
    #[must_use]
    pub fn filter<R>(
        entity_type_name: impl Into<String>,
        read_model_name: impl Into<String>,
        method_name: impl Into<String>,
        resolver: R,
        handler: FilterHandler,
    ) -> Self
    where
        R: Fn(&Entity) -> Option<ReadModelFilter> + Send + Sync + 'static,
    {
        Self {
            entity_type_name: entity_type_name.into(),
            read_model_name: read_model_name.into(),
            method_name: method_name.into(),
            join: ProjectionJoin::FilterJoin {
                resolver: Arc::new(resolver),
                handler,
            },
        }
    }

    /// `"<ReadModel>.<method>"`, recorded as projection provenance.
    #[must_use]
    pub fn projection_method(&self) -> String {
        format!("{}.{}", self.read_model_name, self.method_name)
    }
}

fn decode<E, R>(
    entity: &Entity,
    existing: Option<&ReadModel>,
) -> Result<(E, Option<R>), ProjectionFnError>
where
    E: DeserializeOwned,
    R: DeserializeOwned,
{
    let entity = entity.to_typed::<E>()?;
    let existing = existing.map(ReadModel::to_typed::<R>).transpose()?;
    Ok((entity, existing))
}

fn encode<R: Serialize>(outcome: ProjectionOutcome<R>) -> ProjectionResult {
    outcome.try_map(|state| ReadModel::from_typed(&state).map_err(ProjectionFnError::from))
}

/// Adapt a typed `(entity, existing)` function into a [`ScalarHandler`].
///
/// Entity and read model (de)serialization failures are reported as
/// [`ProjectionFnError`]s, exactly like errors returned by `f` itself.
pub fn scalar<E, R, F, Fut>(f: F) -> ScalarHandler
where
    E: DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(E, Option<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProjectionOutcome<R>, ProjectionFnError>> + Send + 'static,
{
    Arc::new(
        move |entity: Entity, existing: Option<ReadModel>| -> BoxFuture<'static, ProjectionResult> {
            match decode::<E, R>(&entity, existing.as_ref()) {
                Ok((entity, existing)) => {
                    let pending = f(entity, existing);
                    Box::pin(async move { encode(pending.await?) })
                },
                Err(error) => Box::pin(async move { Err(error) }),
            }
        },
    )
}

/// Adapt a typed `(entity, id, existing)` function into an [`ArrayHandler`].
pub fn array<E, R, F, Fut>(f: F) -> ArrayHandler
where
    E: DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(E, ReadModelId, Option<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProjectionOutcome<R>, ProjectionFnError>> + Send + 'static,
{
    Arc::new(
        move |entity: Entity,
              id: ReadModelId,
              existing: Option<ReadModel>|
              -> BoxFuture<'static, ProjectionResult> {
            match decode::<E, R>(&entity, existing.as_ref()) {
                Ok((entity, existing)) => {
                    let pending = f(entity, id, existing);
                    Box::pin(async move { encode(pending.await?) })
                },
                Err(error) => Box::pin(async move { Err(error) }),
            }
        },
    )
}

/// Adapt a typed `(entity, Option<id>, existing)` function into a [`FilterHandler`].
pub fn filter<E, R, F, Fut>(f: F) -> FilterHandler
where
    E: DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(E, Option<ReadModelId>, Option<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProjectionOutcome<R>, ProjectionFnError>> + Send + 'static,
{
    Arc::new(
        move |entity: Entity,
              id: Option<ReadModelId>,
              existing: Option<ReadModel>|
              -> BoxFuture<'static, ProjectionResult> {
            match decode::<E, R>(&entity, existing.as_ref()) {
                Ok((entity, existing)) => {
                    let pending = f(entity, id, existing);
                    Box::pin(async move { encode(pending.await?) })
                },
                Err(error) => Box::pin(async move { Err(error) }),
            }
        },
    )
}
