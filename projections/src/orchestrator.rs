//! `ProjectionOrchestrator`: the single entry point of the projection engine.
//!
//! # Overview
//!
//! Given one entity snapshot, the orchestrator:
//! - Looks up every projection registered for the entity type
//! - Resolves each projection's join key into read model targets
//! - Runs one [`RetryCoordinator`] cycle per target, all concurrently
//! - Settles every cycle and reports per-target results
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │EntitySnapshotEnvelope│
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐      ┌──────────────────┐
//! │ProjectionOrchestrator│─────▶│ProjectionRegistry│
//! └──────────┬───────────┘      └──────────────────┘
//!            │ per projection: join key → targets
//!            ▼
//! ┌──────────────────────┐
//! │   RetryCoordinator   │ × N (join_all, failures isolated)
//! └──────────────────────┘
//! ```
//!
//! # Failure isolation
//!
//! A failing target never cancels or blocks the others. [`ProjectionOrchestrator::project`]
//! only returns `Err` when the snapshot itself is unusable; target failures are
//! collected in the [`ProjectionReport`] and callers decide whether to rethrow with
//! [`ProjectionReport::into_result`].

use crate::error::Result;
use crate::invoker::ProjectionInvoker;
use crate::join_key::{self, JoinKeyResolution};
use crate::metrics;
use crate::retry::{ProjectionTarget, RetryCoordinator, RetryPolicy, TargetOutcome};
use crate::writer::ReadModelWriter;
use futures::future::join_all;
use readside_core::config::{ConfigError, ProjectionRegistry};
use readside_core::entity::{Entity, EntitySnapshotEnvelope};
use readside_core::environment::{Clock, SystemClock};
use readside_core::error_handler::{GlobalErrorHandler, RethrowErrorHandler};
use readside_core::migration::{NoopSchemaMigrator, SchemaMigrator};
use readside_core::projection::ProjectionMetadata;
use readside_core::read_model::{ReadModel, ReadModelId, SequenceKey};
use readside_core::store::ReadModelStore;
use std::sync::Arc;
use std::time::Instant;

/// Result of projecting one entity snapshot.
#[derive(Debug)]
pub struct ProjectionReport {
    /// Entity type of the snapshot
    pub entity_type_name: String,
    /// Entity id of the snapshot
    pub entity_id: String,
    /// One entry per target, in registration order then join key order
    pub targets: Vec<TargetReport>,
}

impl ProjectionReport {
    fn empty(envelope: &EntitySnapshotEnvelope) -> Self {
        Self {
            entity_type_name: envelope.entity_type_name.clone(),
            entity_id: envelope.entity_id.clone(),
            targets: Vec::new(),
        }
    }

    /// Whether every target succeeded (vacuously true with no targets).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(|target| target.result.is_ok())
    }

    /// Targets that failed.
    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|target| target.result.is_err())
    }

    /// Convert into a plain result, surfacing the first failure.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failed target, if any.
    pub fn into_result(self) -> Result<Vec<TargetReport>> {
        let mut succeeded = Vec::with_capacity(self.targets.len());
        for target in self.targets {
            match target.result {
                Ok(outcome) => succeeded.push(TargetReport {
                    result: Ok(outcome),
                    ..target
                }),
                Err(error) => return Err(error),
            }
        }
        Ok(succeeded)
    }
}

/// Result of one `(read model, id, sequence key)` target.
#[derive(Debug)]
pub struct TargetReport {
    /// Read model class
    pub read_model_name: String,
    /// `"<ReadModel>.<method>"`
    pub projection_method: String,
    /// Target id, `None` for a filter join creating its first instance
    pub id: Option<ReadModelId>,
    /// Sequence key of the target
    pub sequence_key: Option<SequenceKey>,
    /// Attempts performed, 0 when the target failed before its first cycle
    pub attempts: usize,
    /// What happened
    pub result: Result<TargetOutcome>,
}

/// Projects entity snapshots onto every dependent read model.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct ProjectionOrchestrator {
    registry: Arc<ProjectionRegistry>,
    store: Arc<dyn ReadModelStore>,
    coordinator: RetryCoordinator,
}

impl ProjectionOrchestrator {
    /// Start building an orchestrator over `registry` and `store`.
    #[must_use]
    pub fn builder(
        registry: ProjectionRegistry,
        store: Arc<dyn ReadModelStore>,
    ) -> ProjectionOrchestratorBuilder {
        ProjectionOrchestratorBuilder {
            registry,
            store,
            migrator: None,
            error_handler: None,
            clock: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// The registry this orchestrator dispatches from.
    #[must_use]
    pub fn registry(&self) -> &ProjectionRegistry {
        &self.registry
    }

    /// Project one entity snapshot.
    ///
    /// Returns an empty report if no projection is registered for the entity type.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Entity`](crate::ProjectionError::Entity) if the snapshot value cannot be turned into
    /// an entity. Per-target failures are reported in the [`ProjectionReport`] instead.
    #[tracing::instrument(
        skip_all,
        name = "project_entity",
        fields(entity = %envelope.entity_type_name, entity_id = %envelope.entity_id)
    )]
    pub async fn project(&self, envelope: &EntitySnapshotEnvelope) -> Result<ProjectionReport> {
        let projections = self.registry.projections_for(&envelope.entity_type_name);
        if projections.is_empty() {
            tracing::debug!("No projections registered for entity type");
            return Ok(ProjectionReport::empty(envelope));
        }

        let entity = envelope.instantiate()?;
        metrics::record_snapshot(entity.type_name());

        let per_projection = projections
            .iter()
            .map(|metadata| self.project_one(metadata, &entity));
        let targets: Vec<TargetReport> = join_all(per_projection)
            .await
            .into_iter()
            .flatten()
            .collect();

        let failed = targets.iter().filter(|target| target.result.is_err()).count();
        if failed > 0 {
            tracing::error!(
                targets = targets.len(),
                failed,
                "Entity snapshot projected with failures"
            );
        } else {
            tracing::debug!(targets = targets.len(), "Entity snapshot projected");
        }

        Ok(ProjectionReport {
            entity_type_name: envelope.entity_type_name.clone(),
            entity_id: envelope.entity_id.clone(),
            targets,
        })
    }

    async fn project_one(&self, metadata: &ProjectionMetadata, entity: &Entity) -> Vec<TargetReport> {
        let Some(resolution) = join_key::resolve(entity, &metadata.join) else {
            return Vec::new();
        };
        let sequence_key =
            join_key::resolve_sequence_key(&self.registry, &metadata.read_model_name, entity);

        let ids: Vec<Option<ReadModelId>> = match resolution {
            JoinKeyResolution::ById(ids) => ids.into_iter().map(Some).collect(),
            JoinKeyResolution::ByFilter(filter) => {
                match self.store.search(&metadata.read_model_name, &filter).await {
                    Ok(matches) if matches.is_empty() => vec![None],
                    Ok(matches) => match_ids(&metadata.read_model_name, &matches)
                        .into_iter()
                        .map(Some)
                        .collect(),
                    Err(error) => {
                        tracing::error!(
                            read_model = %metadata.read_model_name,
                            error = %error,
                            "Read model search failed"
                        );
                        return vec![TargetReport {
                            read_model_name: metadata.read_model_name.clone(),
                            projection_method: metadata.projection_method(),
                            id: None,
                            sequence_key,
                            attempts: 0,
                            result: Err(error.into()),
                        }];
                    },
                }
            },
        };

        let cycles = ids.into_iter().map(|id| {
            let target = ProjectionTarget {
                id,
                sequence_key: sequence_key.clone(),
            };
            self.run_target(metadata, entity, target)
        });
        join_all(cycles).await
    }

    async fn run_target(
        &self,
        metadata: &ProjectionMetadata,
        entity: &Entity,
        target: ProjectionTarget,
    ) -> TargetReport {
        let started = Instant::now();
        let id = target.id.clone();
        let sequence_key = target.sequence_key.clone();

        let (attempts, result) = self.coordinator.run_settled(metadata, entity, target).await;
        if let Err(error) = &result {
            tracing::error!(
                read_model = %metadata.read_model_name,
                id = ?id,
                attempts,
                error = %error,
                "Projection target failed"
            );
        }

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(error) => error.label(),
        };
        metrics::record_target(&metadata.read_model_name, outcome, started.elapsed());

        TargetReport {
            read_model_name: metadata.read_model_name.clone(),
            projection_method: metadata.projection_method(),
            id,
            sequence_key,
            attempts,
            result,
        }
    }
}

/// Distinct ids of the search matches, in match order.
///
/// Sequenced read models keep several rows per id; each id is still one target.
fn match_ids(read_model_name: &str, matches: &[ReadModel]) -> Vec<ReadModelId> {
    let mut ids: Vec<ReadModelId> = Vec::with_capacity(matches.len());
    for found in matches {
        match found.id() {
            Some(id) if !ids.contains(&id) => ids.push(id),
            Some(_) => {},
            None => tracing::warn!(
                read_model = read_model_name,
                "Search matched a read model without a valid id, ignoring it"
            ),
        }
    }
    ids
}

impl std::fmt::Debug for ProjectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionOrchestrator")
            .field("registry", &self.registry)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ProjectionOrchestrator`].
///
/// # Defaults
///
/// - migrator: [`NoopSchemaMigrator`]
/// - error handler: [`RethrowErrorHandler`]
/// - clock: [`SystemClock`]
/// - retry policy: [`RetryPolicy::default`]
pub struct ProjectionOrchestratorBuilder {
    registry: ProjectionRegistry,
    store: Arc<dyn ReadModelStore>,
    migrator: Option<Arc<dyn SchemaMigrator>>,
    error_handler: Option<Arc<dyn GlobalErrorHandler>>,
    clock: Option<Arc<dyn Clock>>,
    retry_policy: RetryPolicy,
}

impl ProjectionOrchestratorBuilder {
    /// Use `migrator` to upgrade stored read models.
    #[must_use]
    pub fn migrator(mut self, migrator: Arc<dyn SchemaMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// Route projection function errors to `error_handler`.
    #[must_use]
    pub fn error_handler(mut self, error_handler: Arc<dyn GlobalErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Stamp `lastUpdateAt` from `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Retry conflicts according to `policy`.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SchemaVersionMismatch`] if the migrator upgrades a read
    /// model class to another schema version than the registry creates it at.
    pub fn build(self) -> std::result::Result<ProjectionOrchestrator, ConfigError> {
        let migrator = self
            .migrator
            .unwrap_or_else(|| Arc::new(NoopSchemaMigrator));
        check_schema_versions(&self.registry, migrator.as_ref())?;

        let registry = Arc::new(self.registry);
        let error_handler = self
            .error_handler
            .unwrap_or_else(|| Arc::new(RethrowErrorHandler));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let writer = ReadModelWriter::new(Arc::clone(&self.store), Arc::clone(&registry), clock);
        let coordinator = RetryCoordinator::new(
            Arc::clone(&self.store),
            migrator,
            ProjectionInvoker::new(error_handler),
            writer,
            self.retry_policy,
        );

        Ok(ProjectionOrchestrator {
            registry,
            store: self.store,
            coordinator,
        })
    }
}

fn check_schema_versions(
    registry: &ProjectionRegistry,
    migrator: &dyn SchemaMigrator,
) -> std::result::Result<(), ConfigError> {
    let mut configs: Vec<_> = registry.read_models().collect();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    for config in configs {
        if let Some(migrated) = migrator.target_schema_version(&config.name) {
            if migrated != config.schema_version {
                return Err(ConfigError::SchemaVersionMismatch {
                    read_model_name: config.name.clone(),
                    configured: config.schema_version,
                    migrated,
                });
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for ProjectionOrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionOrchestratorBuilder")
            .field("registry", &self.registry)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}
