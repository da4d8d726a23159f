//! Read model schema migration.
//!
//! Stored read models may have been written by an older version of their class.
//! Before a stored read model is handed to a projection function it goes through a
//! [`SchemaMigrator`], which must be idempotent: migrating an already current read
//! model returns it unchanged.

use crate::config::ProjectionRegistry;
use crate::read_model::ReadModel;
use crate::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while migrating a read model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// No step is registered to upgrade from this schema version.
    #[error("No migration registered for {read_model_name} from schema version {from}")]
    MissingStep {
        /// Read model class
        read_model_name: String,
        /// Schema version lacking a step
        from: u32,
    },

    /// The stored document is newer than the code knows about.
    #[error("{read_model_name} is at schema version {stored}, newer than latest {latest}")]
    FromTheFuture {
        /// Read model class
        read_model_name: String,
        /// Stored schema version
        stored: u32,
        /// Latest known schema version
        latest: u32,
    },

    /// A migration step failed.
    #[error("Migration of {read_model_name} from schema version {from} failed: {message}")]
    StepFailed {
        /// Read model class
        read_model_name: String,
        /// Schema version being upgraded
        from: u32,
        /// Failure description
        message: String,
    },
}

/// Upgrades stored read models to the current schema version.
pub trait SchemaMigrator: Send + Sync {
    /// Migrate `read_model` (of class `read_model_name`) to its latest schema.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] if the read model cannot be upgraded.
    fn migrate<'a>(
        &'a self,
        read_model: ReadModel,
        read_model_name: &'a str,
    ) -> BoxFuture<'a, Result<ReadModel, MigrationError>>;

    /// Schema version this migrator upgrades `read_model_name` to, if it manages
    /// that class.
    ///
    /// Must agree with the class's [`ReadModelConfig::schema_version`], which is
    /// stamped on newly created read models.
    ///
    /// [`ReadModelConfig::schema_version`]: crate::config::ReadModelConfig::schema_version
    fn target_schema_version(&self, _read_model_name: &str) -> Option<u32> {
        None
    }
}

/// Migrator for deployments without schema evolution: returns its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSchemaMigrator;

impl SchemaMigrator for NoopSchemaMigrator {
    fn migrate<'a>(
        &'a self,
        read_model: ReadModel,
        _read_model_name: &'a str,
    ) -> BoxFuture<'a, Result<ReadModel, MigrationError>> {
        Box::pin(async move { Ok(read_model) })
    }
}

/// One upgrade step: the fields at schema version `n` to the fields at `n + 1`.
pub type MigrationStep =
    Arc<dyn Fn(Map<String, Value>) -> Result<Map<String, Value>, String> + Send + Sync>;

struct ReadModelMigrations {
    latest: u32,
    steps: HashMap<u32, MigrationStep>,
}

/// Step-wise migrator keyed by read model class and schema version.
///
/// Each class registers its latest schema version and one step per upgrade. A stored
/// read model at schema version `n` runs steps `n, n + 1, ..., latest - 1` in order,
/// then has its metadata stamped with `latest`. Read models without metadata, or of
/// classes without registered migrations, are returned unchanged.
///
/// # Example
///
/// ```
/// use readside_core::migration::{SchemaMigrator, VersionedSchemaMigrator};
///
/// let migrator = VersionedSchemaMigrator::new()
///     .latest_version("CartSummary", 2)
///     .step("CartSummary", 1, |mut fields| {
///         let count = fields.remove("count").unwrap_or_default();
///         fields.insert("itemCount".to_string(), count);
///         Ok(fields)
///     });
/// ```
#[derive(Default)]
pub struct VersionedSchemaMigrator {
    read_models: HashMap<String, ReadModelMigrations>,
}

impl VersionedSchemaMigrator {
    /// Create a migrator with no registered classes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a migrator whose latest schema versions are those of `registry`.
    ///
    /// Steps registered afterwards upgrade towards the registry's versions, so newly
    /// created read models and migrated ones always end up at the same schema.
    #[must_use]
    pub fn for_registry(registry: &ProjectionRegistry) -> Self {
        registry.read_models().fold(Self::new(), |migrator, config| {
            migrator.latest_version(config.name.clone(), config.schema_version)
        })
    }

    /// Declare the latest schema version of a read model class.
    #[must_use]
    pub fn latest_version(mut self, read_model_name: impl Into<String>, latest: u32) -> Self {
        self.read_models
            .entry(read_model_name.into())
            .or_insert_with(|| ReadModelMigrations {
                latest,
                steps: HashMap::new(),
            })
            .latest = latest;
        self
    }

    /// Register the step upgrading `read_model_name` from schema version `from`.
    #[must_use]
    pub fn step<F>(mut self, read_model_name: impl Into<String>, from: u32, step: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Result<Map<String, Value>, String> + Send + Sync + 'static,
    {
        self.read_models
            .entry(read_model_name.into())
            .or_insert_with(|| ReadModelMigrations {
                latest: from + 1,
                steps: HashMap::new(),
            })
            .steps
            .insert(from, Arc::new(step));
        self
    }

    fn migrate_now(
        &self,
        mut read_model: ReadModel,
        read_model_name: &str,
    ) -> Result<ReadModel, MigrationError> {
        let Some(migrations) = self.read_models.get(read_model_name) else {
            return Ok(read_model);
        };
        let Some(stored) = read_model.schema_version() else {
            return Ok(read_model);
        };

        if stored > migrations.latest {
            return Err(MigrationError::FromTheFuture {
                read_model_name: read_model_name.to_string(),
                stored,
                latest: migrations.latest,
            });
        }
        if stored == migrations.latest {
            return Ok(read_model);
        }

        let mut fields = std::mem::take(&mut read_model.fields);
        for from in stored..migrations.latest {
            let step = migrations
                .steps
                .get(&from)
                .ok_or_else(|| MigrationError::MissingStep {
                    read_model_name: read_model_name.to_string(),
                    from,
                })?;
            fields = step(fields).map_err(|message| MigrationError::StepFailed {
                read_model_name: read_model_name.to_string(),
                from,
                message,
            })?;
        }

        tracing::debug!(
            read_model = read_model_name,
            from = stored,
            to = migrations.latest,
            "Migrated read model schema"
        );

        read_model.fields = fields;
        if let Some(metadata) = read_model.metadata.as_mut() {
            metadata.schema_version = migrations.latest;
        }
        Ok(read_model)
    }
}

impl fmt::Debug for VersionedSchemaMigrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, migrations) in &self.read_models {
            map.entry(name, &migrations.latest);
        }
        map.finish()
    }
}

impl SchemaMigrator for VersionedSchemaMigrator {
    fn migrate<'a>(
        &'a self,
        read_model: ReadModel,
        read_model_name: &'a str,
    ) -> BoxFuture<'a, Result<ReadModel, MigrationError>> {
        Box::pin(async move { self.migrate_now(read_model, read_model_name) })
    }

    fn target_schema_version(&self, read_model_name: &str) -> Option<u32> {
        self.read_models
            .get(read_model_name)
            .map(|migrations| migrations.latest)
    }
}
