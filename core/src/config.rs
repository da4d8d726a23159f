//! Startup configuration: which projections exist and how read models are keyed.
//!
//! The [`ProjectionRegistry`] is built once at process start and shared immutably
//! (typically as `Arc<ProjectionRegistry>`) with the projection engine. It answers
//! three questions:
//!
//! - Which projections are registered for an entity type?
//! - Does a read model class partition its rows with a sequence key, and which
//!   entity field holds it?
//! - What is the current schema version of a read model class?
//!
//! # Example
//!
//! ```
//! use readside_core::config::{ProjectionRegistry, ReadModelConfig};
//!
//! let registry = ProjectionRegistry::builder()
//!     .read_model(ReadModelConfig::new("CartSummary").schema_version(2))
//!     .read_model(ReadModelConfig::new("PriceTicks").sequence_key("tickedAt"))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(registry.read_model("CartSummary").map(|c| c.schema_version), Some(2));
//! assert!(registry.projections_for("Cart").is_empty());
//! ```

use crate::projection::ProjectionMetadata;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors detected while building the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The same read model class was configured twice.
    #[error("Read model {0} is configured more than once")]
    DuplicateReadModel(String),

    /// A projection writes a read model class that was never configured.
    #[error("Projection {projection} targets unknown read model {read_model_name}")]
    UnknownReadModel {
        /// `"<ReadModel>.<method>"` of the projection
        projection: String,
        /// The unknown read model class
        read_model_name: String,
    },

    /// The same projection was registered twice for one entity type.
    #[error("Projection {projection} is registered more than once for entity {entity_type_name}")]
    DuplicateProjection {
        /// Entity type
        entity_type_name: String,
        /// `"<ReadModel>.<method>"` of the projection
        projection: String,
    },

    /// A field-based join names an empty field.
    #[error("Projection {0} has an empty join key field")]
    EmptyJoinField(String),

    /// The schema migrator upgrades a class to another version than the one new
    /// read models of that class are created at.
    #[error(
        "Read model {read_model_name} is configured at schema version {configured} \
         but migrated to schema version {migrated}"
    )]
    SchemaVersionMismatch {
        /// Read model class
        read_model_name: String,
        /// Schema version in the registry
        configured: u32,
        /// Schema version the migrator targets
        migrated: u32,
    },
}

/// Static configuration of one read model class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadModelConfig {
    /// Read model class name
    pub name: String,
    /// Current schema version, stamped on newly created read models
    pub schema_version: u32,
    /// Entity field holding the sequence key, for sequenced read models
    pub sequence_key_field: Option<String>,
}

impl ReadModelConfig {
    /// Configure a read model class at schema version 1 without a sequence key.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_version: 1,
            sequence_key_field: None,
        }
    }

    /// Set the current schema version.
    #[must_use]
    pub const fn schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Partition rows by the entity field `field`.
    #[must_use]
    pub fn sequence_key(mut self, field: impl Into<String>) -> Self {
        self.sequence_key_field = Some(field.into());
        self
    }
}

/// Immutable registry of read model classes and projections.
#[derive(Debug, Default)]
pub struct ProjectionRegistry {
    read_models: HashMap<String, ReadModelConfig>,
    projections: HashMap<String, Vec<ProjectionMetadata>>,
}

impl ProjectionRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> ProjectionRegistryBuilder {
        ProjectionRegistryBuilder::default()
    }

    /// Projections registered for an entity type, in registration order.
    #[must_use]
    pub fn projections_for(&self, entity_type_name: &str) -> &[ProjectionMetadata] {
        self.projections
            .get(entity_type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Configuration of a read model class.
    #[must_use]
    pub fn read_model(&self, name: &str) -> Option<&ReadModelConfig> {
        self.read_models.get(name)
    }

    /// Every configured read model class, in no particular order.
    pub fn read_models(&self) -> impl Iterator<Item = &ReadModelConfig> {
        self.read_models.values()
    }

    /// Entity field holding the sequence key of a read model class, if any.
    #[must_use]
    pub fn sequence_key_field(&self, read_model_name: &str) -> Option<&str> {
        self.read_models
            .get(read_model_name)
            .and_then(|config| config.sequence_key_field.as_deref())
    }

    /// Current schema version of a read model class (1 if unknown).
    #[must_use]
    pub fn schema_version(&self, read_model_name: &str) -> u32 {
        self.read_models
            .get(read_model_name)
            .map_or(1, |config| config.schema_version)
    }

    /// Number of registered projections across all entity types.
    #[must_use]
    pub fn projection_count(&self) -> usize {
        self.projections.values().map(Vec::len).sum()
    }
}

/// Builder for [`ProjectionRegistry`].
#[derive(Debug, Default)]
pub struct ProjectionRegistryBuilder {
    read_models: Vec<ReadModelConfig>,
    projections: Vec<ProjectionMetadata>,
}

impl ProjectionRegistryBuilder {
    /// Configure a read model class.
    #[must_use]
    pub fn read_model(mut self, config: ReadModelConfig) -> Self {
        self.read_models.push(config);
        self
    }

    /// Register a projection.
    #[must_use]
    pub fn projection(mut self, metadata: ProjectionMetadata) -> Self {
        self.projections.push(metadata);
        self
    }

    /// Validate and build the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on duplicate read models or projections, projections
    /// targeting unconfigured read models, or empty join key fields.
    pub fn build(self) -> Result<ProjectionRegistry, ConfigError> {
        let mut read_models = HashMap::with_capacity(self.read_models.len());
        for config in self.read_models {
            if read_models.contains_key(&config.name) {
                return Err(ConfigError::DuplicateReadModel(config.name));
            }
            read_models.insert(config.name.clone(), config);
        }

        let mut seen = HashSet::new();
        let mut projections: HashMap<String, Vec<ProjectionMetadata>> = HashMap::new();
        for metadata in self.projections {
            let projection = metadata.projection_method();
            if !read_models.contains_key(&metadata.read_model_name) {
                return Err(ConfigError::UnknownReadModel {
                    projection,
                    read_model_name: metadata.read_model_name,
                });
            }
            if metadata.join.field().is_some_and(str::is_empty) {
                return Err(ConfigError::EmptyJoinField(projection));
            }
            if !seen.insert((metadata.entity_type_name.clone(), projection.clone())) {
                return Err(ConfigError::DuplicateProjection {
                    entity_type_name: metadata.entity_type_name,
                    projection,
                });
            }
            projections
                .entry(metadata.entity_type_name.clone())
                .or_default()
                .push(metadata);
        }

        tracing::debug!(
            read_models = read_models.len(),
            projections = seen.len(),
            "Projection registry built"
        );

        Ok(ProjectionRegistry {
            read_models,
            projections,
        })
    }
}
