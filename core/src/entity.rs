//! Entity snapshots consumed by the projection engine.
//!
//! Snapshots are produced by the event-reduction subsystem: one envelope per
//! event applied to an entity. The projection engine consumes each envelope once
//! and never mutates it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while instantiating an entity from its snapshot.
#[derive(Error, Debug)]
pub enum EntityError {
    /// The snapshot value is not a JSON object.
    #[error("Snapshot of {entity_type_name} {entity_id} is not a JSON object")]
    NotAnObject {
        /// Entity type name
        entity_type_name: String,
        /// Entity id
        entity_id: String,
    },
}

/// The reduced state of one entity after applying one event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshotEnvelope {
    /// Entity type name, used to look up registered projections
    pub entity_type_name: String,
    /// Entity instance id
    #[serde(rename = "entityID")]
    pub entity_id: String,
    /// The entity's field data
    pub value: Value,
    /// When the snapshot was created
    pub created_at: DateTime<Utc>,
    /// Monotonic entity version
    pub version: u64,
    /// Request that caused the event
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// When the snapshot was persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshotted_at: Option<DateTime<Utc>>,
}

impl EntitySnapshotEnvelope {
    /// Create an envelope with the required attributes.
    #[must_use]
    pub fn new(
        entity_type_name: impl Into<String>,
        entity_id: impl Into<String>,
        value: Value,
        created_at: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            entity_type_name: entity_type_name.into(),
            entity_id: entity_id.into(),
            value,
            created_at,
            version,
            request_id: None,
            snapshotted_at: None,
        }
    }

    /// Attach the id of the request that caused this snapshot.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Instantiate the entity carried by this snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotAnObject`] if the snapshot value is not a JSON object.
    pub fn instantiate(&self) -> Result<Entity, EntityError> {
        match &self.value {
            Value::Object(fields) => Ok(Entity {
                type_name: self.entity_type_name.clone(),
                id: self.entity_id.clone(),
                updated_at: self.created_at,
                fields: fields.clone(),
            }),
            _ => Err(EntityError::NotAnObject {
                entity_type_name: self.entity_type_name.clone(),
                entity_id: self.entity_id.clone(),
            }),
        }
    }
}

/// An entity instance rebuilt from a snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    type_name: String,
    id: String,
    updated_at: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl Entity {
    /// Entity type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Entity id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time of the snapshot this entity was built from.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Field data.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up a field, treating JSON `null` as absent.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    /// Deserialize the entity's fields into a typed value.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the fields do not match `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}
