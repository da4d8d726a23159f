//! Join key resolution: which read model instances does an entity affect?
//!
//! A missing join key is a normal "not applicable" outcome, never an error: the
//! projection is skipped and nothing is fetched, stored or deleted.

use readside_core::config::ProjectionRegistry;
use readside_core::entity::Entity;
use readside_core::projection::ProjectionJoin;
use readside_core::read_model::{ReadModelFilter, ReadModelId, SequenceKey};
use serde_json::Value;

/// The read model instances an entity projects onto.
#[derive(Clone, Debug, PartialEq)]
pub enum JoinKeyResolution {
    /// Known ids, one projection cycle per id
    ById(Vec<ReadModelId>),
    /// Read models matching a filter, looked up in the store
    ByFilter(ReadModelFilter),
}

/// Resolve the join of one projection for an entity.
///
/// - Scalar joins read `entity[field]` and yield one id.
/// - Array joins read `entity[field]` and yield one id per element, in order and
///   without duplicates. A scalar value is accepted as a one-element list.
/// - Filter joins call the registered resolver.
///
/// Returns `None` when the projection does not apply: absent or `null` field,
/// empty array, a scalar join meeting an array value, no usable id, or a filter
/// resolver declining the entity.
#[must_use]
pub fn resolve(entity: &Entity, join: &ProjectionJoin) -> Option<JoinKeyResolution> {
    match join {
        ProjectionJoin::ScalarEntityJoin { field, .. } => {
            let value = field_value(entity, field)?;
            if value.is_array() {
                tracing::warn!(
                    entity = entity.type_name(),
                    entity_id = entity.id(),
                    join_key = %field,
                    "Array value found for a scalar join key, skipping projection"
                );
                return None;
            }
            let id = to_id(entity, field, value)?;
            Some(JoinKeyResolution::ById(vec![id]))
        },
        ProjectionJoin::ArrayEntityJoin { field, .. } => {
            let value = field_value(entity, field)?;
            let ids = match value {
                Value::Array(values) => {
                    let mut ids: Vec<ReadModelId> = Vec::with_capacity(values.len());
                    for value in values {
                        if let Some(id) = to_id(entity, field, value) {
                            if !ids.contains(&id) {
                                ids.push(id);
                            }
                        }
                    }
                    ids
                },
                scalar => to_id(entity, field, scalar).into_iter().collect(),
            };
            if ids.is_empty() {
                tracing::debug!(
                    entity = entity.type_name(),
                    entity_id = entity.id(),
                    join_key = %field,
                    "Array join key is empty, skipping projection"
                );
                return None;
            }
            Some(JoinKeyResolution::ById(ids))
        },
        ProjectionJoin::FilterJoin { resolver, .. } => {
            let filter = resolver(entity);
            if filter.is_none() {
                tracing::debug!(
                    entity = entity.type_name(),
                    entity_id = entity.id(),
                    "Join key resolver returned no filter, skipping projection"
                );
            }
            filter.map(JoinKeyResolution::ByFilter)
        },
    }
}

/// Resolve the sequence key a read model class is partitioned by, if it declares one
/// and the entity carries a value for it.
#[must_use]
pub fn resolve_sequence_key(
    registry: &ProjectionRegistry,
    read_model_name: &str,
    entity: &Entity,
) -> Option<SequenceKey> {
    let field = registry.sequence_key_field(read_model_name)?;
    let value = match entity.field(field)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            tracing::warn!(
                entity = entity.type_name(),
                entity_id = entity.id(),
                sequence_key = field,
                value = %other,
                "Unsupported sequence key value, projecting without sequence key"
            );
            return None;
        },
    };
    Some(SequenceKey::new(field, value))
}

fn field_value<'a>(entity: &'a Entity, field: &str) -> Option<&'a Value> {
    let value = entity.field(field);
    if value.is_none() {
        tracing::debug!(
            entity = entity.type_name(),
            entity_id = entity.id(),
            join_key = field,
            "Join key not present on entity, skipping projection"
        );
    }
    value
}

fn to_id(entity: &Entity, field: &str, value: &Value) -> Option<ReadModelId> {
    let id = ReadModelId::from_json(value);
    if id.is_none() {
        tracing::warn!(
            entity = entity.type_name(),
            entity_id = entity.id(),
            join_key = field,
            value = %value,
            "Join key value is not a valid read model id, ignoring it"
        );
    }
    id
}
