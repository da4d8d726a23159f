//! Read model identification, versioning and document types.
//!
//! A read model is a JSON document made of user-defined fields plus a reserved
//! metadata block (serialized under `boosterMetadata`) that carries the
//! optimistic-concurrency [`Version`], the schema version the document was written
//! with, and provenance about the projection that last touched it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name of the reserved metadata field inside a stored read model document.
pub const METADATA_FIELD: &str = "boosterMetadata";

/// Name of the identifier field inside a read model document.
pub const ID_FIELD: &str = "id";

/// Error type for `ReadModelId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid read model ID: {0}")]
pub struct ParseReadModelIdError(String);

/// Unique identifier of one read model instance within its read model class.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for trusted, application-controlled data)
///
/// # Examples
///
/// ```
/// use readside_core::read_model::ReadModelId;
///
/// let id = ReadModelId::new("cart-1");
/// assert_eq!(id.as_str(), "cart-1");
///
/// let parsed: ReadModelId = "cart-2".parse().unwrap();
/// assert_eq!(parsed, ReadModelId::new("cart-2"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadModelId(String);

impl ReadModelId {
    /// Create a new `ReadModelId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the identifier into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Interpret a JSON value as a read model identifier.
    ///
    /// Strings are taken verbatim and numbers use their decimal rendering. Every
    /// other JSON value (null, booleans, arrays, objects, empty strings) is not an
    /// identifier and yields `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use readside_core::read_model::ReadModelId;
    /// use serde_json::json;
    ///
    /// assert_eq!(ReadModelId::from_json(&json!("c1")), Some(ReadModelId::new("c1")));
    /// assert_eq!(ReadModelId::from_json(&json!(42)), Some(ReadModelId::new("42")));
    /// assert_eq!(ReadModelId::from_json(&json!(true)), None);
    /// ```
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ReadModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReadModelId {
    type Err = ParseReadModelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseReadModelIdError(
                "Read model ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for ReadModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ReadModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ReadModelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Read model version number for optimistic concurrency control.
///
/// A read model that was never stored is at [`Version::INITIAL`] (0). Every
/// successful store writes `expected.next()`, so the first stored version is 1
/// and each later write increments by exactly one.
///
/// # Examples
///
/// ```
/// use readside_core::read_model::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// assert_eq!(Version::new(7).next().value(), 8);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a read model that has never been stored.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Secondary key partitioning a read model id into an ordered sub-series.
///
/// `name` is the field holding the key inside both the entity and the read model,
/// `value` the concrete partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    /// Field name of the sequence key
    pub name: String,
    /// Sequence key value for this partition
    pub value: String,
}

impl SequenceKey {
    /// Create a new sequence key.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Provenance of the projection that produced the current read model state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionInfo {
    /// Id of the entity that was projected
    pub entity_id: String,
    /// Type name of the entity that was projected
    pub entity_name: String,
    /// When the projected entity snapshot was created
    pub entity_updated_at: DateTime<Utc>,
    /// `"<ReadModel>.<method>"` of the projection function
    pub projection_method: String,
}

/// Reserved metadata block stamped on every stored read model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelMetadata {
    /// Optimistic-concurrency token, starts at 1
    pub version: Version,
    /// Schema version the document conforms to
    pub schema_version: u32,
    /// When the document was last written
    pub last_update_at: DateTime<Utc>,
    /// Projection that produced the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_projection_info: Option<ProjectionInfo>,
}

/// A read model document: domain fields plus the reserved metadata block.
///
/// # Examples
///
/// ```
/// use readside_core::read_model::{ReadModel, ReadModelId, Version};
/// use serde_json::json;
///
/// let model = ReadModel::from_json(json!({ "id": "c1", "itemCount": 3 })).unwrap();
/// assert_eq!(model.id(), Some(ReadModelId::new("c1")));
/// assert_eq!(model.version(), Version::INITIAL);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadModel {
    /// Reserved metadata, `None` for a state that was never stored
    #[serde(
        rename = "boosterMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<ReadModelMetadata>,

    /// User-defined fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ReadModel {
    /// Create a read model from its fields, without metadata.
    #[must_use]
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self {
            metadata: None,
            fields,
        }
    }

    /// Build a read model from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the value is not an object or the
    /// `boosterMetadata` block is malformed.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        if !value.is_object() {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "read model must be a JSON object",
            ));
        }
        serde_json::from_value(value)
    }

    /// Build a read model from a typed value.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the value does not serialize to a JSON object.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Self::from_json(serde_json::to_value(value)?)
    }

    /// Convert the whole document (metadata included) into a typed value.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the document does not match `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json()?)
    }

    /// Render the document as JSON, metadata included.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the metadata cannot be serialized.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Identifier stored in the `id` field, if present and valid.
    #[must_use]
    pub fn id(&self) -> Option<ReadModelId> {
        self.fields.get(ID_FIELD).and_then(ReadModelId::from_json)
    }

    /// Stored version, or [`Version::INITIAL`] when the document has no metadata.
    #[must_use]
    pub fn version(&self) -> Version {
        self.metadata
            .as_ref()
            .map_or(Version::INITIAL, |metadata| metadata.version)
    }

    /// Schema version recorded in the metadata block.
    #[must_use]
    pub fn schema_version(&self) -> Option<u32> {
        self.metadata.as_ref().map(|metadata| metadata.schema_version)
    }

    /// Look up a user-defined field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Conjunction of top-level field equalities used to find read models.
///
/// # Examples
///
/// ```
/// use readside_core::read_model::{ReadModel, ReadModelFilter};
/// use serde_json::json;
///
/// let filter = ReadModelFilter::new().eq("cartId", json!("c1"));
/// let model = ReadModel::from_json(json!({ "id": "line-1", "cartId": "c1" })).unwrap();
/// assert!(filter.matches(&model));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadModelFilter {
    conditions: Vec<(String, Value)>,
}

impl ReadModelFilter {
    /// Create a filter that matches every read model.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Require `field` to equal `value`.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push((field.into(), value));
        self
    }

    /// The equality conditions of this filter.
    #[must_use]
    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Whether the filter has no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Check a read model against every condition.
    #[must_use]
    pub fn matches(&self, read_model: &ReadModel) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| read_model.field(field) == Some(expected))
    }

    /// Render the conditions as a JSON object (for containment queries).
    #[must_use]
    pub fn to_json_object(&self) -> Value {
        Value::Object(self.conditions.iter().cloned().collect())
    }
}
