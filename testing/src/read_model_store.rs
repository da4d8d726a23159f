//! In-memory read model store for testing the projection engine.
//!
//! Provides fast, deterministic persistence with:
//! - The same conditional-write contract as the production stores
//! - A log of every call, for asserting what the engine did (and did not do)
//! - Failure injection: version conflicts, concurrent writers, storage errors

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use readside_core::read_model::{ReadModel, ReadModelFilter, ReadModelId, SequenceKey, Version};
use readside_core::store::{ReadModelStore, ReadModelStoreError, Result};
use readside_core::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// `(read model name, id, sequence value)`; the sequence value is empty when unsequenced.
type RowKey = (String, ReadModelId, String);

/// One call made against an [`InMemoryReadModelStore`].
#[derive(Clone, Debug, PartialEq)]
pub enum StoreCall {
    /// `fetch`
    Fetch {
        /// Read model class
        read_model_name: String,
        /// Requested id
        id: ReadModelId,
        /// Requested sequence key
        sequence_key: Option<SequenceKey>,
    },
    /// `search`
    Search {
        /// Read model class
        read_model_name: String,
        /// Filter used
        filter: ReadModelFilter,
    },
    /// `store`, recorded whether or not it succeeded
    Store {
        /// Read model class
        read_model_name: String,
        /// Id of the written read model
        id: ReadModelId,
        /// Sequence key of the row
        sequence_key: Option<SequenceKey>,
        /// Version the write was conditioned on
        expected_version: Version,
        /// Version carried by the written read model
        version: Version,
    },
    /// `delete`
    Delete {
        /// Read model class
        read_model_name: String,
        /// Id of the deleted read model
        id: ReadModelId,
        /// Sequence key of the row
        sequence_key: Option<SequenceKey>,
        /// The read model handed to `delete`
        read_model: ReadModel,
    },
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<RowKey, ReadModel>,
    calls: Vec<StoreCall>,
    injected_conflicts: usize,
    injected_conflicts_by_id: HashMap<ReadModelId, usize>,
    concurrent_writes: usize,
    failing_ids: HashSet<ReadModelId>,
}

/// In-memory [`ReadModelStore`] for fast, deterministic testing.
///
/// Clones share the same rows and call log, so a test can keep one handle for
/// assertions and give another to the engine.
///
/// # Example
///
/// ```
/// use readside_core::read_model::{ReadModel, ReadModelId, Version};
/// use readside_core::store::ReadModelStore;
/// use readside_testing::InMemoryReadModelStore;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryReadModelStore::new();
/// let cart = ReadModel::from_json(json!({ "id": "c1" }))?;
///
/// store.store("CartSummary", &cart, None, Version::INITIAL).await?;
///
/// let fetched = store.fetch("CartSummary", &ReadModelId::new("c1"), None).await?;
/// assert!(fetched.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReadModelStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryReadModelStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a read model in place without going through the version check.
    pub fn insert(&self, read_model_name: &str, read_model: ReadModel) {
        let id = read_model.id().unwrap();
        self.inner
            .write()
            .unwrap()
            .rows
            .insert((read_model_name.to_string(), id, String::new()), read_model);
    }

    /// Put a sequenced read model in place without going through the version check.
    pub fn insert_sequenced(
        &self,
        read_model_name: &str,
        sequence_key: &SequenceKey,
        read_model: ReadModel,
    ) {
        let id = read_model.id().unwrap();
        self.inner.write().unwrap().rows.insert(
            (read_model_name.to_string(), id, sequence_key.value.clone()),
            read_model,
        );
    }

    /// Get an unsequenced read model.
    #[must_use]
    pub fn get(&self, read_model_name: &str, id: &ReadModelId) -> Option<ReadModel> {
        self.row(key(read_model_name, id, None))
    }

    /// Get a sequenced read model.
    #[must_use]
    pub fn get_sequenced(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: &SequenceKey,
    ) -> Option<ReadModel> {
        self.row(key(read_model_name, id, Some(sequence_key)))
    }

    /// All read models of a class, ordered by id then sequence value.
    #[must_use]
    pub fn all(&self, read_model_name: &str) -> Vec<ReadModel> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .filter(|((name, _, _), _)| name == read_model_name)
            .map(|(_, read_model)| read_model.clone())
            .collect()
    }

    /// Number of stored rows, all classes included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().rows.len()
    }

    /// Check if the store holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().rows.is_empty()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.read().unwrap().calls.clone()
    }

    /// Forget recorded calls, keeping the rows.
    pub fn clear_calls(&self) {
        self.inner.write().unwrap().calls.clear();
    }

    /// Number of `fetch` calls.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.count(|call| matches!(call, StoreCall::Fetch { .. }))
    }

    /// Number of `search` calls.
    #[must_use]
    pub fn search_count(&self) -> usize {
        self.count(|call| matches!(call, StoreCall::Search { .. }))
    }

    /// Number of `store` calls, failed ones included.
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.count(|call| matches!(call, StoreCall::Store { .. }))
    }

    /// Number of `delete` calls.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(|call| matches!(call, StoreCall::Delete { .. }))
    }

    /// Reject the next `n` stores with a version conflict, without writing anything.
    pub fn fail_next_stores_with_conflict(&self, n: usize) {
        self.inner.write().unwrap().injected_conflicts = n;
    }

    /// Reject the next `n` stores of `id` only with a version conflict.
    pub fn fail_next_stores_with_conflict_for(&self, id: ReadModelId, n: usize) {
        self.inner
            .write()
            .unwrap()
            .injected_conflicts_by_id
            .insert(id, n);
    }

    /// Let a concurrent writer win the race on the next `n` stores.
    ///
    /// The incoming read model is written as if another process had stored it first,
    /// and the store reports a version conflict. A retry that re-fetches sees the
    /// concurrent write.
    pub fn simulate_concurrent_writes(&self, n: usize) {
        self.inner.write().unwrap().concurrent_writes = n;
    }

    /// Fail every store and delete of `id` with a storage error.
    ///
    /// Injected conflicts are reported first, so a target can conflict before failing.
    pub fn fail_stores_for(&self, id: ReadModelId) {
        self.inner.write().unwrap().failing_ids.insert(id);
    }

    fn row(&self, key: RowKey) -> Option<ReadModel> {
        self.inner.read().unwrap().rows.get(&key).cloned()
    }

    fn count(&self, predicate: impl Fn(&StoreCall) -> bool) -> usize {
        self.inner
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    fn fetch_now(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<Option<ReadModel>> {
        let mut inner = self.inner.write().unwrap();
        inner.calls.push(StoreCall::Fetch {
            read_model_name: read_model_name.to_string(),
            id: id.clone(),
            sequence_key: sequence_key.cloned(),
        });

        if sequence_key.is_some() {
            return Ok(inner.rows.get(&key(read_model_name, id, sequence_key)).cloned());
        }

        let mut found: Vec<&ReadModel> = inner
            .rows
            .iter()
            .filter(|((name, row_id, _), _)| name == read_model_name && row_id == id)
            .map(|(_, read_model)| read_model)
            .collect();
        if found.len() > 1 {
            return Err(ReadModelStoreError::MultipleObjectsFound {
                read_model_name: read_model_name.to_string(),
                id: id.clone(),
                count: found.len(),
            });
        }
        Ok(found.pop().cloned())
    }

    fn search_now(&self, read_model_name: &str, filter: &ReadModelFilter) -> Vec<ReadModel> {
        let mut inner = self.inner.write().unwrap();
        inner.calls.push(StoreCall::Search {
            read_model_name: read_model_name.to_string(),
            filter: filter.clone(),
        });
        inner
            .rows
            .iter()
            .filter(|((name, _, _), read_model)| name == read_model_name && filter.matches(read_model))
            .map(|(_, read_model)| read_model.clone())
            .collect()
    }

    fn store_now(
        &self,
        read_model_name: &str,
        read_model: &ReadModel,
        sequence_key: Option<&SequenceKey>,
        expected_version: Version,
    ) -> Result<()> {
        let id = read_model.id().ok_or_else(|| ReadModelStoreError::MissingId {
            read_model_name: read_model_name.to_string(),
        })?;
        let mut inner = self.inner.write().unwrap();
        inner.calls.push(StoreCall::Store {
            read_model_name: read_model_name.to_string(),
            id: id.clone(),
            sequence_key: sequence_key.cloned(),
            expected_version,
            version: read_model.version(),
        });

        let conflict = || ReadModelStoreError::OptimisticConcurrencyUnexpectedVersion {
            read_model_name: read_model_name.to_string(),
            id: id.clone(),
            expected: expected_version,
        };
        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            return Err(conflict());
        }
        if let Some(remaining) = inner.injected_conflicts_by_id.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(conflict());
            }
        }
        if inner.failing_ids.contains(&id) {
            return Err(ReadModelStoreError::Storage(format!(
                "injected failure storing {read_model_name} {id}"
            )));
        }

        let key = key(read_model_name, &id, sequence_key);
        let current = inner
            .rows
            .get(&key)
            .map_or(Version::INITIAL, ReadModel::version);
        if current != expected_version {
            return Err(conflict());
        }

        inner.rows.insert(key, read_model.clone());
        if inner.concurrent_writes > 0 {
            inner.concurrent_writes -= 1;
            return Err(conflict());
        }
        Ok(())
    }

    fn delete_now(
        &self,
        read_model_name: &str,
        read_model: &ReadModel,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<()> {
        let id = read_model.id().ok_or_else(|| ReadModelStoreError::MissingId {
            read_model_name: read_model_name.to_string(),
        })?;
        let mut inner = self.inner.write().unwrap();
        inner.calls.push(StoreCall::Delete {
            read_model_name: read_model_name.to_string(),
            id: id.clone(),
            sequence_key: sequence_key.cloned(),
            read_model: read_model.clone(),
        });

        if inner.failing_ids.contains(&id) {
            return Err(ReadModelStoreError::Storage(format!(
                "injected failure deleting {read_model_name} {id}"
            )));
        }
        inner.rows.remove(&key(read_model_name, &id, sequence_key));
        Ok(())
    }
}

fn key(read_model_name: &str, id: &ReadModelId, sequence_key: Option<&SequenceKey>) -> RowKey {
    (
        read_model_name.to_string(),
        id.clone(),
        sequence_key.map(|key| key.value.clone()).unwrap_or_default(),
    )
}

impl ReadModelStore for InMemoryReadModelStore {
    fn fetch<'a>(
        &'a self,
        read_model_name: &'a str,
        id: &'a ReadModelId,
        sequence_key: Option<&'a SequenceKey>,
    ) -> BoxFuture<'a, Result<Option<ReadModel>>> {
        Box::pin(async move { self.fetch_now(read_model_name, id, sequence_key) })
    }

    fn search<'a>(
        &'a self,
        read_model_name: &'a str,
        filter: &'a ReadModelFilter,
    ) -> BoxFuture<'a, Result<Vec<ReadModel>>> {
        Box::pin(async move { Ok(self.search_now(read_model_name, filter)) })
    }

    fn store<'a>(
        &'a self,
        read_model_name: &'a str,
        read_model: &'a ReadModel,
        sequence_key: Option<&'a SequenceKey>,
        expected_version: Version,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.store_now(read_model_name, read_model, sequence_key, expected_version)
        })
    }

    fn delete<'a>(
        &'a self,
        read_model_name: &'a str,
        read_model: &'a ReadModel,
        sequence_key: Option<&'a SequenceKey>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.delete_now(read_model_name, read_model, sequence_key) })
    }
}
