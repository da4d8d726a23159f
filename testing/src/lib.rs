//! # Readside Testing
//!
//! Testing utilities for the readside projection engine.
//!
//! This crate provides:
//! - [`InMemoryReadModelStore`]: deterministic persistence with call recording and
//!   failure injection
//! - [`FixedClock`]: deterministic `lastUpdateAt` stamps
//! - [`RecordingErrorHandler`]: a global error handler that remembers what it saw
//! - [`fixtures`]: snapshot and read model builders
//!
//! ## Example
//!
//! ```ignore
//! use readside_testing::{fixtures, test_clock, InMemoryReadModelStore};
//!
//! #[tokio::test]
//! async fn test_cart_summary() {
//!     let store = InMemoryReadModelStore::new();
//!     let orchestrator = ProjectionOrchestrator::builder(registry(), Arc::new(store.clone()))
//!         .clock(Arc::new(test_clock()))
//!         .build()
//!         .unwrap();
//!
//!     orchestrator
//!         .project(&fixtures::snapshot("Cart", "c1", json!({ "id": "c1" })))
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(store.store_count(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use readside_core::environment::Clock;

pub mod read_model_store;

/// Mock implementations of environment and collaborator traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use readside_core::entity::Entity;
    use readside_core::error_handler::GlobalErrorHandler;
    use readside_core::projection::ProjectionFnError;
    use readside_core::read_model::ReadModel;
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use readside_testing::mocks::FixedClock;
    /// use readside_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Default for FixedClock {
        fn default() -> Self {
            test_clock()
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// One error seen by a [`RecordingErrorHandler`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedError {
        /// Error message
        pub message: String,
        /// Entity being projected
        pub entity_id: String,
        /// Whether an existing read model was passed along
        pub had_existing: bool,
    }

    /// Global error handler recording every projection error.
    ///
    /// Either suppresses or rethrows, depending on how it was built.
    #[derive(Debug, Clone)]
    pub struct RecordingErrorHandler {
        suppress: bool,
        seen: Arc<Mutex<Vec<RecordedError>>>,
    }

    impl RecordingErrorHandler {
        /// A handler suppressing every error.
        #[must_use]
        pub fn suppressing() -> Self {
            Self {
                suppress: true,
                seen: Arc::default(),
            }
        }

        /// A handler rethrowing every error.
        #[must_use]
        pub fn rethrowing() -> Self {
            Self {
                suppress: false,
                seen: Arc::default(),
            }
        }

        /// Errors seen so far, in order.
        #[must_use]
        #[allow(clippy::unwrap_used)]
        pub fn errors(&self) -> Vec<RecordedError> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl GlobalErrorHandler for RecordingErrorHandler {
        #[allow(clippy::unwrap_used)]
        fn on_projection_error(
            &self,
            error: ProjectionFnError,
            entity: &Entity,
            existing: Option<&ReadModel>,
        ) -> Option<ProjectionFnError> {
            self.seen.lock().unwrap().push(RecordedError {
                message: error.message().to_string(),
                entity_id: entity.id().to_string(),
                had_existing: existing.is_some(),
            });
            (!self.suppress).then_some(error)
        }
    }
}

/// Snapshot and read model builders.
pub mod fixtures {
    use super::mocks::test_clock;
    use readside_core::entity::EntitySnapshotEnvelope;
    use readside_core::environment::Clock;
    use readside_core::read_model::{ReadModel, ReadModelMetadata, Version};
    use serde_json::Value;

    /// A snapshot at entity version 1, created at the [`test_clock`] time.
    #[must_use]
    pub fn snapshot(entity_type_name: &str, entity_id: &str, value: Value) -> EntitySnapshotEnvelope {
        EntitySnapshotEnvelope::new(entity_type_name, entity_id, value, test_clock().now(), 1)
    }

    /// A stored read model carrying the given version and schema version.
    ///
    /// # Panics
    ///
    /// Panics if `fields` is not a JSON object.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn stored_read_model(fields: Value, version: u64, schema_version: u32) -> ReadModel {
        let mut read_model =
            ReadModel::from_json(fields).expect("read model fixtures must be JSON objects");
        read_model.metadata = Some(ReadModelMetadata {
            version: Version::new(version),
            schema_version,
            last_update_at: test_clock().now(),
            last_projection_info: None,
        });
        read_model
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, RecordedError, RecordingErrorHandler, test_clock};
pub use read_model_store::{InMemoryReadModelStore, StoreCall};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
