//! # Readside Core
//!
//! Core types and collaborator traits for the readside read-model projection engine.
//!
//! Domain state changes are captured as immutable events, entities are rebuilt by
//! reducing those events, and read models are materialized views derived from entity
//! snapshots. This crate holds everything the projection engine needs to know about
//! that world without depending on any particular storage backend.
//!
//! ## Core Concepts
//!
//! - **Entity snapshot**: The reduced state of one entity after one event
//!   ([`entity::EntitySnapshotEnvelope`])
//! - **Read model**: A denormalized view with a reserved metadata block carrying the
//!   optimistic-concurrency version ([`read_model::ReadModel`])
//! - **Projection**: A registered function mapping an entity (and the prior read model
//!   state) to a new state, a deletion, or nothing ([`projection`])
//! - **Registry**: The immutable startup configuration binding entities to read models
//!   ([`config::ProjectionRegistry`])
//!
//! ## Collaborators
//!
//! The engine talks to the outside world only through traits:
//!
//! - [`store::ReadModelStore`]: fetch/search/store/delete with conditional writes
//! - [`migration::SchemaMigrator`]: upgrade stored read models to the latest schema
//! - [`error_handler::GlobalErrorHandler`]: decide the fate of projection function errors
//! - [`environment::Clock`]: time source for `lastUpdateAt`
//!
//! ## Example
//!
//! ```ignore
//! use readside_core::config::{ProjectionRegistry, ReadModelConfig};
//! use readside_core::projection::{self, ProjectionMetadata, ProjectionOutcome};
//!
//! let registry = ProjectionRegistry::builder()
//!     .read_model(ReadModelConfig::new("CartSummary"))
//!     .projection(ProjectionMetadata::scalar(
//!         "Cart",
//!         "CartSummary",
//!         "from_cart",
//!         "id",
//!         projection::scalar(|cart: Cart, _existing: Option<CartSummary>| async move {
//!             Ok(ProjectionOutcome::Updated(CartSummary::from(cart)))
//!         }),
//!     ))
//!     .build()?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod config;
pub mod entity;
pub mod error_handler;
pub mod migration;
pub mod projection;
pub mod read_model;
pub mod store;

/// Boxed, sendable future used by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Environment module - Dependency injection traits
///
/// All external dependencies that are not persistence-related are abstracted
/// behind traits here so tests can substitute deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use readside_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
