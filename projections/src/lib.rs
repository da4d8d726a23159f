//! Read-model projection engine for readside.
//!
//! # Overview
//!
//! This crate turns entity snapshots into read model writes:
//! - **Join keys** ([`join_key`]): which read model instances an entity affects
//! - **Invocation** ([`invoker`]): calling projection functions, routing their errors
//! - **Writing** ([`writer`]): stamping `boosterMetadata` and conditional stores
//! - **Retries** ([`retry`]): re-fetching and re-projecting on version conflicts
//! - **Orchestration** ([`orchestrator`]): concurrent fan-out with isolated failures
//! - **`PostgreSQL`** ([`postgres`]): a [`ReadModelStore`] with JSONB documents
//!
//! # CQRS Separation
//!
//! Read models usually live in their own database:
//!
//! ```text
//! Event Store DB (Write)  →  Entity Snapshots  →  Read Model DB (Read)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use readside_projections::ProjectionOrchestrator;
//!
//! let orchestrator = ProjectionOrchestrator::builder(registry, Arc::new(store))
//!     .migrator(Arc::new(migrator))
//!     .build()?;
//!
//! let report = orchestrator.project(&snapshot).await?;
//! for failure in report.failures() {
//!     tracing::error!(read_model = %failure.read_model_name, "projection failed");
//! }
//! ```
//!
//! [`ReadModelStore`]: readside_core::store::ReadModelStore

pub mod error;
pub mod invoker;
pub mod join_key;
pub mod metrics;
pub mod orchestrator;
pub mod postgres;
pub mod retry;
pub mod writer;

// Re-export main types for convenience
pub use error::{ProjectionError, Result};
pub use orchestrator::{
    ProjectionOrchestrator, ProjectionOrchestratorBuilder, ProjectionReport, TargetReport,
};
pub use postgres::PostgresReadModelStore;
pub use retry::{RetryPolicy, TargetOutcome};
