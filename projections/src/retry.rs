//! Optimistic-concurrency retries for one read model target.
//!
//! A target is one `(read model class, id, sequence key)` row. Its projection cycle
//! is an explicit state machine:
//!
//! ```text
//! Fetching ──▶ Migrating ──▶ Projecting ──▶ Storing ──▶ Done
//!    ▲  │                        ▲             │
//!    │  └── (no row) ────────────┘             │
//!    └──────────── version conflict ───────────┘
//! ```
//!
//! A version conflict sends the cycle back to `Fetching`, so the projection function
//! always runs against the row as it is *now*. Reusing the stale row would silently
//! lose the concurrent update. Every other error ends the cycle immediately.
//!
//! # Example
//!
//! ```rust
//! use readside_projections::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_secs(1))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
//! ```

use crate::error::{ProjectionError, Result};
use crate::invoker::{Invocation, ProjectionInvoker};
use crate::metrics;
use crate::writer::{ReadModelWriter, WriteRequest, WriteResult};
use readside_core::entity::Entity;
use readside_core::migration::SchemaMigrator;
use readside_core::projection::{ProjectionMetadata, ProjectionOutcome};
use readside_core::read_model::{ReadModel, ReadModelId, SequenceKey};
use readside_core::store::{ReadModelStore, ReadModelStoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Attempts per target before a conflict becomes fatal.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Retry policy for optimistic concurrency conflicts.
///
/// # Default Values
///
/// - `max_attempts`: 5 (the first attempt included)
/// - `initial_delay`: 0 (retry immediately)
/// - `max_delay`: 1 second
/// - `multiplier`: 2.0
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Calculate the delay before retry number `retry` (0-based).
    ///
    /// Uses exponential backoff: delay = `initial_delay` * (multiplier ^ retry),
    /// capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        if retry == 0 || self.initial_delay.is_zero() {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of attempts (at least 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// The row one projection cycle works on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionTarget {
    /// Read model id, `None` for a filter join creating its first instance
    pub id: Option<ReadModelId>,
    /// Sequence key, for sequenced read model classes
    pub sequence_key: Option<SequenceKey>,
}

/// Final state of one target.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetOutcome {
    /// The new state was stored
    Stored(ReadModel),
    /// The read model was deleted
    Deleted,
    /// The projection asked for no change
    Unchanged,
    /// The projection function failed, the error was suppressed and the row left untouched
    ErrorSuppressed,
}

impl TargetOutcome {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Stored(_) => "stored",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::ErrorSuppressed => "error_suppressed",
        }
    }
}

impl From<WriteResult> for TargetOutcome {
    fn from(result: WriteResult) -> Self {
        match result {
            WriteResult::Stored(read_model) => Self::Stored(read_model),
            WriteResult::Deleted => Self::Deleted,
            WriteResult::Unchanged => Self::Unchanged,
        }
    }
}

/// Result of a completed cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    /// What happened to the row
    pub outcome: TargetOutcome,
    /// Attempts performed (1 when no conflict occurred)
    pub attempts: usize,
}

enum CycleState {
    Fetching,
    Migrating(ReadModel),
    Projecting(Option<ReadModel>),
    Storing {
        existing: Option<ReadModel>,
        outcome: ProjectionOutcome<ReadModel>,
    },
    Done(TargetOutcome),
}

/// Runs fetch → migrate → project → store cycles with conflict retries.
#[derive(Clone)]
pub struct RetryCoordinator {
    store: Arc<dyn ReadModelStore>,
    migrator: Arc<dyn SchemaMigrator>,
    invoker: ProjectionInvoker,
    writer: ReadModelWriter,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        migrator: Arc<dyn SchemaMigrator>,
        invoker: ProjectionInvoker,
        writer: ReadModelWriter,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            migrator,
            invoker,
            writer,
            policy,
        }
    }

    /// The retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the projection cycle of `metadata` for one target until it is done.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::RetriesExhausted`] if every attempt conflicted
    /// - [`ProjectionError::Store`] for any other persistence failure (not retried),
    ///   including [`ReadModelStoreError::MultipleObjectsFound`]
    /// - [`ProjectionError::Migration`] if the stored read model cannot be migrated
    /// - [`ProjectionError::ProjectionFunction`] if the projection failed and was rethrown
    /// - [`ProjectionError::MissingReadModelId`] if the new state cannot be addressed
    pub async fn run(
        &self,
        metadata: &ProjectionMetadata,
        entity: &Entity,
        target: ProjectionTarget,
    ) -> Result<CycleReport> {
        let (attempts, result) = self.run_settled(metadata, entity, target).await;
        result.map(|outcome| CycleReport { outcome, attempts })
    }

    /// Like [`RetryCoordinator::run`], but reports the attempts performed whether the
    /// cycle succeeded or not.
    #[tracing::instrument(
        skip_all,
        name = "projection_cycle",
        fields(
            read_model = %metadata.read_model_name,
            id = ?target.id,
            sequence_key = ?target.sequence_key,
        )
    )]
    pub async fn run_settled(
        &self,
        metadata: &ProjectionMetadata,
        entity: &Entity,
        target: ProjectionTarget,
    ) -> (usize, Result<TargetOutcome>) {
        let mut attempt = 1;
        let result = self.cycle(metadata, entity, target, &mut attempt).await;
        if result.is_ok() && attempt > 1 {
            tracing::info!(attempt, "Projection succeeded after retry");
        }
        (attempt, result)
    }

    async fn cycle(
        &self,
        metadata: &ProjectionMetadata,
        entity: &Entity,
        target: ProjectionTarget,
        attempt: &mut usize,
    ) -> Result<TargetOutcome> {
        let read_model_name = metadata.read_model_name.as_str();
        let sequence_key = target.sequence_key.as_ref();
        let mut target_id = target.id;
        let mut state = CycleState::Fetching;

        loop {
            state = match state {
                CycleState::Fetching => match &target_id {
                    Some(id) => match self.store.fetch(read_model_name, id, sequence_key).await? {
                        Some(read_model) => CycleState::Migrating(read_model),
                        None => CycleState::Projecting(None),
                    },
                    None => CycleState::Projecting(None),
                },
                CycleState::Migrating(read_model) => CycleState::Projecting(Some(
                    self.migrator.migrate(read_model, read_model_name).await?,
                )),
                CycleState::Projecting(existing) => match self
                    .invoker
                    .invoke(metadata, entity, existing.as_ref(), target_id.as_ref())
                    .await?
                {
                    Invocation::Outcome(outcome) => CycleState::Storing { existing, outcome },
                    Invocation::Suppressed => CycleState::Done(TargetOutcome::ErrorSuppressed),
                },
                CycleState::Storing { existing, outcome } => {
                    let produced_id = match &outcome {
                        ProjectionOutcome::Updated(state) => state.id(),
                        ProjectionOutcome::Deleted | ProjectionOutcome::Unchanged => None,
                    };
                    let request = WriteRequest {
                        metadata,
                        entity,
                        existing: existing.as_ref(),
                        target_id: target_id.as_ref(),
                        sequence_key,
                    };
                    match self.writer.write(request, outcome).await {
                        Ok(result) => CycleState::Done(result.into()),
                        Err(ProjectionError::Store(conflict)) if conflict.is_concurrency_conflict() => {
                            self.on_conflict(read_model_name, target_id.as_ref(), *attempt, conflict)
                                .await?;
                            if target_id.is_none() {
                                target_id = produced_id;
                            }
                            *attempt += 1;
                            CycleState::Fetching
                        },
                        Err(error) => return Err(error),
                    }
                },
                CycleState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    async fn on_conflict(
        &self,
        read_model_name: &str,
        id: Option<&ReadModelId>,
        attempt: usize,
        conflict: ReadModelStoreError,
    ) -> Result<()> {
        metrics::record_conflict(read_model_name);

        if attempt >= self.policy.max_attempts {
            tracing::error!(
                attempt,
                error = %conflict,
                "Projection failed after max attempts"
            );
            metrics::record_retries_exhausted(read_model_name);
            return Err(ProjectionError::RetriesExhausted {
                read_model_name: read_model_name.to_string(),
                id: id.map_or_else(|| "<new>".to_string(), ToString::to_string),
                attempts: attempt,
                source: conflict,
            });
        }

        let delay = self.policy.delay_for_attempt(attempt - 1);
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis(),
            error = %conflict,
            "Read model changed concurrently, re-fetching and retrying..."
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
