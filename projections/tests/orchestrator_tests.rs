//! End-to-end tests of the projection engine against the in-memory store.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use proptest::prelude::*;
use readside_core::config::{ConfigError, ProjectionRegistry, ReadModelConfig};
use readside_core::entity::{Entity, EntitySnapshotEnvelope};
use readside_core::environment::Clock;
use readside_core::migration::VersionedSchemaMigrator;
use readside_core::projection::{self, ProjectionFnError, ProjectionMetadata, ProjectionOutcome};
use readside_core::read_model::{ReadModelFilter, ReadModelId, SequenceKey, Version};
use readside_core::store::ReadModelStoreError;
use readside_projections::{
    ProjectionError, ProjectionOrchestrator, ProjectionReport, RetryPolicy, TargetOutcome,
};
use readside_testing::fixtures::{snapshot, stored_read_model};
use readside_testing::{test_clock, InMemoryReadModelStore, RecordingErrorHandler, StoreCall};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Cart {
    id: String,
    item_count: u32,
    tags: Vec<String>,
    store_id: Option<String>,
    ticked_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartSummary {
    id: String,
    item_count: u32,
    projections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagUsage {
    id: String,
    carts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartLine {
    id: String,
    cart_id: String,
    item_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineTick {
    id: String,
    cart_id: String,
    hits: u32,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn cart_summary_projection() -> ProjectionMetadata {
    ProjectionMetadata::scalar(
        "Cart",
        "CartSummary",
        "from_cart",
        "id",
        projection::scalar(|cart: Cart, existing: Option<CartSummary>| async move {
            let projections = existing.map_or(0, |summary| summary.projections);
            Ok(ProjectionOutcome::Updated(CartSummary {
                id: cart.id,
                item_count: cart.item_count,
                projections: projections + 1,
            }))
        }),
    )
}

fn tag_usage_projection() -> ProjectionMetadata {
    ProjectionMetadata::array(
        "Cart",
        "TagUsage",
        "from_cart",
        "tags",
        projection::array(
            |_: Cart, id: ReadModelId, existing: Option<TagUsage>| async move {
                let carts = existing.map_or(0, |usage| usage.carts);
                Ok(ProjectionOutcome::Updated(TagUsage {
                    id: id.into_inner(),
                    carts: carts + 1,
                }))
            },
        ),
    )
}

fn registry_with(projections: Vec<ProjectionMetadata>) -> ProjectionRegistry {
    projections.into_iter().fold(
        ProjectionRegistry::builder()
            .read_model(ReadModelConfig::new("CartSummary"))
            .read_model(ReadModelConfig::new("TagUsage"))
            .read_model(ReadModelConfig::new("CartLine"))
            .read_model(ReadModelConfig::new("StoreTotals"))
            .read_model(ReadModelConfig::new("CartTicks").sequence_key("tickedAt"))
            .read_model(ReadModelConfig::new("LineTicks").sequence_key("tickedAt")),
        |builder, metadata| builder.projection(metadata),
    )
    .build()
    .expect("test registry should be valid")
}

fn orchestrator(store: &InMemoryReadModelStore, projections: Vec<ProjectionMetadata>) -> ProjectionOrchestrator {
    ProjectionOrchestrator::builder(registry_with(projections), Arc::new(store.clone()))
        .clock(Arc::new(test_clock()))
        .build()
        .expect("test orchestrator should be valid")
}

fn cart(value: serde_json::Value) -> EntitySnapshotEnvelope {
    let id = value["id"].as_str().unwrap_or("c1").to_string();
    snapshot("Cart", &id, value)
}

fn single_outcome(report: &ProjectionReport) -> &TargetOutcome {
    assert_eq!(report.targets.len(), 1, "expected exactly one target: {report:?}");
    report.targets[0].result.as_ref().expect("target should succeed")
}

#[tokio::test]
async fn test_new_cart_creates_summary_at_version_one() {
    init_tracing();
    let store = InMemoryReadModelStore::new();
    let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 3 })))
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(matches!(single_outcome(&report), TargetOutcome::Stored(_)));
    assert_eq!(report.targets[0].attempts, 1);

    let id = ReadModelId::new("c1");
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::Fetch {
                read_model_name: "CartSummary".to_string(),
                id: id.clone(),
                sequence_key: None,
            },
            StoreCall::Store {
                read_model_name: "CartSummary".to_string(),
                id: id.clone(),
                sequence_key: None,
                expected_version: Version::INITIAL,
                version: Version::new(1),
            },
        ]
    );

    let stored = store.get("CartSummary", &id).unwrap();
    assert_eq!(stored.field("itemCount"), Some(&json!(3)));
    let metadata = stored.metadata.unwrap();
    assert_eq!(metadata.version, Version::new(1));
    assert_eq!(metadata.schema_version, 1);
    assert_eq!(metadata.last_update_at, test_clock().now());
    let info = metadata.last_projection_info.unwrap();
    assert_eq!(info.projection_method, "CartSummary.from_cart");
    assert_eq!(info.entity_name, "Cart");
    assert_eq!(info.entity_id, "c1");
}

#[tokio::test]
async fn test_existing_summary_is_replaced_at_next_version() {
    let store = InMemoryReadModelStore::new();
    store.insert(
        "CartSummary",
        stored_read_model(json!({ "id": "c1", "itemCount": 1, "projections": 4 }), 7, 1),
    );
    let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);

    orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 3 })))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(store.calls().contains(&StoreCall::Store {
        read_model_name: "CartSummary".to_string(),
        id: ReadModelId::new("c1"),
        sequence_key: None,
        expected_version: Version::new(7),
        version: Version::new(8),
    }));
    let stored = store.get("CartSummary", &ReadModelId::new("c1")).unwrap();
    assert_eq!(stored.field("projections"), Some(&json!(5)));
    assert_eq!(stored.version(), Version::new(8));
}

#[tokio::test]
async fn test_array_join_key_fans_out_to_each_tag() {
    let store = InMemoryReadModelStore::new();
    let orchestrator = orchestrator(&store, vec![tag_usage_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "tags": ["x", "y"] })))
        .await
        .unwrap();

    assert_eq!(report.targets.len(), 2);
    assert!(report.is_success());
    for tag in ["x", "y"] {
        let id = ReadModelId::new(tag);
        assert!(store.calls().contains(&StoreCall::Store {
            read_model_name: "TagUsage".to_string(),
            id: id.clone(),
            sequence_key: None,
            expected_version: Version::INITIAL,
            version: Version::new(1),
        }));
        assert_eq!(store.get("TagUsage", &id).unwrap().field("carts"), Some(&json!(1)));
    }
}

#[tokio::test]
async fn test_conflict_on_one_tag_does_not_retry_the_other() {
    let store = InMemoryReadModelStore::new();
    store.fail_next_stores_with_conflict_for(ReadModelId::new("x"), 2);
    let orchestrator = orchestrator(&store, vec![tag_usage_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "tags": ["x", "y"] })))
        .await
        .unwrap();

    assert!(report.is_success());
    let attempts = |tag: &str| {
        report
            .targets
            .iter()
            .find(|target| target.id == Some(ReadModelId::new(tag)))
            .map(|target| target.attempts)
            .unwrap()
    };
    assert_eq!(attempts("x"), 3);
    assert_eq!(attempts("y"), 1);

    let stores_of = |tag: &str| {
        store
            .calls()
            .iter()
            .filter(|call| matches!(call, StoreCall::Store { id, .. } if id.as_str() == tag))
            .count()
    };
    assert_eq!(stores_of("x"), 3);
    assert_eq!(stores_of("y"), 1);
}

#[tokio::test]
async fn test_four_conflicts_then_success_takes_five_attempts() {
    let store = InMemoryReadModelStore::new();
    store.simulate_concurrent_writes(4);
    let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 1 })))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.targets[0].attempts, 5);
    assert_eq!(store.fetch_count(), 5);
    let stored = store.get("CartSummary", &ReadModelId::new("c1")).unwrap();
    assert_eq!(stored.version(), Version::new(5));
    assert_eq!(stored.field("projections"), Some(&json!(5)));
}

#[tokio::test]
async fn test_retry_ceiling_fails_only_that_target() {
    let store = InMemoryReadModelStore::new();
    store.fail_next_stores_with_conflict_for(ReadModelId::new("c1"), 5);
    let orchestrator = orchestrator(&store, vec![cart_summary_projection(), tag_usage_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "tags": ["x"] })))
        .await
        .unwrap();

    assert!(!report.is_success());
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].read_model_name, "CartSummary");
    assert_eq!(failures[0].attempts, 5);
    assert!(matches!(
        failures[0].result,
        Err(ProjectionError::RetriesExhausted { attempts: 5, .. })
    ));
    assert!(store.get("TagUsage", &ReadModelId::new("x")).is_some());

    let error = report.into_result().unwrap_err();
    assert!(matches!(error, ProjectionError::RetriesExhausted { .. }));
}

#[tokio::test]
async fn test_storage_failure_is_isolated_and_not_retried() {
    let store = InMemoryReadModelStore::new();
    store.fail_stores_for(ReadModelId::new("x"));
    let orchestrator = orchestrator(&store, vec![tag_usage_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "tags": ["x", "y"] })))
        .await
        .unwrap();

    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, Some(ReadModelId::new("x")));
    assert_eq!(failed[0].attempts, 1);
    assert!(matches!(
        failed[0].result,
        Err(ProjectionError::Store(ReadModelStoreError::Storage(_)))
    ));
    assert!(store.get("TagUsage", &ReadModelId::new("y")).is_some());
}

#[tokio::test]
async fn test_failure_after_conflicts_reports_every_attempt() {
    let store = InMemoryReadModelStore::new();
    store.fail_next_stores_with_conflict(2);
    store.fail_stores_for(ReadModelId::new("c1"));
    let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);

    let report = orchestrator.project(&cart(json!({ "id": "c1" }))).await.unwrap();

    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);
    assert!(matches!(
        failed[0].result,
        Err(ProjectionError::Store(ReadModelStoreError::Storage(_)))
    ));
    assert_eq!(store.store_count(), 3);
}

#[tokio::test]
async fn test_missing_join_key_is_a_silent_skip() {
    let store = InMemoryReadModelStore::new();
    let orchestrator = orchestrator(
        &store,
        vec![ProjectionMetadata::scalar(
            "Cart",
            "StoreTotals",
            "from_cart",
            "storeId",
            projection::scalar(|_: Cart, _: Option<TagUsage>| async {
                Err::<ProjectionOutcome<TagUsage>, _>(ProjectionFnError::new("must not run"))
            }),
        )],
    );

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "storeId": null })))
        .await
        .unwrap();

    assert!(report.targets.is_empty());
    assert!(report.is_success());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_unregistered_entity_type_is_ignored() {
    let store = InMemoryReadModelStore::new();
    let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);

    let report = orchestrator
        .project(&snapshot("Order", "o1", json!("not even an object")))
        .await
        .unwrap();

    assert_eq!(report.entity_type_name, "Order");
    assert!(report.targets.is_empty());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_malformed_snapshot_is_rejected() {
    let store = InMemoryReadModelStore::new();
    let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);

    let result = orchestrator.project(&snapshot("Cart", "c1", json!([1, 2]))).await;

    assert!(matches!(result, Err(ProjectionError::Entity(_))));
    assert!(store.calls().is_empty());
}

fn closing_projection(outcome: ProjectionOutcome<CartSummary>) -> ProjectionMetadata {
    ProjectionMetadata::scalar(
        "Cart",
        "CartSummary",
        "on_close",
        "id",
        projection::scalar(move |_: Cart, _: Option<CartSummary>| {
            let outcome = outcome.clone();
            async move { Ok(outcome) }
        }),
    )
}

#[tokio::test]
async fn test_delete_short_circuits_store() {
    let store = InMemoryReadModelStore::new();
    store.insert(
        "CartSummary",
        stored_read_model(json!({ "id": "c1", "itemCount": 1, "projections": 1 }), 2, 1),
    );
    let orchestrator = orchestrator(&store, vec![closing_projection(ProjectionOutcome::Deleted)]);

    let report = orchestrator.project(&cart(json!({ "id": "c1" }))).await.unwrap();

    assert_eq!(single_outcome(&report), &TargetOutcome::Deleted);
    assert_eq!(store.store_count(), 0);
    assert_eq!(store.delete_count(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_nothing_short_circuits_store_and_delete() {
    let store = InMemoryReadModelStore::new();
    store.insert(
        "CartSummary",
        stored_read_model(json!({ "id": "c1", "itemCount": 1, "projections": 1 }), 2, 1),
    );
    let orchestrator = orchestrator(&store, vec![closing_projection(ProjectionOutcome::Unchanged)]);

    let report = orchestrator.project(&cart(json!({ "id": "c1" }))).await.unwrap();

    assert_eq!(single_outcome(&report), &TargetOutcome::Unchanged);
    assert_eq!(store.store_count(), 0);
    assert_eq!(store.delete_count(), 0);
    assert_eq!(
        store.get("CartSummary", &ReadModelId::new("c1")).unwrap().version(),
        Version::new(2)
    );
}

fn failing_projection() -> ProjectionMetadata {
    ProjectionMetadata::scalar(
        "Cart",
        "CartSummary",
        "from_cart",
        "id",
        projection::scalar(|_: Cart, _: Option<CartSummary>| async {
            Err::<ProjectionOutcome<CartSummary>, _>(ProjectionFnError::new("price feed down"))
        }),
    )
}

#[tokio::test]
async fn test_suppressed_error_leaves_existing_row_untouched() {
    let store = InMemoryReadModelStore::new();
    let existing = stored_read_model(json!({ "id": "c1", "itemCount": 1, "projections": 1 }), 3, 1);
    store.insert("CartSummary", existing.clone());
    let handler = RecordingErrorHandler::suppressing();
    let orchestrator =
        ProjectionOrchestrator::builder(registry_with(vec![failing_projection()]), Arc::new(store.clone()))
            .error_handler(Arc::new(handler.clone()))
            .build()
            .unwrap();

    let report = orchestrator.project(&cart(json!({ "id": "c1" }))).await.unwrap();

    assert_eq!(single_outcome(&report), &TargetOutcome::ErrorSuppressed);
    assert_eq!(store.store_count(), 0);
    assert_eq!(store.delete_count(), 0);
    assert_eq!(store.get("CartSummary", &ReadModelId::new("c1")), Some(existing));

    let errors = handler.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "price feed down");
    assert_eq!(errors[0].entity_id, "c1");
    assert!(errors[0].had_existing);
}

#[tokio::test]
async fn test_rethrown_error_fails_only_its_target() {
    let store = InMemoryReadModelStore::new();
    let handler = RecordingErrorHandler::rethrowing();
    let orchestrator = ProjectionOrchestrator::builder(
        registry_with(vec![failing_projection(), tag_usage_projection()]),
        Arc::new(store.clone()),
    )
    .error_handler(Arc::new(handler.clone()))
    .build()
    .unwrap();

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "tags": ["x"] })))
        .await
        .unwrap();

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0].result,
        Err(ProjectionError::ProjectionFunction { projection, .. }) if projection == "CartSummary.from_cart"
    ));
    assert!(store.get("TagUsage", &ReadModelId::new("x")).is_some());
    assert_eq!(handler.errors().len(), 1);
}

fn cart_line_projection() -> ProjectionMetadata {
    ProjectionMetadata::filter(
        "Cart",
        "CartLine",
        "from_cart",
        |cart: &Entity| {
            cart.field("id")
                .map(|id| ReadModelFilter::new().eq("cartId", id.clone()))
        },
        projection::filter(
            |cart: Cart, id: Option<ReadModelId>, _: Option<CartLine>| async move {
                let id = id.map_or_else(|| format!("{}-line-1", cart.id), ReadModelId::into_inner);
                Ok(ProjectionOutcome::Updated(CartLine {
                    id,
                    cart_id: cart.id,
                    item_count: cart.item_count,
                }))
            },
        ),
    )
}

#[tokio::test]
async fn test_filter_join_updates_every_match() {
    let store = InMemoryReadModelStore::new();
    for line in ["l1", "l2"] {
        store.insert(
            "CartLine",
            stored_read_model(json!({ "id": line, "cartId": "c1", "itemCount": 1 }), 1, 1),
        );
    }
    store.insert(
        "CartLine",
        stored_read_model(json!({ "id": "l3", "cartId": "c2", "itemCount": 1 }), 1, 1),
    );
    let orchestrator = orchestrator(&store, vec![cart_line_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 9 })))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.targets.len(), 2);
    for line in ["l1", "l2"] {
        let stored = store.get("CartLine", &ReadModelId::new(line)).unwrap();
        assert_eq!(stored.field("itemCount"), Some(&json!(9)));
        assert_eq!(stored.version(), Version::new(2));
    }
    let untouched = store.get("CartLine", &ReadModelId::new("l3")).unwrap();
    assert_eq!(untouched.field("itemCount"), Some(&json!(1)));
}

#[tokio::test]
async fn test_filter_join_without_matches_creates_one_read_model() {
    let store = InMemoryReadModelStore::new();
    let orchestrator = orchestrator(&store, vec![cart_line_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 2 })))
        .await
        .unwrap();

    assert_eq!(report.targets.len(), 1);
    assert_eq!(report.targets[0].id, None);
    let stored = store.get("CartLine", &ReadModelId::new("c1-line-1")).unwrap();
    assert_eq!(stored.version(), Version::new(1));
    assert_eq!(store.search_count(), 1);
    assert_eq!(store.fetch_count(), 0);
}

#[tokio::test]
async fn test_conflict_on_new_filter_joined_read_model_refetches_produced_id() {
    let store = InMemoryReadModelStore::new();
    store.simulate_concurrent_writes(1);
    let orchestrator = orchestrator(&store, vec![cart_line_projection()]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 2 })))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.targets[0].attempts, 2);
    let line = ReadModelId::new("c1-line-1");
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::Search {
                read_model_name: "CartLine".to_string(),
                filter: ReadModelFilter::new().eq("cartId", json!("c1")),
            },
            StoreCall::Store {
                read_model_name: "CartLine".to_string(),
                id: line.clone(),
                sequence_key: None,
                expected_version: Version::INITIAL,
                version: Version::new(1),
            },
            StoreCall::Fetch {
                read_model_name: "CartLine".to_string(),
                id: line.clone(),
                sequence_key: None,
            },
            StoreCall::Store {
                read_model_name: "CartLine".to_string(),
                id: line.clone(),
                sequence_key: None,
                expected_version: Version::new(1),
                version: Version::new(2),
            },
        ]
    );
    assert_eq!(store.get("CartLine", &line).unwrap().version(), Version::new(2));
}

#[tokio::test]
async fn test_filter_join_on_sequenced_rows_targets_each_id_once() {
    let store = InMemoryReadModelStore::new();
    for tick in ["t1", "t2"] {
        store.insert_sequenced(
            "LineTicks",
            &SequenceKey::new("tickedAt", tick),
            stored_read_model(
                json!({ "id": "l1", "cartId": "c1", "hits": 5, "tickedAt": tick }),
                1,
                1,
            ),
        );
    }
    let line_ticks = ProjectionMetadata::filter(
        "Cart",
        "LineTicks",
        "from_cart",
        |cart: &Entity| {
            cart.field("id")
                .map(|id| ReadModelFilter::new().eq("cartId", id.clone()))
        },
        projection::filter(
            |cart: Cart, id: Option<ReadModelId>, existing: Option<LineTick>| async move {
                let hits = existing.map_or(0, |tick| tick.hits);
                Ok(ProjectionOutcome::Updated(LineTick {
                    id: id.map_or_else(|| format!("{}-line-1", cart.id), ReadModelId::into_inner),
                    cart_id: cart.id,
                    hits: hits + 1,
                }))
            },
        ),
    );
    let orchestrator = orchestrator(&store, vec![line_ticks]);

    let report = orchestrator
        .project(&cart(json!({ "id": "c1", "tickedAt": "t3" })))
        .await
        .unwrap();

    assert_eq!(report.targets.len(), 1, "one target per id: {report:?}");
    assert_eq!(report.targets[0].id, Some(ReadModelId::new("l1")));
    let t3 = SequenceKey::new("tickedAt", "t3");
    assert_eq!(report.targets[0].sequence_key, Some(t3.clone()));

    let stored = store
        .get_sequenced("LineTicks", &ReadModelId::new("l1"), &t3)
        .unwrap();
    assert_eq!(stored.field("hits"), Some(&json!(1)));
    assert_eq!(stored.version(), Version::new(1));
    assert_eq!(store.all("LineTicks").len(), 3);
}

#[tokio::test]
async fn test_sequenced_read_models_get_one_row_per_sequence_value() {
    let store = InMemoryReadModelStore::new();
    let ticks = ProjectionMetadata::scalar(
        "Cart",
        "CartTicks",
        "from_cart",
        "id",
        projection::scalar(|cart: Cart, _: Option<TagUsage>| async move {
            Ok(ProjectionOutcome::Updated(TagUsage {
                id: cart.id,
                carts: cart.item_count,
            }))
        }),
    );
    let orchestrator = orchestrator(&store, vec![ticks]);

    for (tick, count) in [("t1", 1), ("t2", 2)] {
        orchestrator
            .project(&cart(json!({ "id": "c1", "itemCount": count, "tickedAt": tick })))
            .await
            .unwrap()
            .into_result()
            .unwrap();
    }

    let id = ReadModelId::new("c1");
    let first = store
        .get_sequenced("CartTicks", &id, &SequenceKey::new("tickedAt", "t1"))
        .unwrap();
    let second = store
        .get_sequenced("CartTicks", &id, &SequenceKey::new("tickedAt", "t2"))
        .unwrap();
    assert_eq!(first.field("carts"), Some(&json!(1)));
    assert_eq!(first.field("tickedAt"), Some(&json!("t1")));
    assert_eq!(second.field("carts"), Some(&json!(2)));
    assert_eq!(second.version(), Version::new(1));
}

fn summary_registry_at(schema_version: u32, projection: ProjectionMetadata) -> ProjectionRegistry {
    ProjectionRegistry::builder()
        .read_model(ReadModelConfig::new("CartSummary").schema_version(schema_version))
        .projection(projection)
        .build()
        .unwrap()
}

fn summary_migrator(registry: &ProjectionRegistry) -> VersionedSchemaMigrator {
    VersionedSchemaMigrator::for_registry(registry).step("CartSummary", 1, |mut fields| {
        let count = fields
            .remove("count")
            .ok_or_else(|| "missing count".to_string())?;
        fields.insert("itemCount".to_string(), count);
        Ok(fields)
    })
}

#[tokio::test]
async fn test_migrator_disagreeing_with_registry_is_rejected() {
    let store = InMemoryReadModelStore::new();
    let migrator = VersionedSchemaMigrator::new().latest_version("CartSummary", 2);

    let result = ProjectionOrchestrator::builder(
        summary_registry_at(1, cart_summary_projection()),
        Arc::new(store),
    )
    .migrator(Arc::new(migrator))
    .build();

    assert_eq!(
        result.err(),
        Some(ConfigError::SchemaVersionMismatch {
            read_model_name: "CartSummary".to_string(),
            configured: 1,
            migrated: 2,
        })
    );
}

#[tokio::test]
async fn test_new_read_models_are_created_at_the_migrated_schema() {
    let store = InMemoryReadModelStore::new();
    let registry = summary_registry_at(2, cart_summary_projection());
    let migrator = summary_migrator(&registry);
    let orchestrator = ProjectionOrchestrator::builder(registry, Arc::new(store.clone()))
        .migrator(Arc::new(migrator))
        .build()
        .unwrap();

    for count in [1, 2] {
        orchestrator
            .project(&cart(json!({ "id": "c1", "itemCount": count })))
            .await
            .unwrap()
            .into_result()
            .unwrap();
    }

    let stored = store.get("CartSummary", &ReadModelId::new("c1")).unwrap();
    assert_eq!(stored.schema_version(), Some(2));
    assert_eq!(stored.version(), Version::new(2));
    assert_eq!(stored.field("projections"), Some(&json!(2)));
}

#[tokio::test]
async fn test_delete_receives_the_migrated_read_model() {
    let store = InMemoryReadModelStore::new();
    store.insert(
        "CartSummary",
        stored_read_model(json!({ "id": "c1", "count": 2, "projections": 1 }), 4, 1),
    );
    let registry = summary_registry_at(2, closing_projection(ProjectionOutcome::Deleted));
    let migrator = summary_migrator(&registry);
    let orchestrator = ProjectionOrchestrator::builder(registry, Arc::new(store.clone()))
        .migrator(Arc::new(migrator))
        .build()
        .unwrap();

    let report = orchestrator.project(&cart(json!({ "id": "c1" }))).await.unwrap();

    assert_eq!(single_outcome(&report), &TargetOutcome::Deleted);
    assert_eq!(store.store_count(), 0);
    let deleted: Vec<_> = store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::Delete { read_model, .. } => Some(read_model),
            _ => None,
        })
        .collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].schema_version(), Some(2));
    assert_eq!(deleted[0].field("itemCount"), Some(&json!(2)));
    assert_eq!(deleted[0].field("count"), None);
    assert_eq!(deleted[0].version(), Version::new(4));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_stored_read_model_is_migrated_before_projection() {
    let store = InMemoryReadModelStore::new();
    store.insert(
        "CartSummary",
        stored_read_model(json!({ "id": "c1", "count": 2, "runs": 6 }), 4, 1),
    );
    let registry = summary_registry_at(2, cart_summary_projection());
    let migrator = VersionedSchemaMigrator::for_registry(&registry).step(
        "CartSummary",
        1,
        |mut fields| {
            let count = fields.remove("count").unwrap_or_default();
            let runs = fields.remove("runs").unwrap_or_default();
            fields.insert("itemCount".to_string(), count);
            fields.insert("projections".to_string(), runs);
            Ok(fields)
        },
    );
    let orchestrator = ProjectionOrchestrator::builder(registry, Arc::new(store.clone()))
        .migrator(Arc::new(migrator))
        .build()
        .unwrap();

    orchestrator
        .project(&cart(json!({ "id": "c1", "itemCount": 3 })))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let stored = store.get("CartSummary", &ReadModelId::new("c1")).unwrap();
    assert_eq!(stored.field("projections"), Some(&json!(7)));
    assert_eq!(stored.field("count"), None);
    assert_eq!(stored.schema_version(), Some(2));
    assert_eq!(stored.version(), Version::new(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_snapshots_never_lose_updates() {
    let store = InMemoryReadModelStore::new();
    let totals = ProjectionMetadata::scalar(
        "Cart",
        "StoreTotals",
        "from_cart",
        "storeId",
        projection::scalar(|cart: Cart, existing: Option<TagUsage>| async move {
            let carts = existing.map_or(0, |totals| totals.carts);
            Ok(ProjectionOutcome::Updated(TagUsage {
                id: cart.store_id.unwrap_or_default(),
                carts: carts + 1,
            }))
        }),
    );
    let orchestrator = ProjectionOrchestrator::builder(registry_with(vec![totals]), Arc::new(store.clone()))
        .retry_policy(RetryPolicy::builder().max_attempts(100).build())
        .build()
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|n| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .project(&cart(json!({ "id": format!("c{n}"), "storeId": "s1" })))
                    .await
                    .unwrap()
                    .into_result()
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let totals = store.get("StoreTotals", &ReadModelId::new("s1")).unwrap();
    assert_eq!(totals.field("carts"), Some(&json!(10)));
    assert_eq!(totals.version(), Version::new(10));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_versions_increase_by_one_per_successful_write(
        conflicts in proptest::collection::vec(0usize..4, 1..8)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = InMemoryReadModelStore::new();
            let orchestrator = orchestrator(&store, vec![cart_summary_projection()]);
            let id = ReadModelId::new("c1");

            for (n, conflicts) in conflicts.iter().enumerate() {
                store.fail_next_stores_with_conflict(*conflicts);
                orchestrator
                    .project(&cart(json!({ "id": "c1", "itemCount": n })))
                    .await
                    .unwrap()
                    .into_result()
                    .unwrap();

                let stored = store.get("CartSummary", &id).unwrap();
                prop_assert_eq!(stored.version(), Version::new(n as u64 + 1));
                prop_assert_eq!(stored.field("projections"), Some(&json!(n + 1)));
            }
            Ok(())
        })?;
    }
}
