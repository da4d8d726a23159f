//! Shopping cart read models.
//!
//! Three projections of the `Cart` entity:
//! - `CartSummary`: one row per cart (scalar join on `id`)
//! - `ProductPopularity`: one row per product in the cart (array join on `productIds`)
//! - `CartActivity`: one row per cart and day (scalar join, sequenced by `day`)

use readside_core::config::{ConfigError, ProjectionRegistry, ReadModelConfig};
use readside_core::migration::VersionedSchemaMigrator;
use readside_core::projection::{self, ProjectionFnError, ProjectionMetadata, ProjectionOutcome};
use readside_core::read_model::ReadModelId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cart entity, as rebuilt from its events.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cart {
    /// Cart id
    pub id: String,
    /// Products currently in the cart
    pub product_ids: Vec<String>,
    /// Total price in cents
    pub total_cents: u64,
    /// Whether the cart was checked out
    pub checked_out: bool,
    /// Whether the cart was abandoned
    pub abandoned: bool,
    /// Calendar day of the last change, `YYYY-MM-DD`
    pub day: Option<String>,
}

/// One row per cart.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSummary {
    /// Cart id
    pub id: String,
    /// Number of distinct products
    pub item_count: usize,
    /// Total price in cents
    pub total_cents: u64,
    /// Checked out?
    pub checked_out: bool,
}

/// One row per product.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPopularity {
    /// Product id
    pub id: String,
    /// Number of cart snapshots the product appeared in
    pub appearances: u64,
}

/// One row per cart and day.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartActivity {
    /// Cart id
    pub id: String,
    /// Changes that day
    pub changes: u64,
}

fn cart_summary(cart: Cart, _existing: Option<CartSummary>) -> ProjectionOutcome<CartSummary> {
    if cart.abandoned {
        return ProjectionOutcome::Deleted;
    }
    ProjectionOutcome::Updated(CartSummary {
        item_count: cart.product_ids.len(),
        total_cents: cart.total_cents,
        checked_out: cart.checked_out,
        id: cart.id,
    })
}

fn product_popularity(
    cart: &Cart,
    id: ReadModelId,
    existing: Option<ProductPopularity>,
) -> Result<ProjectionOutcome<ProductPopularity>, ProjectionFnError> {
    if cart.checked_out {
        return Ok(ProjectionOutcome::Unchanged);
    }
    let appearances = existing.map_or(0, |product| product.appearances);
    Ok(ProjectionOutcome::Updated(ProductPopularity {
        id: id.into_inner(),
        appearances: appearances + 1,
    }))
}

/// Build the registry of all cart projections.
///
/// # Errors
///
/// Returns [`ConfigError`] if the registrations are inconsistent.
pub fn registry() -> Result<ProjectionRegistry, ConfigError> {
    ProjectionRegistry::builder()
        .read_model(ReadModelConfig::new("CartSummary").schema_version(2))
        .read_model(ReadModelConfig::new("ProductPopularity"))
        .read_model(ReadModelConfig::new("CartActivity").sequence_key("day"))
        .projection(ProjectionMetadata::scalar(
            "Cart",
            "CartSummary",
            "from_cart",
            "id",
            projection::scalar(|cart: Cart, existing: Option<CartSummary>| async move {
                Ok(cart_summary(cart, existing))
            }),
        ))
        .projection(ProjectionMetadata::array(
            "Cart",
            "ProductPopularity",
            "from_cart",
            "productIds",
            projection::array(
                |cart: Cart, id: ReadModelId, existing: Option<ProductPopularity>| async move {
                    product_popularity(&cart, id, existing)
                },
            ),
        ))
        .projection(ProjectionMetadata::scalar(
            "Cart",
            "CartActivity",
            "from_cart",
            "id",
            projection::scalar(|cart: Cart, existing: Option<CartActivity>| async move {
                let changes = existing.map_or(0, |activity| activity.changes);
                Ok(ProjectionOutcome::Updated(CartActivity {
                    id: cart.id,
                    changes: changes + 1,
                }))
            }),
        ))
        .build()
}

/// Schema migrations of the cart read models.
///
/// Targets the schema versions of `registry`. `CartSummary` v1 stored the price
/// as `total` in whole units.
#[must_use]
pub fn migrator(registry: &ProjectionRegistry) -> VersionedSchemaMigrator {
    VersionedSchemaMigrator::for_registry(registry)
        .step("CartSummary", 1, |mut fields| {
            let total = fields
                .remove("total")
                .and_then(|total| total.as_u64())
                .ok_or_else(|| "missing total".to_string())?;
            fields.insert("totalCents".to_string(), Value::from(total * 100));
            Ok(fields)
        })
}
