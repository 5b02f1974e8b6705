use crate::{
    db::DbPool,
    entities::product::{self, Entity as ProductEntity},
    errors::ServiceError,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, instrument};

/// Sentinel code used when a cart item carries no recognizable identifier.
pub const UNKNOWN_PRODUCT_CODE: &str = "unknown-product";

/// Default billing cycle when checkout did not send one.
const DEFAULT_BILLING_CYCLE: &str = "monthly";

/// Service category of a cart line item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceCategory {
    #[default]
    Hosting,
    Email,
    Domain,
    Ssl,
    Addon,
}

/// Canonical descriptor produced from one loosely-typed cart line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub code: String,
    pub name: String,
    pub billing_cycle: String,
    /// Always minor units after normalization.
    pub price_minor: i64,
    pub quantity: i32,
    pub category: ServiceCategory,
}

fn string_field(item: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match item.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn numeric_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a serde_json::Number> {
    for key in keys {
        if let Some(Value::Number(n)) = item.get(key) {
            return Some(n);
        }
    }
    None
}

/// Converts a raw price number to minor units. Integer JSON numbers are
/// taken as minor units already; floats are major units. An explicit
/// `unit` tag on the item ("minor" | "major") overrides the guess. The
/// intake path reuses this for the top-level order amount so both follow
/// one documented rule.
pub fn price_to_minor(raw: &serde_json::Number, unit: Option<&str>) -> i64 {
    match unit {
        Some("minor") => raw
            .as_i64()
            .or_else(|| raw.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        Some("major") => raw.as_f64().map(|f| (f * 100.0).round() as i64).unwrap_or(0),
        _ => {
            if let Some(i) = raw.as_i64() {
                i
            } else if let Some(f) = raw.as_f64() {
                (f * 100.0).round() as i64
            } else {
                0
            }
        }
    }
}

/// Infers the service category from the product code when checkout sent no
/// explicit type.
fn infer_category(code: &str) -> ServiceCategory {
    let lowered = code.to_lowercase();
    if lowered.contains("email") || lowered.contains("mail") {
        ServiceCategory::Email
    } else if lowered.contains("domain") {
        ServiceCategory::Domain
    } else if lowered.contains("ssl") {
        ServiceCategory::Ssl
    } else if lowered.contains("addon") {
        ServiceCategory::Addon
    } else {
        ServiceCategory::Hosting
    }
}

/// Normalizes one cart line item. Never fails: an unrecognizable item
/// still yields a descriptor with the `unknown-product` sentinel code and
/// a zero price. Field precedence is part of the wire contract:
/// code <- code | productCode | product_code | slug | id;
/// price <- priceMinorUnits | price_minor_units | price | amount;
/// quantity <- quantity | 1; category <- type | code inference | hosting.
pub fn normalize_item(item: &Value) -> NormalizedItem {
    let code = string_field(item, &["code", "productCode", "product_code"])
        .or_else(|| string_field(item, &["slug"]))
        .or_else(|| string_field(item, &["id"]))
        .unwrap_or_else(|| UNKNOWN_PRODUCT_CODE.to_string());

    let name = string_field(item, &["name", "productName", "title"]).unwrap_or_else(|| code.clone());

    let billing_cycle = string_field(item, &["billingCycle", "billing_cycle", "cycle"])
        .unwrap_or_else(|| DEFAULT_BILLING_CYCLE.to_string());

    let unit = string_field(item, &["unit"]);
    let price_minor = numeric_field(
        item,
        &["priceMinorUnits", "price_minor_units", "price", "amount"],
    )
    .map(|n| price_to_minor(n, unit.as_deref()))
    .unwrap_or(0);

    let quantity = numeric_field(item, &["quantity"])
        .and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)))
        .filter(|q| *q >= 1)
        .unwrap_or(1) as i32;

    let category = string_field(item, &["type", "category"])
        .and_then(|t| t.to_lowercase().parse::<ServiceCategory>().ok())
        .unwrap_or_else(|| infer_category(&code));

    NormalizedItem {
        code,
        name,
        billing_cycle,
        price_minor,
        quantity,
        category,
    }
}

/// Lenient path: normalize a whole cart without consulting the catalog.
/// Every item yields a descriptor, resolvable or not. Used for audit and
/// preview surfaces; intake uses the strict per-item lookup instead.
pub fn normalize_cart(cart: &[Value]) -> Vec<NormalizedItem> {
    cart.iter().map(normalize_item).collect()
}

/// Catalog lookups over the `products` table. Normalization itself never
/// touches the database; only the strict path does.
#[derive(Clone)]
pub struct CatalogService {
    db_pool: Arc<DbPool>,
}

impl CatalogService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Strict resolution: normalize, then require an active catalog row
    /// for the normalized code. Returns `None` on a catalog miss so the
    /// caller can skip the item without aborting the order.
    #[instrument(skip(self, item))]
    pub async fn resolve_strict(
        &self,
        item: &Value,
    ) -> Result<Option<(NormalizedItem, product::Model)>, ServiceError> {
        Self::resolve_strict_on(&*self.db_pool, item).await
    }

    /// Strict resolution against any connection, so intake can resolve
    /// items inside its order transaction.
    pub async fn resolve_strict_on<C: sea_orm::ConnectionTrait>(
        conn: &C,
        item: &Value,
    ) -> Result<Option<(NormalizedItem, product::Model)>, ServiceError> {
        let normalized = normalize_item(item);

        let found = ProductEntity::find()
            .filter(product::Column::Code.eq(normalized.code.clone()))
            .filter(product::Column::Active.eq(true))
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        match found {
            Some(product) => Ok(Some((normalized, product))),
            None => {
                debug!(code = %normalized.code, "cart item did not resolve to a catalog product");
                Ok(None)
            }
        }
    }
}
